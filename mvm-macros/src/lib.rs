
use proc_macro::TokenStream;

/// Runs an async integration test once per RNG seed, on a multi-threaded runtime.
///
/// The test function takes a `Harness`, built by the test crate's `crate::Harness::new` from a seeded RNG.
/// * `MVM_TEST_RNG_SEED` runs a single case with the given seed.
/// * `MVM_TEST_SAMPLES` runs that many cases, seeded `0..n`. Defaults to 1.
///
/// Cases run one after another, each with its own log subscriber and a time limit. A failing case prints its seed.
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
