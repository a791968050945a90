//! The relay contract's interface.

use alloy::{
    primitives::B256,
    sol,
    sol_types::{SolCall, SolEvent},
};

use crate::{encoding::Event, error::EncodingError};

sol! {
    event MixinTransaction(bytes raw);

    function mixin(bytes raw) returns (bool);

    function nonce() view returns (uint64);
}

pub const EVENT_TOPIC: B256 = MixinTransaction::SIGNATURE_HASH;
pub const MIXIN_SELECTOR: [u8; 4] = mixinCall::SELECTOR;
pub const NONCE_SELECTOR: [u8; 4] = nonceCall::SELECTOR;

fn abi_error(e: alloy::sol_types::Error) -> EncodingError {
    EncodingError::Abi(e.to_string())
}

/// Calldata for `mixin(bytes)` carrying the encoded `event`.
pub fn mixin_call(event: &Event) -> Result<Vec<u8>, EncodingError> {
    Ok(mixinCall {
        raw: event.encode()?.into(),
    }
    .abi_encode())
}

/// Calldata for `nonce()`.
pub fn nonce_call() -> Vec<u8> {
    nonceCall {}.abi_encode()
}

/// Decodes the data of a `MixinTransaction` log into the event it carries.
pub fn decode_log(data: &[u8]) -> Result<Event, EncodingError> {
    let (raw,) = MixinTransaction::abi_decode_data(data, true).map_err(abi_error)?;
    Event::decode(&raw)
}

/// Decodes the return data of `nonce()`.
pub fn decode_nonce(data: &[u8]) -> Result<u64, EncodingError> {
    Ok(nonceCall::abi_decode_returns(data, true)
        .map_err(abi_error)?
        ._0)
}

/// Log data of a `MixinTransaction` log carrying `event`.
#[cfg(any(test, feature = "fake_chain"))]
pub fn encode_log(event: &Event) -> Result<Vec<u8>, EncodingError> {
    Ok(MixinTransaction {
        raw: event.encode()?.into(),
    }
    .encode_data())
}
