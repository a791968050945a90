//! The process supervisor and the contracts it relies on.
//!
//! A [Machine] owns the set of chain engines and sits between the group transport and those engines. Events from
//! the group are quorum-signed and then handed to the engine of their process. Events an engine observes on its chain
//! are replayed into the group. All durable state goes through a [Store].

mod message;
mod signer;
mod supervisor;
mod types;

use anyhow::Result;
use async_trait::async_trait;
pub use message::{InboundGroupMessage, OutboundGroupMessage};
pub use signer::GroupSigner;
pub use supervisor::Machine;
pub use types::{AccountSnapshot, Process, ProcessPlatform};
use uuid::Uuid;

use crate::encoding::Event;

/// Persistence used by the [Machine].
///
/// Every operation is atomic. Failures a caller is expected to handle are reported as a
/// [crate::error::StoreError].
pub trait Store: Send + Sync {
    fn event_seen(&self, id: &str) -> Result<bool>;
    /// Records `event` as pending under the idempotency identifier `id`.
    fn write_pending(&self, event: &Event, id: &str) -> Result<()>;
    fn list_pending(&self, limit: usize) -> Result<Vec<Event>>;
    fn read_pending(&self, process: Uuid, nonce: u64) -> Result<Option<Event>>;
    fn count_pending(&self) -> Result<u64>;

    fn read_partial_signatures(&self, process: Uuid, nonce: u64) -> Result<Vec<Vec<u8>>>;
    /// Replaces the partial signatures of an event. The caller supplies the complete set.
    fn write_partial_signatures(&self, process: Uuid, nonce: u64, partials: &[Vec<u8>])
    -> Result<()>;

    /// Deletes the pending entry, writes the signed event and clears its partial signatures in one transaction.
    fn write_signed_and_expire_pending(&self, event: &Event) -> Result<()>;
    fn read_signed(&self, process: Uuid, nonce: u64) -> Result<Option<Event>>;
    fn list_signed(&self, process: Uuid, limit: usize) -> Result<Vec<Event>>;
    /// Returns up to `limit` signed events of `process` with a nonce of at least `nonce`, oldest first.
    fn list_signed_from(&self, process: Uuid, nonce: u64, limit: usize) -> Result<Vec<Event>>;
    /// Deletes signed events, oldest nonce first, while the total cost of those still stored exceeds `max_cost`.
    /// Returns the number of events deleted.
    fn expire_signed_with_cost(&self, events: &[(Event, u128)], max_cost: u128) -> Result<usize>;

    fn read_offset(&self, process: Uuid) -> Result<u64>;
    /// Moves the offset of `process` forward. Returns false, without writing, if `offset` is not greater than the
    /// stored value.
    fn write_offset(&self, process: Uuid, offset: u64) -> Result<bool>;

    /// Returns true if an identical snapshot has already been written.
    fn check_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<bool>;
    fn write_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<()>;

    fn list_processes(&self) -> Result<Vec<Process>>;
    fn read_process(&self, id: Uuid) -> Result<Option<Process>>;
    fn write_process(&self, process: &Process) -> Result<()>;
}

/// A chain family the group can bridge to.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Checks that `address` is a genuine contract which is old enough to trust. `proof` identifies its creation.
    async fn verify_address(&self, address: &str, proof: &[u8]) -> Result<()>;
    /// Prepares the per-address key used to submit transactions to `address`. Idempotent.
    async fn setup_notifier(&self, address: &str) -> Result<()>;
    /// The cost, in the chain's native unit, of submitting `events`.
    fn estimate_cost(&self, events: &[Event]) -> Result<u128>;
    /// Queues signed events for submission. Events which are already queued are ignored.
    async fn ensure_send_group_events(&self, address: &str, events: &[Event]) -> Result<()>;
    /// Returns up to `limit` events observed at `address` with a nonce of at least `offset`, in ascending nonce order.
    async fn receive_group_events(
        &self,
        address: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Event>>;
}
