//! Typed failures.
//!
//! Fallible operations in this crate return [anyhow::Result]. Where callers need to react to a specific failure, the
//! error is one of the enums below and can be recovered with [anyhow::Error::downcast_ref]. [is_permanent] separates
//! failures which a retry cannot fix from transient I/O.

use thiserror::Error;
use uuid::Uuid;

use crate::machine::ProcessPlatform;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("group event {0} has already been recorded")]
    DuplicateEvent(String),
    #[error("group event {process}:{nonce} is not pending")]
    NotPending { process: Uuid, nonce: u64 },
    #[error("nonce {nonce} of process {process} is already used by a different event")]
    NonceTaken { process: Uuid, nonce: u64 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("address born at block {birth} is too young at height {height}")]
    AddressTooYoung { birth: u64, height: u64 },
    #[error("cost {cost} exceeds budget {budget}")]
    CostExceedsBudget { cost: u128, budget: u128 },
    #[error("chain rpc failed: {0}")]
    Rpc(#[source] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("event truncated reading {field}")]
    Truncated { field: &'static str },
    #[error("{0} trailing bytes after event")]
    Trailing(usize),
    #[error("{field} is too long ({len} bytes)")]
    TooLong { field: &'static str, len: usize },
    #[error("malformed abi payload: {0}")]
    Abi(String),
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("unknown process {0}")]
    UnknownProcess(Uuid),
    #[error("process {0} is disabled")]
    ProcessDisabled(Uuid),
    #[error("no engine registered for platform {0}")]
    UnknownPlatform(ProcessPlatform),
    #[error("invalid partial signature for {process}:{nonce}: {reason}")]
    InvalidPartial {
        process: Uuid,
        nonce: u64,
        reason: String,
    },
    #[error("group transport is closed")]
    TransportClosed,
}

/// Returns true if retrying the operation which produced `err` cannot succeed.
pub fn is_permanent(err: &anyhow::Error) -> bool {
    if let Some(err) = err.downcast_ref::<EngineError>() {
        return !matches!(err, EngineError::Rpc(_));
    }
    err.is::<StoreError>() || err.is::<EncodingError>() || err.is::<MachineError>()
}
