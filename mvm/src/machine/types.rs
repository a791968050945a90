use std::fmt::{self, Display};

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{crypto::Hash, encoding::Event};

/// Tags the chain family a process lives on. Engines are registered with the [super::Machine] under one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessPlatform {
    /// EVM chains which verify quorum signatures in a relay contract.
    Quorum,
}

impl Display for ProcessPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessPlatform::Quorum => write!(f, "quorum"),
        }
    }
}

/// Binds a group identity to one address on an external chain. Processes are never deleted, only disabled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub platform: ProcessPlatform,
    pub address: String,
    pub disabled: bool,
}

impl Process {
    pub fn new(id: Uuid, platform: ProcessPlatform, address: impl Into<String>) -> Self {
        Process {
            id,
            platform,
            address: address.into(),
            disabled: false,
        }
    }
}

/// The state of an external account as observed in one chain event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub process: Uuid,
    pub address: String,
    pub nonce: u64,
    pub asset: Uuid,
    pub amount: U256,
}

impl AccountSnapshot {
    pub fn from_event(process: &Process, event: &Event) -> Self {
        AccountSnapshot {
            process: process.id,
            address: process.address.clone(),
            nonce: event.nonce,
            asset: event.asset,
            amount: event.amount,
        }
    }

    /// Snapshots are keyed by this hash, so observing identical state twice maps to the same record.
    pub fn hash(&self) -> Hash {
        Hash::compute([
            &self.process.as_bytes()[..],
            self.address.as_bytes(),
            &self.nonce.to_be_bytes()[..],
            &self.asset.as_bytes()[..],
            &self.amount.to_be_bytes::<32>()[..],
        ])
    }
}
