use std::{ops::Deref, path::PathBuf, str::FromStr, time::Duration};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::crypto::SecretKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The location of persistence data. If not set, uses a temporary in-memory database.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Size of the database's in-memory cache, in bytes.
    #[serde(default = "db_cache_size_default")]
    pub db_cache_size: usize,
    /// The port to serve status queries on.
    #[serde(default = "status_port_default")]
    pub status_port: u16,
    pub machine: MachineConfig,
    pub quorum: QuorumConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.machine.validate()?;
        self.quorum.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    /// This member's signing key.
    pub key: SecretKey,
    /// Addresses of every member of the group, including this one.
    pub members: Vec<Address>,
    /// Number of distinct member signatures which make up a quorum.
    pub threshold: usize,
    /// Signed events are expired, oldest first, once their total estimated cost exceeds this.
    #[serde(default = "retention_budget_default")]
    pub retention_budget: Amount,
    #[serde(default = "poll_interval_default")]
    pub poll_interval: Duration,
    /// Maximum number of events handled per process in one loop iteration.
    #[serde(default = "batch_limit_default")]
    pub batch_limit: usize,
    #[serde(default = "max_consecutive_failures_default")]
    pub max_consecutive_failures: u32,
    #[serde(default = "max_backoff_default")]
    pub max_backoff: Duration,
}

impl MachineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 || self.threshold > self.members.len() {
            return Err(anyhow!(
                "threshold {} is invalid for {} members",
                self.threshold,
                self.members.len()
            ));
        }
        if !self.members.contains(&self.key.address()) {
            return Err(anyhow!(
                "the machine key ({}) is not one of the members",
                self.key.address()
            ));
        }
        if self.batch_limit == 0 {
            return Err(anyhow!("batch_limit must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuorumConfig {
    /// JSON-RPC endpoint of the EVM chain.
    pub rpc_url: Url,
    /// Master key for notifier keys. Without it, the engine observes its contracts but never submits to them.
    #[serde(default)]
    pub key: Option<SecretKey>,
    #[serde(default = "chain_id_default")]
    pub chain_id: u64,
    #[serde(default = "gas_price_default")]
    pub gas_price: Amount,
    #[serde(default = "gas_limit_default")]
    pub gas_limit: u64,
    /// Base interval of the engine's loops.
    #[serde(default = "clock_tick_default")]
    pub clock_tick: Duration,
    /// Number of blocks fetched in one log query.
    #[serde(default = "log_window_default")]
    pub log_window: u64,
    /// Blocks a contract must have existed for before it is trusted.
    #[serde(default = "confirmations_default")]
    pub confirmations: u64,
    /// Maximum number of events submitted in one iteration of the outbound loop.
    #[serde(default = "batch_limit_default")]
    pub outbound_batch: usize,
    #[serde(default = "max_consecutive_failures_default")]
    pub max_consecutive_failures: u32,
    #[serde(default = "max_backoff_default")]
    pub max_backoff: Duration,
}

impl QuorumConfig {
    pub fn new(rpc_url: Url, key: Option<SecretKey>) -> Self {
        QuorumConfig {
            rpc_url,
            key,
            chain_id: chain_id_default(),
            gas_price: gas_price_default(),
            gas_limit: gas_limit_default(),
            clock_tick: clock_tick_default(),
            log_window: log_window_default(),
            confirmations: confirmations_default(),
            outbound_batch: batch_limit_default(),
            max_consecutive_failures: max_consecutive_failures_default(),
            max_backoff: max_backoff_default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_window == 0 {
            return Err(anyhow!("log_window must be positive"));
        }
        if self.outbound_batch == 0 {
            return Err(anyhow!("outbound_batch must be positive"));
        }
        Ok(())
    }
}

pub fn db_cache_size_default() -> usize {
    256 * 1024 * 1024
}

pub fn status_port_default() -> u16 {
    7080
}

pub fn retention_budget_default() -> Amount {
    Amount(1_000_000_000_000_000_000)
}

pub fn poll_interval_default() -> Duration {
    Duration::from_secs(3)
}

pub fn batch_limit_default() -> usize {
    100
}

pub fn max_consecutive_failures_default() -> u32 {
    10
}

pub fn max_backoff_default() -> Duration {
    Duration::from_secs(60)
}

pub fn chain_id_default() -> u64 {
    1
}

pub fn gas_price_default() -> Amount {
    Amount(10_000)
}

pub fn gas_limit_default() -> u64 {
    100_000_000
}

pub fn clock_tick_default() -> Duration {
    Duration::from_secs(3)
}

pub fn log_window_default() -> u64 {
    10
}

pub fn confirmations_default() -> u64 {
    128
}

/// Wrapper for [u128] that (de)serializes with a string. `serde_toml` does not support `u128`s.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Amount(pub u128);

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}

impl Deref for Amount {
    type Target = u128;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut res = String::deserialize(deserializer)?;
        // Remove underscores
        res.retain(|c| c != '_');
        Ok(Amount(
            u128::from_str(&res).map_err(serde::de::Error::custom)?,
        ))
    }
}
