//! The EVM chain engine.
//!
//! Each process on this platform is bound to a relay contract. Signed group events are submitted to the contract's
//! `mixin(bytes)` method by a per-contract notifier key, and the contract's `MixinTransaction(bytes)` logs are read
//! back as inbound events. Engine state lives in the engine's own tables of the shared [Db].

mod chain;
pub mod contracts;
mod loops;
mod transaction;

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
};

use alloy::primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
pub use chain::{AlloyRpc, ChainRpc, ContractCreation};
#[cfg(any(test, feature = "fake_chain"))]
pub use chain::FakeChain;
pub use loops::admit_events;
use serde::{Deserialize, Serialize};
use tokio::{select, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
pub use transaction::sign_group_event_transaction;

use crate::{
    cfg::QuorumConfig,
    crypto::SecretKey,
    db::Db,
    encoding::Event,
    error::EngineError,
    machine::{self, ProcessPlatform},
    retry::{self, RetryPolicy},
};

/// Transaction gas charged for every call, before calldata.
const BASE_TRANSACTION_GAS: u128 = 21_000;
const ZERO_BYTE_GAS: u128 = 4;
const NONZERO_BYTE_GAS: u128 = 16;

/// The notifier of a contract, persisted by [Engine::setup_notifier].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierState {
    /// Seed of the notifier's signing key.
    pub seed: [u8; 32],
    pub state: String,
}

impl NotifierState {
    pub const INITIAL: &'static str = "initial";

    fn new(seed: [u8; 32]) -> Self {
        NotifierState {
            seed,
            state: Self::INITIAL.to_owned(),
        }
    }

    pub fn key(&self) -> Result<SecretKey> {
        SecretKey::from_bytes(&self.seed)
    }
}

pub struct Engine<R: ChainRpc = AlloyRpc> {
    db: Arc<Db>,
    rpc: Arc<R>,
    config: QuorumConfig,
}

impl Engine<AlloyRpc> {
    pub fn connect(db: Arc<Db>, config: QuorumConfig) -> Self {
        let rpc = AlloyRpc::new(config.rpc_url.clone());
        Engine::new(db, Arc::new(rpc), config)
    }
}

impl<R: ChainRpc> Engine<R> {
    pub fn new(db: Arc<Db>, rpc: Arc<R>, config: QuorumConfig) -> Self {
        Engine { db, rpc, config }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.max_consecutive_failures,
            self.config.clock_tick,
            self.config.max_backoff,
        )
    }

    /// Returns the key which submits transactions to `contract`, if this engine can submit at all.
    pub fn notifier_key(&self, contract: Address) -> Result<Option<SecretKey>> {
        self.db
            .read()?
            .contract_notifiers()?
            .get(contract)?
            .map(|notifier| notifier.key())
            .transpose()
    }

    /// Contracts which passed verification and are bound to an enabled process.
    fn active_contracts(&self) -> Result<HashSet<Address>> {
        let tx = self.db.read()?;
        let verified: HashSet<_> = tx.contract_logs_offset()?.contracts()?.into_iter().collect();
        Ok(tx
            .processes()?
            .list()?
            .into_iter()
            .filter(|process| process.platform == ProcessPlatform::Quorum && !process.disabled)
            .filter_map(|process| parse_address(&process.address).ok())
            .filter(|contract| verified.contains(contract))
            .collect())
    }

    /// Runs the contract supervisor loop until `cancel` fires.
    ///
    /// Every clock tick the active contracts are listed. Loops are started for any which are not yet running, and
    /// stopped for any whose process has been disabled. If any loop gives up, the error is returned and the remaining
    /// loops are stopped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut running = HashMap::new();
        let result = loop {
            if let Err(e) = self.sync_loops(&mut tasks, &mut running, &cancel) {
                break Err(e);
            }
            select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(result) = tasks.join_next() => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(e.into()),
                },
                _ = sleep(self.config.clock_tick) => {}
            }
        };

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(%e, "contract loop failed during shutdown");
            }
        }
        result
    }

    fn sync_loops(
        self: &Arc<Self>,
        tasks: &mut JoinSet<Result<()>>,
        running: &mut HashMap<Address, CancellationToken>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let active = self.active_contracts()?;
        running.retain(|contract, loops| {
            if active.contains(contract) {
                return true;
            }
            loops.cancel();
            info!(%contract, "contract loops stopped");
            false
        });

        for contract in active {
            if running.contains_key(&contract) {
                continue;
            }
            self.ensure_notifier(contract)?;
            let loops = cancel.child_token();

            let engine = self.clone();
            tasks.spawn(retry::supervise(
                format!("inbound {contract}"),
                self.policy(),
                loops.clone(),
                move || {
                    let engine = engine.clone();
                    async move { engine.poll_logs(contract).await }
                },
            ));

            if let Some(notifier) = self.notifier_key(contract)? {
                let engine = self.clone();
                tasks.spawn(retry::supervise(
                    format!("outbound {contract}"),
                    self.policy(),
                    loops.clone(),
                    move || {
                        let engine = engine.clone();
                        let notifier = notifier.clone();
                        async move { engine.submit_group_events(contract, &notifier).await }
                    },
                ));
            }

            info!(%contract, "contract loops started");
            running.insert(contract, loops);
        }
        Ok(())
    }

    fn ensure_notifier(&self, contract: Address) -> Result<()> {
        let Some(key) = &self.config.key else {
            return Ok(());
        };
        let tx = self.db.write()?;
        {
            let mut notifiers = tx.contract_notifiers()?;
            if notifiers.get(contract)?.is_some() {
                return Ok(());
            }
            let seed = key.derive(contract.as_slice())?.as_bytes();
            notifiers.insert(contract, &NotifierState::new(seed))?;
        }
        tx.commit()?;
        debug!(%contract, "notifier set up");
        Ok(())
    }
}

fn parse_address(address: &str) -> Result<Address, EngineError> {
    if !address.starts_with("0x") {
        return Err(EngineError::InvalidAddress(address.to_owned()));
    }
    let parsed =
        Address::from_str(address).map_err(|_| EngineError::InvalidAddress(address.to_owned()))?;
    if parsed.is_zero() {
        return Err(EngineError::InvalidAddress(address.to_owned()));
    }
    Ok(parsed)
}

fn calldata_gas(data: &[u8]) -> u128 {
    data.iter()
        .map(|b| {
            if *b == 0 {
                ZERO_BYTE_GAS
            } else {
                NONZERO_BYTE_GAS
            }
        })
        .sum()
}

#[async_trait]
impl<R: ChainRpc> machine::Engine for Engine<R> {
    async fn verify_address(&self, address: &str, proof: &[u8]) -> Result<()> {
        let contract = parse_address(address)?;
        let tx = <[u8; 32]>::try_from(proof).map_err(|_| {
            EngineError::InvalidProof(format!(
                "malformed creation transaction hash of {} bytes",
                proof.len()
            ))
        })?;
        let tx = B256::from(tx);

        let height = self.rpc.block_number().await.map_err(EngineError::Rpc)?;
        let creation = self
            .rpc
            .contract_creation(tx)
            .await
            .map_err(EngineError::Rpc)?;
        let birth = match creation {
            Some(ContractCreation {
                address: Some(created),
                block_number: Some(birth),
            }) if created == contract => birth,
            Some(_) => {
                return Err(EngineError::InvalidProof(format!(
                    "transaction {tx} did not create {contract}"
                ))
                .into());
            }
            None => {
                return Err(EngineError::InvalidProof(format!("transaction {tx} not found")).into());
            }
        };
        if height < birth.saturating_add(self.config.confirmations) {
            return Err(EngineError::AddressTooYoung { birth, height }.into());
        }

        let write = self.db.write()?;
        write.contract_logs_offset()?.set(contract, birth)?;
        write.commit()?;
        info!(%contract, birth, height, "contract verified");
        Ok(())
    }

    async fn setup_notifier(&self, address: &str) -> Result<()> {
        let contract = parse_address(address)?;
        self.ensure_notifier(contract)
    }

    fn estimate_cost(&self, events: &[Event]) -> Result<u128> {
        let gas = events.iter().try_fold(0u128, |gas, event| {
            let data = contracts::mixin_call(event)?;
            Ok::<_, anyhow::Error>(gas + BASE_TRANSACTION_GAS + calldata_gas(&data))
        })?;
        Ok(gas.saturating_mul(*self.config.gas_price))
    }

    async fn ensure_send_group_events(&self, address: &str, events: &[Event]) -> Result<()> {
        let contract = parse_address(address)?;
        let tx = self.db.write()?;
        let mut queued = 0;
        {
            let mut outbound = tx.outbound_events()?;
            for event in events {
                if outbound.get(contract, event.nonce)?.is_some() {
                    continue;
                }
                outbound.insert(contract, event)?;
                queued += 1;
            }
        }
        tx.commit()?;
        if queued > 0 {
            debug!(%contract, queued, "group events queued for submission");
        }
        Ok(())
    }

    async fn receive_group_events(
        &self,
        address: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let contract = parse_address(address)?;
        self.db
            .read()?
            .contract_events()?
            .list(contract, offset, limit)
    }
}
