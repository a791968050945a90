//! Access to the EVM chain over JSON-RPC.

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256, Bytes, TxKind},
    providers::{Provider, RootProvider},
    rpc::types::{Filter, TransactionInput, TransactionRequest},
};
use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use super::contracts::EVENT_TOPIC;

/// The creation record of a contract, taken from the receipt of the transaction which deployed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContractCreation {
    pub address: Option<Address>,
    pub block_number: Option<u64>,
}

/// The JSON-RPC methods the engine needs.
#[async_trait]
pub trait ChainRpc: Send + Sync + 'static {
    async fn block_number(&self) -> Result<u64>;
    /// Returns `None` if the transaction is unknown or not yet mined.
    async fn contract_creation(&self, tx: B256) -> Result<Option<ContractCreation>>;
    /// Returns the data of every `MixinTransaction` log emitted by `address` in the blocks `from..=to`.
    async fn logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<Bytes>>;
    /// Executes a read-only call against the latest block.
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes>;
    async fn transaction_count(&self, address: Address) -> Result<u64>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256>;
}

pub struct AlloyRpc {
    provider: RootProvider,
}

impl AlloyRpc {
    pub fn new(url: Url) -> Self {
        AlloyRpc {
            provider: RootProvider::new_http(url),
        }
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn contract_creation(&self, tx: B256) -> Result<Option<ContractCreation>> {
        let receipt = self.provider.get_transaction_receipt(tx).await?;
        Ok(receipt.map(|r| ContractCreation {
            address: r.contract_address,
            block_number: r.block_number,
        }))
    }

    async fn logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<Bytes>> {
        let filter = Filter::new()
            .address(address)
            .event_signature(EVENT_TOPIC)
            .from_block(from)
            .to_block(to);
        let logs = self.provider.get_logs(&filter).await?;
        Ok(logs
            .into_iter()
            .filter(|log| log.inner.address == address)
            .map(|log| log.inner.data.data)
            .collect())
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let request = TransactionRequest {
            to: Some(TxKind::Call(to)),
            input: TransactionInput::new(input),
            ..Default::default()
        };
        Ok(self
            .provider
            .raw_request("eth_call".into(), (request, BlockNumberOrTag::Latest))
            .await?)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        Ok(self.provider.get_transaction_count(address).await?)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256> {
        let pending = self.provider.send_raw_transaction(&raw).await?;
        Ok(*pending.tx_hash())
    }
}

#[cfg(any(test, feature = "fake_chain"))]
pub use fake::FakeChain;

#[cfg(any(test, feature = "fake_chain"))]
mod fake {
    use std::collections::{BTreeMap, HashMap};

    use alloy::{
        consensus::TxEnvelope,
        eips::eip2718::Decodable2718,
        primitives::{Address, B256, Bytes, U256},
    };
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{ChainRpc, ContractCreation};
    use crate::{
        encoding::Event,
        quorum::contracts::{self, MIXIN_SELECTOR, NONCE_SELECTOR},
    };

    #[derive(Default)]
    struct State {
        height: u64,
        offline: bool,
        creations: HashMap<B256, ContractCreation>,
        /// block -> logs emitted in that block, in emission order
        logs: BTreeMap<u64, Vec<(Address, Bytes)>>,
        contract_nonces: HashMap<Address, u64>,
        account_nonces: HashMap<Address, u64>,
        sent: Vec<Bytes>,
        log_queries: Vec<(Address, u64, u64)>,
    }

    /// An in-memory chain. Every method fails while the chain is offline.
    #[derive(Default)]
    pub struct FakeChain {
        state: Mutex<State>,
    }

    impl FakeChain {
        pub fn new(height: u64) -> Self {
            let chain = FakeChain::default();
            chain.state.lock().height = height;
            chain
        }

        pub fn set_height(&self, height: u64) {
            self.state.lock().height = height;
        }

        pub fn set_offline(&self, offline: bool) {
            self.state.lock().offline = offline;
        }

        /// Records `tx` as the transaction which deployed `address` in block `block`.
        pub fn deploy(&self, tx: B256, address: Address, block: u64) {
            self.state.lock().creations.insert(
                tx,
                ContractCreation {
                    address: Some(address),
                    block_number: Some(block),
                },
            );
        }

        pub fn add_receipt(&self, tx: B256, creation: ContractCreation) {
            self.state.lock().creations.insert(tx, creation);
        }

        pub fn emit_log(&self, address: Address, block: u64, data: Vec<u8>) {
            self.state
                .lock()
                .logs
                .entry(block)
                .or_default()
                .push((address, data.into()));
        }

        /// Emits a `MixinTransaction` log carrying `event` from `address`.
        pub fn emit_event(&self, address: Address, block: u64, event: &Event) -> Result<()> {
            self.emit_log(address, block, contracts::encode_log(event)?);
            Ok(())
        }

        pub fn set_contract_nonce(&self, address: Address, nonce: u64) {
            self.state.lock().contract_nonces.insert(address, nonce);
        }

        /// Raw transactions submitted so far.
        pub fn sent(&self) -> Vec<Bytes> {
            self.state.lock().sent.clone()
        }

        /// Every `(address, from, to)` passed to [ChainRpc::logs] so far.
        pub fn log_queries(&self) -> Vec<(Address, u64, u64)> {
            self.state.lock().log_queries.clone()
        }

        fn state(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
            let state = self.state.lock();
            if state.offline {
                return Err(anyhow!("connection refused"));
            }
            Ok(state)
        }
    }

    #[async_trait]
    impl ChainRpc for FakeChain {
        async fn block_number(&self) -> Result<u64> {
            Ok(self.state()?.height)
        }

        async fn contract_creation(&self, tx: B256) -> Result<Option<ContractCreation>> {
            Ok(self.state()?.creations.get(&tx).copied())
        }

        async fn logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<Bytes>> {
            let mut state = self.state()?;
            state.log_queries.push((address, from, to));
            if from > to {
                return Ok(vec![]);
            }
            Ok(state
                .logs
                .range(from..=to)
                .flat_map(|(_, logs)| logs.iter())
                .filter(|(emitter, _)| *emitter == address)
                .map(|(_, data)| data.clone())
                .collect())
        }

        async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
            let state = self.state()?;
            if input[..] != NONCE_SELECTOR[..] {
                return Err(anyhow!("execution reverted"));
            }
            let nonce = state.contract_nonces.get(&to).copied().unwrap_or(0);
            Ok(U256::from(nonce).to_be_bytes::<32>().to_vec().into())
        }

        async fn transaction_count(&self, address: Address) -> Result<u64> {
            Ok(self
                .state()?
                .account_nonces
                .get(&address)
                .copied()
                .unwrap_or(0))
        }

        async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256> {
            let mut state = self.state()?;
            let envelope = TxEnvelope::decode_2718(&mut &raw[..])?;
            let TxEnvelope::Legacy(signed) = &envelope else {
                return Err(anyhow!("unsupported transaction type"));
            };
            let sender = signed.recover_signer()?;
            let expected = state.account_nonces.get(&sender).copied().unwrap_or(0);
            if signed.tx().nonce != expected {
                return Err(anyhow!("nonce too low"));
            }
            if !signed.tx().input.starts_with(&MIXIN_SELECTOR) {
                return Err(anyhow!("execution reverted"));
            }
            state.account_nonces.insert(sender, expected + 1);
            state.sent.push(raw);
            Ok(*signed.hash())
        }
    }
}
