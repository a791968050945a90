use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use super::{ChainRpc, Engine, contracts, transaction::sign_group_event_transaction};
use crate::{crypto::SecretKey, encoding::Event, error::EngineError};

/// An empty log window delays the next poll by this many clock ticks.
const EMPTY_FETCH_TICKS: u32 = 5;

/// Selects the events which extend a contract's history, given the nonce it expects next.
///
/// Events are considered in nonce order. Lower nonces are skipped as already seen, and the first gap ends the batch,
/// so the returned nonces are contiguous and start at `expected`.
pub fn admit_events(expected: u64, mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by_key(|event| event.nonce);
    let mut next = expected;
    let mut admitted = Vec::new();
    for event in events {
        if event.nonce < next {
            continue;
        }
        if event.nonce > next {
            break;
        }
        next += 1;
        admitted.push(event);
    }
    admitted
}

impl<R: ChainRpc> Engine<R> {
    /// One iteration of the inbound log loop of `contract`. Returns the delay before the next one.
    pub(super) async fn poll_logs(&self, contract: Address) -> Result<Duration> {
        let offset = self
            .db
            .read()?
            .contract_logs_offset()?
            .get(contract)?
            .ok_or_else(|| anyhow!("contract {contract} has not been verified"))?;
        let window = self.config.log_window;
        let to = offset + window - 1;
        let empty_delay = self.config.clock_tick * EMPTY_FETCH_TICKS;

        let height = self.rpc.block_number().await.map_err(EngineError::Rpc)?;
        if to > height {
            debug!(%contract, offset, height, "log window not yet mined");
            return Ok(empty_delay);
        }

        let logs = self
            .rpc
            .logs(contract, offset, to)
            .await
            .map_err(EngineError::Rpc)?;
        let events = logs
            .iter()
            .filter_map(|data| match contracts::decode_log(data) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(%contract, %e, "skipping undecodable log");
                    None
                }
            })
            .collect();

        let tx = self.db.write()?;
        {
            let mut stored = tx.contract_events()?;
            let expected = stored.last_nonce(contract)?.map_or(1, |nonce| nonce + 1);
            let admitted = admit_events(expected, events);
            for event in &admitted {
                stored.insert(contract, event)?;
            }
            if !admitted.is_empty() {
                debug!(%contract, from = expected, count = admitted.len(), "contract events admitted");
            }
        }
        tx.contract_logs_offset()?.set(contract, offset + window)?;
        tx.commit()?;

        if logs.is_empty() {
            Ok(empty_delay)
        } else {
            Ok(Duration::ZERO)
        }
    }

    /// One iteration of the outbound loop of `contract`. Returns the delay before the next one.
    ///
    /// Queued events from the contract's current nonce onwards are signed by `notifier` and submitted. Submission is
    /// not confirmed. Anything the contract has not accepted by the next iteration is submitted again.
    pub(super) async fn submit_group_events(
        &self,
        contract: Address,
        notifier: &SecretKey,
    ) -> Result<Duration> {
        let output = self
            .rpc
            .call(contract, contracts::nonce_call().into())
            .await
            .map_err(EngineError::Rpc)?;
        let nonce =
            contracts::decode_nonce(&output).map_err(|e| EngineError::Rpc(e.into()))?;
        let events =
            self.db
                .read()?
                .outbound_events()?
                .list(contract, nonce, self.config.outbound_batch)?;
        if events.is_empty() {
            return Ok(self.config.clock_tick);
        }

        let sender = notifier.address();
        let mut account_nonce = self
            .rpc
            .transaction_count(sender)
            .await
            .map_err(EngineError::Rpc)?;
        for event in &events {
            let raw =
                sign_group_event_transaction(&self.config, notifier, contract, account_nonce, event)?;
            match self.rpc.send_raw_transaction(raw.into()).await {
                Ok(hash) => {
                    debug!(%contract, nonce = event.nonce, %hash, "group event submitted");
                    account_nonce += 1;
                }
                Err(e) => {
                    warn!(%contract, nonce = event.nonce, %e, "group event submission failed");
                    break;
                }
            }
        }
        Ok(self.config.clock_tick)
    }
}
