use std::{collections::HashMap, slice, sync::Arc};

use anyhow::{Result, anyhow};
use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AccountSnapshot, Engine, GroupSigner, InboundGroupMessage, OutboundGroupMessage, Process,
    ProcessPlatform, Store,
};
use crate::{
    cfg::MachineConfig,
    encoding::Event,
    error::{EngineError, MachineError, StoreError, is_permanent},
    retry::{self, RetryPolicy},
};

/// Partials held for an event which has not arrived yet, per group member.
const EARLY_PARTIALS_PER_MEMBER: usize = 4;

/// Routes group events to chain engines and chain events back to the group.
pub struct Machine {
    store: Arc<dyn Store>,
    signer: GroupSigner,
    engines: RwLock<HashMap<ProcessPlatform, Arc<dyn Engine>>>,
    /// Per process, the nonce after the last signed event handed to its engine. Starts from zero on every boot, which
    /// only repeats deliveries the engine already ignores.
    delivered: Mutex<HashMap<Uuid, u64>>,
    outbound: UnboundedSender<OutboundGroupMessage>,
    config: MachineConfig,
}

impl Machine {
    pub fn new(
        store: Arc<dyn Store>,
        config: MachineConfig,
        outbound: UnboundedSender<OutboundGroupMessage>,
    ) -> Result<Self> {
        let signer = GroupSigner::new(
            config.key.clone(),
            config.members.clone(),
            config.threshold,
        )?;
        Ok(Machine {
            store,
            signer,
            engines: RwLock::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            outbound,
            config,
        })
    }

    pub fn signer(&self) -> &GroupSigner {
        &self.signer
    }

    /// Registers the engine for `platform`, replacing any previous one. Takes effect from the next loop iteration.
    pub fn add_engine(&self, platform: ProcessPlatform, engine: Arc<dyn Engine>) {
        info!(%platform, "engine registered");
        self.engines.write().insert(platform, engine);
    }

    fn engine(&self, platform: ProcessPlatform) -> Result<Arc<dyn Engine>> {
        self.engines
            .read()
            .get(&platform)
            .cloned()
            .ok_or_else(|| MachineError::UnknownPlatform(platform).into())
    }

    /// Binds a new process to an address on its platform's chain, once the engine has verified the address.
    pub async fn add_process(&self, process: Process, proof: &[u8]) -> Result<()> {
        if let Some(existing) = self.store.read_process(process.id)? {
            if existing.platform != process.platform || existing.address != process.address {
                return Err(anyhow!(
                    "process {} is already bound to {}",
                    process.id,
                    existing.address
                ));
            }
            return Ok(());
        }

        let engine = self.engine(process.platform)?;
        engine.verify_address(&process.address, proof).await?;
        engine.setup_notifier(&process.address).await?;
        self.store.write_process(&process)?;
        info!(process = %process.id, address = %process.address, "process added");
        Ok(())
    }

    pub fn disable_process(&self, id: Uuid) -> Result<()> {
        let mut process = self
            .store
            .read_process(id)?
            .ok_or(MachineError::UnknownProcess(id))?;
        if !process.disabled {
            process.disabled = true;
            self.store.write_process(&process)?;
            info!(process = %id, "process disabled");
        }
        Ok(())
    }

    fn active_process(&self, id: Uuid) -> Result<Process> {
        let process = self
            .store
            .read_process(id)?
            .ok_or(MachineError::UnknownProcess(id))?;
        if process.disabled {
            return Err(MachineError::ProcessDisabled(id).into());
        }
        Ok(process)
    }

    /// Accepts a group event for quorum signing and broadcasts this member's partial signature.
    ///
    /// Redelivery of an event which has already been accepted is a no-op.
    pub fn handle_group_event(&self, event: Event) -> Result<()> {
        let process = self.active_process(event.process)?;
        let engine = self.engine(process.platform)?;
        let cost = engine.estimate_cost(slice::from_ref(&event))?;
        let budget = *self.config.retention_budget;
        if cost > budget {
            return Err(EngineError::CostExceedsBudget { cost, budget }.into());
        }

        let event = event.with_signature(Vec::new());
        let id = event.id()?;
        match self.store.write_pending(&event, &id) {
            Ok(()) => {}
            Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::DuplicateEvent(_))) => {
                debug!(process = %event.process, nonce = event.nonce, %id, "group event already accepted");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let partial = self.signer.sign(&event)?;
        let stored = self
            .store
            .read_partial_signatures(event.process, event.nonce)?;
        let partials = self
            .signer
            .merge(&event, stored.into_iter().chain([partial.clone()]));
        self.store
            .write_partial_signatures(event.process, event.nonce, &partials)?;
        self.broadcast(OutboundGroupMessage::PartialSignature {
            process: event.process,
            nonce: event.nonce,
            partial,
        })?;
        self.try_finalize(&event, &partials)?;
        Ok(())
    }

    /// Adds another member's partial signature. Returns true if it completed the quorum.
    pub fn handle_partial_signature(
        &self,
        process: Uuid,
        nonce: u64,
        partial: Vec<u8>,
    ) -> Result<bool> {
        if self.store.read_signed(process, nonce)?.is_some() {
            return Ok(false);
        }

        let mut stored = self.store.read_partial_signatures(process, nonce)?;
        let Some(event) = self.store.read_pending(process, nonce)? else {
            // The event itself has not arrived yet. Hold the partial until it can be checked against the event, evicting
            // the oldest ones so a flood cannot crowd out partials which arrive later.
            if !stored.contains(&partial) {
                stored.push(partial);
                let capacity = EARLY_PARTIALS_PER_MEMBER * self.config.members.len();
                if stored.len() > capacity {
                    stored.drain(..stored.len() - capacity);
                }
                self.store
                    .write_partial_signatures(process, nonce, &stored)?;
            }
            return Ok(false);
        };

        self.signer.verify(&event, &partial)?;
        let partials = self
            .signer
            .merge(&event, stored.into_iter().chain([partial]));
        self.store
            .write_partial_signatures(process, nonce, &partials)?;
        self.try_finalize(&event, &partials)
    }

    fn try_finalize(&self, event: &Event, partials: &[Vec<u8>]) -> Result<bool> {
        let Some(proof) = self.signer.aggregate(event, partials) else {
            return Ok(false);
        };
        match self
            .store
            .write_signed_and_expire_pending(&event.with_signature(proof))
        {
            Ok(()) => {
                // Events can be signed out of nonce order. Rewind delivery so this one is not skipped.
                if let Some(from) = self.delivered.lock().get_mut(&event.process) {
                    *from = (*from).min(event.nonce);
                }
                info!(process = %event.process, nonce = event.nonce, "group event signed");
                Ok(true)
            }
            Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotPending { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn broadcast(&self, message: OutboundGroupMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| MachineError::TransportClosed)?;
        Ok(())
    }

    /// One iteration of the supervisor loop.
    pub async fn tick(&self) -> Result<()> {
        // Partials can arrive before their event, so a quorum may already be waiting.
        for event in self.store.list_pending(self.config.batch_limit)? {
            let partials = self
                .store
                .read_partial_signatures(event.process, event.nonce)?;
            if self.try_finalize(&event, &partials)? {
                continue;
            }
            // Members still waiting for the event may have evicted our partial. Signing is deterministic, so
            // members which already hold it drop the copy.
            self.broadcast(OutboundGroupMessage::PartialSignature {
                process: event.process,
                nonce: event.nonce,
                partial: self.signer.sign(&event)?,
            })?;
        }

        for process in self.store.list_processes()? {
            if process.disabled {
                continue;
            }
            let engine = match self.engine(process.platform) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(process = %process.id, %e, "skipping process");
                    continue;
                }
            };
            self.deliver_signed(&process, engine.as_ref()).await?;
            self.replay_inbound(&process, engine.as_ref()).await?;
        }
        Ok(())
    }

    /// Hands the next batch of signed events to the engine, then expires delivered events over the retention budget.
    async fn deliver_signed(&self, process: &Process, engine: &dyn Engine) -> Result<()> {
        let from = self
            .delivered
            .lock()
            .get(&process.id)
            .copied()
            .unwrap_or_default();
        let batch = self
            .store
            .list_signed_from(process.id, from, self.config.batch_limit)?;
        let Some(last) = batch.last().map(|event| event.nonce) else {
            return Ok(());
        };
        engine
            .ensure_send_group_events(&process.address, &batch)
            .await?;
        self.delivered.lock().insert(process.id, last.saturating_add(1));
        debug!(process = %process.id, from, last, "signed group events delivered to engine");

        // Undelivered events are never expired.
        let costed = self
            .store
            .list_signed(process.id, usize::MAX)?
            .into_iter()
            .take_while(|event| event.nonce <= last)
            .map(|event| {
                let cost = engine.estimate_cost(slice::from_ref(&event))?;
                Ok((event, cost))
            })
            .collect::<Result<Vec<_>>>()?;
        let expired = self
            .store
            .expire_signed_with_cost(&costed, *self.config.retention_budget)?;
        if expired > 0 {
            debug!(process = %process.id, expired, "expired signed group events");
        }
        Ok(())
    }

    async fn replay_inbound(&self, process: &Process, engine: &dyn Engine) -> Result<()> {
        let offset = self.store.read_offset(process.id)?;
        let events = engine
            .receive_group_events(&process.address, offset, self.config.batch_limit)
            .await?;
        for event in events {
            let snapshot = AccountSnapshot::from_event(process, &event);
            if self.store.check_account_snapshot(&snapshot)? {
                debug!(process = %process.id, nonce = event.nonce, "chain event already replayed");
            } else {
                let nonce = event.nonce;
                self.broadcast(OutboundGroupMessage::Deliver(event))?;
                self.store.write_account_snapshot(&snapshot)?;
                debug!(process = %process.id, nonce, "replayed chain event");
            }
            self.store.write_offset(process.id, snapshot.nonce + 1)?;
        }
        Ok(())
    }

    fn handle_message(&self, message: InboundGroupMessage) -> Result<()> {
        match message {
            InboundGroupMessage::Event(event) => self.handle_group_event(event),
            InboundGroupMessage::PartialSignature {
                process,
                nonce,
                partial,
            } => self
                .handle_partial_signature(process, nonce, partial)
                .map(|_| ()),
        }
    }

    async fn handle_messages(
        self: Arc<Self>,
        inbound: UnboundedReceiver<InboundGroupMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut inbound = UnboundedReceiverStream::new(inbound);
        loop {
            select! {
                _ = cancel.cancelled() => return Ok(()),
                message = inbound.next() => {
                    let Some(message) = message else {
                        info!("group transport closed");
                        return Ok(());
                    };
                    if let Err(e) = self.handle_message(message) {
                        if !is_permanent(&e) {
                            return Err(e);
                        }
                        warn!(%e, "rejected group message");
                    }
                }
            }
        }
    }

    /// Runs the supervisor loop and handles messages from the group transport until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        inbound: UnboundedReceiver<InboundGroupMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let policy = RetryPolicy::new(
            self.config.max_consecutive_failures,
            self.config.poll_interval,
            self.config.max_backoff,
        );
        let machine = self.clone();
        let ticker = retry::supervise("machine", policy, cancel.clone(), move || {
            let machine = machine.clone();
            async move {
                machine.tick().await?;
                Ok(machine.config.poll_interval)
            }
        });
        let messages = self.handle_messages(inbound, cancel);
        tokio::try_join!(ticker, messages)?;
        Ok(())
    }
}
