mod engine;
mod machine;
mod status;
mod store;

use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, B256, U256};
use mvm::{
    cfg::{Amount, MachineConfig, QuorumConfig},
    crypto::SecretKey,
    db::Db,
    encoding::Event,
    machine::{Engine as _, Machine, OutboundGroupMessage, Process, ProcessPlatform, Store},
    quorum::{self, FakeChain},
};
use rand::{Rng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, error::TryRecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// Block the test contract is deployed in.
const BIRTH: u64 = 1000;

/// A member of a test [Harness].
struct TestMember {
    index: usize,
    machine: Arc<Machine>,
    db: Arc<Db>,
    engine: Arc<quorum::Engine<FakeChain>>,
    outbound: UnboundedReceiver<OutboundGroupMessage>,
    _dir: TempDir,
}

/// A simulated group. Every member has its own store, machine and engine, and all engines share one chain.
///
/// Messages between members are only exchanged when the test asks for it, in an order chosen by the harness's RNG.
pub struct Harness {
    rng: ChaCha8Rng,
    chain: Arc<FakeChain>,
    members: Vec<TestMember>,
    /// Chain events each member has delivered to the group.
    delivered: Vec<Vec<Event>>,
    /// Key of the engine which submits transactions. Only the first member has one.
    engine_key: SecretKey,
    retention_budget: u128,
    batch_limit: usize,
}

impl Harness {
    pub fn new(mut rng: ChaCha8Rng) -> Self {
        let engine_key = SecretKey::new_from_rng(&mut rng);
        Harness {
            rng,
            chain: Arc::new(FakeChain::new(BIRTH + 10_000)),
            members: Vec::new(),
            delivered: Vec::new(),
            engine_key,
            retention_budget: u128::MAX,
            batch_limit: 100,
        }
    }

    fn machine_config(&self, key: SecretKey, members: Vec<Address>, threshold: usize) -> MachineConfig {
        MachineConfig {
            key,
            members,
            threshold,
            retention_budget: Amount(self.retention_budget),
            poll_interval: Duration::from_millis(20),
            batch_limit: self.batch_limit,
            max_consecutive_failures: 3,
            max_backoff: Duration::from_millis(100),
        }
    }

    fn quorum_config(key: Option<SecretKey>) -> QuorumConfig {
        let mut config = QuorumConfig::new("http://localhost:8545".parse().unwrap(), key);
        config.clock_tick = Duration::from_millis(20);
        config.max_consecutive_failures = 3;
        config.max_backoff = Duration::from_millis(100);
        config
    }

    /// Sets the retention budget of members created after this call.
    pub fn set_retention_budget(&mut self, budget: u128) {
        self.retention_budget = budget;
    }

    /// Sets the supervisor batch limit of members created after this call.
    pub fn set_batch_limit(&mut self, limit: usize) {
        self.batch_limit = limit;
    }

    /// Nonces of the events member `index`'s engine has queued for submission to `contract`.
    pub fn queued(&self, index: usize, contract: Address) -> Vec<u64> {
        self.members[index]
            .db
            .read()
            .unwrap()
            .outbound_events()
            .unwrap()
            .list(contract, 0, usize::MAX)
            .unwrap()
            .into_iter()
            .map(|e| e.nonce)
            .collect()
    }

    /// Creates `n` members with a signing threshold of `threshold`.
    pub fn start_group(&mut self, n: usize, threshold: usize) {
        let keys: Vec<_> = (0..n)
            .map(|_| SecretKey::new_from_rng(&mut self.rng))
            .collect();
        let addresses: Vec<_> = keys.iter().map(|k| k.address()).collect();

        for (index, key) in keys.into_iter().enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let db = Arc::new(Db::new(Some(dir.path()), 1024 * 1024).unwrap());
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let config = self.machine_config(key, addresses.clone(), threshold);
            let machine = Arc::new(Machine::new(db.clone(), config, outbound_tx).unwrap());

            let engine_key = (index == 0).then(|| self.engine_key.clone());
            let engine = Arc::new(quorum::Engine::new(
                db.clone(),
                self.chain.clone(),
                Self::quorum_config(engine_key),
            ));
            machine.add_engine(ProcessPlatform::Quorum, engine.clone());

            self.members.push(TestMember {
                index,
                machine,
                db,
                engine,
                outbound: outbound_rx,
                _dir: dir,
            });
            self.delivered.push(Vec::new());
        }
        info!(n, threshold, "group started");
    }

    pub fn chain(&self) -> &FakeChain {
        &self.chain
    }

    pub fn machine(&self, index: usize) -> &Machine {
        &self.members[index].machine
    }

    pub fn db(&self, index: usize) -> &Db {
        &self.members[index].db
    }

    pub fn store(&self, index: usize) -> Arc<dyn Store> {
        self.members[index].db.clone()
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn delivered(&self, index: usize) -> &[Event] {
        &self.delivered[index]
    }

    /// The address of a new contract, deployed at [BIRTH]. Returns the contract and its creation transaction.
    pub fn deploy_contract(&mut self) -> (Address, B256) {
        let address = Address::from(self.rng.r#gen::<[u8; 20]>());
        let tx = B256::from(self.rng.r#gen::<[u8; 32]>());
        self.chain.deploy(tx, address, BIRTH);
        (address, tx)
    }

    /// Deploys a contract and binds a new process to it on every member.
    pub async fn add_process(&mut self) -> Process {
        let id = Uuid::from_u128(self.rng.r#gen());
        self.add_process_with_id(id).await
    }

    pub async fn add_process_with_id(&mut self, id: Uuid) -> Process {
        let (address, tx) = self.deploy_contract();
        let process = Process::new(id, ProcessPlatform::Quorum, address.to_string());
        for member in &self.members {
            member
                .machine
                .add_process(process.clone(), tx.as_slice())
                .await
                .unwrap();
        }
        process
    }

    pub fn random_event(&mut self, process: &Process, nonce: u64) -> Event {
        let extra_len = self.rng.gen_range(0..64);
        Event {
            process: process.id,
            nonce,
            asset: Uuid::from_u128(self.rng.r#gen()),
            amount: U256::from(self.rng.r#gen::<u64>()),
            extra: (0..extra_len).map(|_| self.rng.r#gen()).collect(),
            timestamp: self.rng.r#gen(),
            signature: Vec::new(),
        }
    }

    /// Hands `event` to the members in `to`, in random order, as the group transport would.
    pub fn deliver_event_to(&mut self, event: &Event, to: &[usize]) {
        let mut order = to.to_vec();
        order.shuffle(&mut self.rng);
        for index in order {
            self.members[index]
                .machine
                .handle_group_event(event.clone())
                .unwrap();
        }
    }

    pub fn deliver_event(&mut self, event: &Event) {
        let all: Vec<_> = (0..self.members.len()).collect();
        self.deliver_event_to(event, &all);
    }

    /// Broadcasts pending outbound messages until there are none left. Partial signatures reach every other member in
    /// a random order.
    pub fn flush(&mut self) {
        loop {
            let mut messages = Vec::new();
            for member in &mut self.members {
                loop {
                    match member.outbound.try_recv() {
                        Ok(message) => messages.push((member.index, message)),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => panic!("machine dropped its transport"),
                    }
                }
            }
            if messages.is_empty() {
                return;
            }
            messages.shuffle(&mut self.rng);

            for (source, message) in messages {
                match message {
                    OutboundGroupMessage::PartialSignature {
                        process,
                        nonce,
                        partial,
                    } => {
                        let mut destinations: Vec<_> =
                            (0..self.members.len()).filter(|i| *i != source).collect();
                        destinations.shuffle(&mut self.rng);
                        for destination in destinations {
                            trace!(source, destination, %process, nonce, "partial signature");
                            self.members[destination]
                                .machine
                                .handle_partial_signature(process, nonce, partial.clone())
                                .unwrap();
                        }
                    }
                    OutboundGroupMessage::Deliver(event) => {
                        self.delivered[source].push(event);
                    }
                }
            }
        }
    }

    /// Runs one supervisor iteration on every member, then exchanges the resulting messages.
    pub async fn tick(&mut self) {
        for member in &self.members {
            member.machine.tick().await.unwrap();
        }
        self.flush();
    }

    /// Runs every member's engine loops for `duration`.
    pub async fn run_engines(&self, duration: Duration) {
        let cancel = CancellationToken::new();
        let tasks: Vec<_> = self
            .members
            .iter()
            .map(|member| tokio::spawn(member.engine.clone().run(cancel.clone())))
            .collect();
        tokio::time::sleep(duration).await;
        cancel.cancel();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    /// Starts the engine loops of member `index` in the background. They run until `cancel` fires.
    pub fn spawn_engine(
        &self,
        index: usize,
        cancel: CancellationToken,
    ) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.members[index].engine.clone().run(cancel))
    }

    /// Runs the engine of member `index` until it stops by itself.
    pub async fn run_engine(&self, index: usize) -> anyhow::Result<()> {
        self.members[index]
            .engine
            .clone()
            .run(CancellationToken::new())
            .await
    }

    /// The contract-bound notifier address of `contract`, as derived by the first member's engine.
    pub fn notifier(&self, contract: Address) -> Address {
        self.members[0]
            .engine
            .notifier_key(contract)
            .unwrap()
            .unwrap()
            .address()
    }

    /// The cost of submitting `event`, at the gas price every member's engine uses.
    pub fn estimate_cost(&self, event: &Event) -> u128 {
        let db = Arc::new(Db::new::<&str>(None, 1024 * 1024).unwrap());
        quorum::Engine::new(db, self.chain.clone(), Self::quorum_config(None))
            .estimate_cost(std::slice::from_ref(event))
            .unwrap()
    }
}
