#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tessera::consensus::{ConsensusAction, ConsensusConfig, ConsensusEngine};
use tessera::crypto::{Address, PrivateKey, PublicKey, generate_keypair_from_id};
use tessera::network::NetworkMessage;
use tessera::storage::{MemStorage, Persistence};
use tessera::tx_pool::TxPool;
use tessera::types::{Block, ConsensusMessage, Height, ViewStamp};
use tessera::utility::LedgerUtility;
use tessera::validators::ValidatorSet;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn keys(n: u64) -> Vec<(PublicKey, PrivateKey)> {
    (0..n).map(generate_keypair_from_id).collect()
}

pub fn validator_set(n: u64) -> ValidatorSet {
    ValidatorSet::new(keys(n).into_iter().map(|(pk, _)| pk).collect()).unwrap()
}

/// Builds an engine for key seed `id` whose store already holds `blocks`.
pub fn engine_with_blocks(
    id: u64,
    n: u64,
    blocks: &[Block],
    config: ConsensusConfig,
) -> (ConsensusEngine, Arc<MemStorage>) {
    let storage = Arc::new(MemStorage::new());
    for block in blocks {
        storage.store(block).unwrap();
    }
    let (_, key) = generate_keypair_from_id(id);
    let pool = TxPool::default();
    let engine = ConsensusEngine::new(
        key,
        validator_set(n),
        storage.clone(),
        Arc::new(LedgerUtility::new(pool)),
        config,
    )
    .unwrap();
    (engine, storage)
}

/// Link faults applied to every message except a leader's vote to itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct Chaos {
    pub drop: f64,
    pub duplicate: f64,
    pub reorder: f64,
}

pub struct Replica {
    pub engine: ConsensusEngine,
    pub storage: Arc<MemStorage>,
    pub pool: TxPool,
    pub timer: Option<ViewStamp>,
    pub heights: Vec<Height>,
}

struct Envelope {
    from: Address,
    to: Address,
    message: NetworkMessage,
}

/// In-process validator set that routes engine actions between replicas.
///
/// Messages are queued and delivered one at a time. Timers and sync ticks only fire
/// once the queue drains, so a fault-free run is fully deterministic.
pub struct Cluster {
    pub replicas: Vec<Replica>,
    index: HashMap<Address, usize>,
    queue: VecDeque<Envelope>,
    isolated: HashSet<Address>,
    chaos: Chaos,
    rng: StdRng,
    pub delivered: usize,
}

impl Cluster {
    pub fn new(n: u64, config: ConsensusConfig) -> Self {
        let validators = validator_set(n);
        let mut replicas = Vec::new();
        let mut index = HashMap::new();
        for (i, (pk, key)) in keys(n).into_iter().enumerate() {
            let storage = Arc::new(MemStorage::new());
            let pool = TxPool::default();
            let engine = ConsensusEngine::new(
                key,
                validators.clone(),
                storage.clone(),
                Arc::new(LedgerUtility::new(pool.clone())),
                config.clone(),
            )
            .unwrap();
            index.insert(pk.address(), i);
            replicas.push(Replica {
                heights: vec![engine.height()],
                engine,
                storage,
                pool,
                timer: None,
            });
        }
        Self {
            replicas,
            index,
            queue: VecDeque::new(),
            isolated: HashSet::new(),
            chaos: Chaos::default(),
            rng: StdRng::seed_from_u64(0),
            delivered: 0,
        }
    }

    pub fn with_chaos(mut self, chaos: Chaos, seed: u64) -> Self {
        self.chaos = chaos;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn address(&self, i: usize) -> Address {
        self.replicas[i].engine.address()
    }

    pub fn index_of(&self, address: &Address) -> usize {
        self.index[address]
    }

    /// Cuts every link to and from the replica.
    pub fn isolate(&mut self, i: usize) {
        let address = self.address(i);
        self.isolated.insert(address);
    }

    pub fn heal(&mut self, i: usize) {
        let address = self.address(i);
        self.isolated.remove(&address);
    }

    pub fn start(&mut self) {
        for i in 0..self.replicas.len() {
            let actions = self.replicas[i].engine.start().unwrap();
            self.route(i, actions);
        }
    }

    pub fn route(&mut self, from: usize, actions: Vec<ConsensusAction>) {
        let sender = self.address(from);
        for action in actions {
            match action {
                ConsensusAction::BroadcastProposal(p) => self.broadcast(
                    sender,
                    NetworkMessage::Consensus(ConsensusMessage::Proposal(p)),
                ),
                ConsensusAction::SendVote(to, vote) if to == sender => {
                    self.queue.push_back(Envelope {
                        from: sender,
                        to,
                        message: NetworkMessage::Consensus(ConsensusMessage::Vote(vote)),
                    });
                }
                ConsensusAction::SendVote(to, vote) => self.send(
                    sender,
                    to,
                    NetworkMessage::Consensus(ConsensusMessage::Vote(vote)),
                ),
                ConsensusAction::BroadcastStateSync(msg) => {
                    self.broadcast(sender, NetworkMessage::StateSync(msg))
                }
                ConsensusAction::SendStateSync(to, msg) => {
                    self.send(sender, to, NetworkMessage::StateSync(msg))
                }
                ConsensusAction::ArmTimer(stamp, _) => self.replicas[from].timer = Some(stamp),
            }
        }
    }

    fn broadcast(&mut self, from: Address, message: NetworkMessage) {
        let targets: Vec<Address> = self
            .replicas
            .iter()
            .map(|r| r.engine.address())
            .filter(|a| *a != from)
            .collect();
        for to in targets {
            self.send(from, to, message.clone());
        }
    }

    fn send(&mut self, from: Address, to: Address, message: NetworkMessage) {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return;
        }
        if self.rng.gen_bool(self.chaos.drop) {
            return;
        }
        if self.rng.gen_bool(self.chaos.duplicate) {
            self.queue.push_back(Envelope {
                from,
                to,
                message: message.clone(),
            });
        }
        self.queue.push_back(Envelope { from, to, message });
    }

    /// Delivers one queued message. False when nothing is queued.
    pub fn step(&mut self) -> bool {
        let next = if self.queue.len() > 1 && self.rng.gen_bool(self.chaos.reorder) {
            let i = self.rng.gen_range(0..self.queue.len());
            self.queue.remove(i)
        } else {
            self.queue.pop_front()
        };
        let Some(envelope) = next else {
            return false;
        };
        self.delivered += 1;
        let i = self.index_of(&envelope.to);
        let engine = &mut self.replicas[i].engine;
        let actions = match envelope.message {
            NetworkMessage::Consensus(msg) => {
                assert_eq!(msg.sender(), envelope.from);
                engine.handle_consensus_message(msg)
            }
            NetworkMessage::StateSync(msg) => engine.handle_state_sync_message(msg),
            NetworkMessage::Debug(action) => engine.handle_debug_message(action),
            NetworkMessage::Transaction(_) => Ok(Vec::new()),
        }
        .unwrap();
        self.record_height(i);
        self.route(i, actions);
        true
    }

    /// Runs sync housekeeping, then fires every armed timer.
    pub fn idle(&mut self) {
        for i in 0..self.replicas.len() {
            let actions = self.replicas[i].engine.on_sync_tick().unwrap();
            self.route(i, actions);
        }
        if !self.queue.is_empty() {
            return;
        }
        for i in 0..self.replicas.len() {
            if let Some(stamp) = self.replicas[i].timer.take() {
                let actions = self.replicas[i].engine.on_timeout(stamp).unwrap();
                self.record_height(i);
                self.route(i, actions);
            }
        }
    }

    pub fn run_until<F: Fn(&Cluster) -> bool>(&mut self, max_steps: usize, done: F) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            if !self.step() {
                self.idle();
            }
        }
        done(self)
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            if !self.step() {
                self.idle();
            }
        }
    }

    fn record_height(&mut self, i: usize) {
        let replica = &mut self.replicas[i];
        let height = replica.engine.height();
        if replica.heights.last() != Some(&height) {
            replica.heights.push(height);
        }
    }

    pub fn min_height(&self) -> Height {
        self.replicas
            .iter()
            .map(|r| r.engine.height())
            .min()
            .unwrap_or(0)
    }

    pub fn committed(&self, i: usize) -> Vec<Block> {
        let storage = &self.replicas[i].storage;
        let tip = storage.latest_height().unwrap();
        (1..=tip).map(|h| storage.read(h).unwrap().unwrap()).collect()
    }
}
