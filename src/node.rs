use crate::consensus::{ConsensusAction, ConsensusEngine, ConsensusError};
use crate::crypto::Address;
use crate::network::{InboundMessage, NetworkGateway, NetworkMessage, Topic};
use crate::tx_pool::TxPool;
use crate::types::{ConsensusMessage, ConsensusNodeState, DebugAction, ViewStamp};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Node task failed: {0}")]
    Join(String),
}

/// Everything the event loop reacts to. Timer fires and local submissions come back
/// in through the same channel as network traffic.
#[derive(Debug)]
pub enum NodeEvent {
    Inbound(InboundMessage),
    Timeout(ViewStamp),
    SyncTick,
    /// Applied to this node only.
    Debug(DebugAction),
    /// Applied here and gossiped to every peer.
    BroadcastDebug(DebugAction),
    /// A transaction already accepted into the local pool that peers still need.
    Transaction(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub sync_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_millis(1000),
            channel_capacity: 1024,
        }
    }
}

/// Owns the engine and is the only thing that touches it.
pub struct Node {
    engine: ConsensusEngine,
    gateway: Arc<dyn NetworkGateway>,
    pool: TxPool,
    options: NodeOptions,
    inbound: mpsc::Receiver<InboundMessage>,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: mpsc::Receiver<NodeEvent>,
    state_tx: watch::Sender<ConsensusNodeState>,
}

impl Node {
    pub fn new(
        engine: ConsensusEngine,
        gateway: Arc<dyn NetworkGateway>,
        pool: TxPool,
        inbound: mpsc::Receiver<InboundMessage>,
        options: NodeOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.channel_capacity);
        let (state_tx, _) = watch::channel(engine.node_state());
        Self {
            engine,
            gateway,
            pool,
            options,
            inbound,
            events_tx,
            events_rx,
            state_tx,
        }
    }

    /// Sender for injecting events, e.g. from the RPC server.
    pub fn events(&self) -> mpsc::Sender<NodeEvent> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConsensusNodeState> {
        self.state_tx.subscribe()
    }

    pub fn start(self) -> NodeHandle {
        let events = self.events();
        let state = self.state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        NodeHandle {
            events,
            state,
            shutdown,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        let actions = self.engine.start()?;
        self.dispatch(actions).await?;

        let mut sync_tick = time::interval(self.options.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sync_tick.tick().await;

        loop {
            let event = tokio::select! {
                Some(msg) = self.inbound.recv() => NodeEvent::Inbound(msg),
                Some(event) = self.events_rx.recv() => event,
                _ = sync_tick.tick() => NodeEvent::SyncTick,
                _ = shutdown.changed() => break,
            };
            if let Err(e) = self.handle(event).await {
                log::error!("Node {} stopping: {}", self.engine.address(), e);
                return Err(e);
            }
        }
        log::info!("Node {} shut down at height {}", self.engine.address(), self.engine.height());
        Ok(())
    }

    async fn handle(&mut self, event: NodeEvent) -> Result<(), NodeError> {
        let actions = match event {
            NodeEvent::Inbound(InboundMessage { from, message }) => match message {
                NetworkMessage::Consensus(msg) => {
                    if msg.sender() != from {
                        log::warn!("Consensus message from {} claims sender {}", from, msg.sender());
                        return Ok(());
                    }
                    self.engine.handle_consensus_message(msg)?
                }
                NetworkMessage::StateSync(msg) => self.engine.handle_state_sync_message(msg)?,
                NetworkMessage::Debug(action) => {
                    log::info!("Debug action {:?} from {}", action, from);
                    self.engine.handle_debug_message(action)?
                }
                NetworkMessage::Transaction(tx) => {
                    if let Err(e) = self.pool.add_transaction(tx) {
                        log::debug!("Gossiped transaction not pooled: {}", e);
                    }
                    Vec::new()
                }
            },
            NodeEvent::Timeout(stamp) => self.engine.on_timeout(stamp)?,
            NodeEvent::SyncTick => self.engine.on_sync_tick()?,
            NodeEvent::Debug(action) => self.engine.handle_debug_message(action)?,
            NodeEvent::BroadcastDebug(action) => {
                self.broadcast(NetworkMessage::Debug(action)).await;
                self.engine.handle_debug_message(action)?
            }
            NodeEvent::Transaction(tx) => {
                self.broadcast(NetworkMessage::Transaction(tx)).await;
                Vec::new()
            }
        };
        self.dispatch(actions).await
    }

    /// Performs engine actions. Votes addressed to ourselves re-enter through the event
    /// channel, queued behind whatever is already waiting.
    async fn dispatch(&mut self, actions: Vec<ConsensusAction>) -> Result<(), NodeError> {
        for action in actions {
            match action {
                ConsensusAction::BroadcastProposal(proposal) => {
                    let message = NetworkMessage::Consensus(ConsensusMessage::Proposal(proposal));
                    let delay = self.engine.pacemaker_config().debug_interval;
                    if delay.is_zero() {
                        self.broadcast(message).await;
                    } else {
                        let gateway = self.gateway.clone();
                        tokio::spawn(async move {
                            time::sleep(delay).await;
                            if let Err(e) = gateway.broadcast(message, Topic::Consensus).await {
                                log::warn!("Delayed proposal broadcast failed: {}", e);
                            }
                        });
                    }
                }
                ConsensusAction::SendVote(to, vote) if to == self.engine.address() => {
                    let loopback = NodeEvent::Inbound(InboundMessage {
                        from: to,
                        message: NetworkMessage::Consensus(ConsensusMessage::Vote(vote)),
                    });
                    if self.events_tx.try_send(loopback).is_err() {
                        log::warn!("Event queue full; dropping own vote");
                    }
                }
                ConsensusAction::SendVote(to, vote) => {
                    self.send(to, NetworkMessage::Consensus(ConsensusMessage::Vote(vote)))
                        .await;
                }
                ConsensusAction::BroadcastStateSync(msg) => {
                    self.broadcast(NetworkMessage::StateSync(msg)).await;
                }
                ConsensusAction::SendStateSync(to, msg) => {
                    self.send(to, NetworkMessage::StateSync(msg)).await;
                }
                ConsensusAction::ArmTimer(stamp, delay) => {
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        time::sleep(delay).await;
                        // The loop may be gone by now.
                        let _ = events.send(NodeEvent::Timeout(stamp)).await;
                    });
                }
            }
        }
        self.state_tx.send_replace(self.engine.node_state());
        Ok(())
    }

    async fn send(&self, to: Address, message: NetworkMessage) {
        let topic = message.topic();
        if let Err(e) = self.gateway.send(to, message, topic).await {
            log::warn!("Failed to send to {}: {}", to, e);
        }
    }

    async fn broadcast(&self, message: NetworkMessage) {
        let topic = message.topic();
        if let Err(e) = self.gateway.broadcast(message, topic).await {
            log::warn!("Broadcast on {:?} failed: {}", topic, e);
        }
    }
}

/// Handle to a running node.
pub struct NodeHandle {
    events: mpsc::Sender<NodeEvent>,
    state: watch::Receiver<ConsensusNodeState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), NodeError>>,
}

impl NodeHandle {
    pub fn events(&self) -> mpsc::Sender<NodeEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConsensusNodeState> {
        self.state.clone()
    }

    pub fn node_state(&self) -> ConsensusNodeState {
        *self.state.borrow()
    }

    /// Resolves once the event loop has exited, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
    }

    pub async fn stop(self) -> Result<(), NodeError> {
        self.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|e| NodeError::Join(e.to_string()))?
    }
}
