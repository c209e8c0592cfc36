use crate::crypto::Address;
use crate::types::{ConsensusMessage, DebugAction, StateSyncMessage};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    Multiaddr, gossipsub, mdns, noise, swarm::NetworkBehaviour, swarm::SwarmEvent, tcp, yamux,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Network task stopped")]
    Closed,
}

/// Logical channel a message travels on. Each maps to one gossip topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Consensus,
    StateSync,
    Debug,
    Transaction,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::Consensus,
        Topic::StateSync,
        Topic::Debug,
        Topic::Transaction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Topic::Consensus => "tessera-consensus",
            Topic::StateSync => "tessera-state-sync",
            Topic::Debug => "tessera-debug",
            Topic::Transaction => "tessera-transactions",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkMessage {
    Consensus(ConsensusMessage),
    StateSync(StateSyncMessage),
    Debug(DebugAction),
    Transaction(Vec<u8>),
}

impl NetworkMessage {
    pub fn topic(&self) -> Topic {
        match self {
            NetworkMessage::Consensus(_) => Topic::Consensus,
            NetworkMessage::StateSync(_) => Topic::StateSync,
            NetworkMessage::Debug(_) => Topic::Debug,
            NetworkMessage::Transaction(_) => Topic::Transaction,
        }
    }
}

/// A message delivered to this node, tagged with the validator that sent it.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub from: Address,
    pub message: NetworkMessage,
}

/// Best-effort transport. Nothing sent here is guaranteed to arrive, arrive once,
/// or arrive in order. Inbound traffic is delivered on the channel handed to the
/// implementation when it is built.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    async fn send(
        &self,
        to: Address,
        message: NetworkMessage,
        topic: Topic,
    ) -> Result<(), NetworkError>;

    async fn broadcast(&self, message: NetworkMessage, topic: Topic) -> Result<(), NetworkError>;
}

// -----------------------------------------------------------------------------
// libp2p gossipsub transport
// -----------------------------------------------------------------------------

/// Wire format. Unicast is a publish that names its recipient; everyone else drops it.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Envelope {
    from: Address,
    to: Option<Address>,
    message: NetworkMessage,
}

/// Network Behaviour combining Gossipsub (for validator traffic) and mDNS (for local discovery).
#[derive(NetworkBehaviour)]
pub struct TesseraBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
}

#[derive(Debug)]
enum NetworkCommand {
    Publish(Topic, Vec<u8>),
    Dial(Multiaddr),
}

fn transport_err(e: impl std::fmt::Display) -> NetworkError {
    NetworkError::Transport(e.to_string())
}

/// Gossipsub-backed gateway. The swarm lives in a background task and is driven
/// through a command channel.
pub struct P2pNetwork {
    address: Address,
    command_sender: mpsc::Sender<NetworkCommand>,
}

impl P2pNetwork {
    pub async fn new(
        address: Address,
        port: u16,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, NetworkError> {
        let (command_sender, mut command_receiver) = mpsc::channel(256);

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(transport_err)?
            .with_behaviour(|key| {
                let message_id_fn = |message: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    message.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(std::io::Error::other)?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?;

                Ok(TesseraBehaviour { gossipsub, mdns })
            })
            .map_err(transport_err)?
            .build();

        let listen: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", port)
            .parse()
            .map_err(transport_err)?;
        swarm.listen_on(listen).map_err(transport_err)?;

        for topic in Topic::ALL {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(topic.name()))
                .map_err(transport_err)?;
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            log::info!("Swarm listening on {address:?}");
                        },
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            log::info!("Connection established with peer: {peer_id}");
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        },
                        SwarmEvent::OutgoingConnectionError { error, .. } => {
                            log::warn!("Outgoing connection error: {error:?}");
                        },
                        SwarmEvent::Behaviour(TesseraBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::info!("mDNS discovered a new peer: {peer_id}");
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            }
                        },
                        SwarmEvent::Behaviour(TesseraBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::info!("mDNS discover peer has expired: {peer_id}");
                                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                            }
                        },
                        SwarmEvent::Behaviour(TesseraBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                            let envelope = match serde_json::from_slice::<Envelope>(&message.data) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    log::debug!("Undecodable gossip message: {e}");
                                    continue;
                                }
                            };
                            if envelope.from == address || envelope.to.is_some_and(|to| to != address) {
                                continue;
                            }
                            let inbound_message = InboundMessage { from: envelope.from, message: envelope.message };
                            if inbound.send(inbound_message).await.is_err() {
                                break;
                            }
                        },
                        _ => {}
                    },
                    command = command_receiver.recv() => match command {
                        Some(NetworkCommand::Publish(topic, data)) => {
                            let topic = gossipsub::IdentTopic::new(topic.name());
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, data) {
                                match e {
                                    gossipsub::PublishError::Duplicate => {},
                                    _ => log::debug!("Publish error: {e:?}"),
                                }
                            }
                        },
                        Some(NetworkCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr) {
                                log::warn!("Dial error: {e:?}");
                            }
                        },
                        None => break, // Channel closed
                    }
                }
            }
        });

        Ok(Self {
            address,
            command_sender,
        })
    }

    pub async fn dial(&self, addr: &str) -> Result<(), NetworkError> {
        let multiaddr: Multiaddr = addr.parse().map_err(transport_err)?;
        self.command_sender
            .send(NetworkCommand::Dial(multiaddr))
            .await
            .map_err(|_| NetworkError::Closed)
    }

    async fn publish(&self, envelope: Envelope, topic: Topic) -> Result<(), NetworkError> {
        let data = serde_json::to_vec(&envelope)?;
        self.command_sender
            .send(NetworkCommand::Publish(topic, data))
            .await
            .map_err(|_| NetworkError::Closed)
    }
}

#[async_trait]
impl NetworkGateway for P2pNetwork {
    async fn send(
        &self,
        to: Address,
        message: NetworkMessage,
        topic: Topic,
    ) -> Result<(), NetworkError> {
        let envelope = Envelope {
            from: self.address,
            to: Some(to),
            message,
        };
        self.publish(envelope, topic).await
    }

    async fn broadcast(&self, message: NetworkMessage, topic: Topic) -> Result<(), NetworkError> {
        let envelope = Envelope {
            from: self.address,
            to: None,
            message,
        };
        self.publish(envelope, topic).await
    }
}

// -----------------------------------------------------------------------------
// In-process transport
// -----------------------------------------------------------------------------

/// Connects gateways living in one process. Delivery is immediate but still lossy:
/// a full inbound queue drops the message, like a congested link would.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<Mutex<HashMap<Address, mpsc::Sender<InboundMessage>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, address: Address, inbound: mpsc::Sender<InboundMessage>) -> MemoryGateway {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(address, inbound);
        }
        MemoryGateway {
            address,
            hub: self.clone(),
        }
    }

    /// Disconnects `address`; messages to it are dropped from now on.
    pub fn leave(&self, address: &Address) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(address);
        }
    }

    fn recipients(&self, to: Option<Address>, from: Address) -> Vec<mpsc::Sender<InboundMessage>> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        match to {
            Some(to) => peers.get(&to).cloned().into_iter().collect(),
            None => peers
                .iter()
                .filter(|(addr, _)| **addr != from)
                .map(|(_, tx)| tx.clone())
                .collect(),
        }
    }

    fn deliver(&self, from: Address, to: Option<Address>, message: NetworkMessage) {
        for tx in self.recipients(to, from) {
            let inbound = InboundMessage {
                from,
                message: message.clone(),
            };
            if tx.try_send(inbound).is_err() {
                log::debug!("Memory hub dropped a message from {}", from);
            }
        }
    }
}

pub struct MemoryGateway {
    address: Address,
    hub: MemoryHub,
}

#[async_trait]
impl NetworkGateway for MemoryGateway {
    async fn send(
        &self,
        to: Address,
        message: NetworkMessage,
        _topic: Topic,
    ) -> Result<(), NetworkError> {
        self.hub.deliver(self.address, Some(to), message);
        Ok(())
    }

    async fn broadcast(&self, message: NetworkMessage, _topic: Topic) -> Result<(), NetworkError> {
        self.hub.deliver(self.address, None, message);
        Ok(())
    }
}
