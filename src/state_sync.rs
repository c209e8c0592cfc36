use crate::crypto::Address;
use crate::storage::{Persistence, StorageError};
use crate::types::{Block, Height, StateSyncMetadata};
use log::{debug, info};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateSyncError {
    #[error("Block {0} not found")]
    NotFound(Height),
    #[error("Requested block {requested}, received block {got}")]
    HeightMismatch { requested: Height, got: Height },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Clone, Debug)]
pub struct StateSyncConfig {
    /// Lowest height this node will serve, even if older blocks are still stored.
    pub retention_floor: Height,
    /// Block requests allowed in flight at once.
    pub max_in_flight: usize,
    /// Sync ticks after which an unanswered block request is re-issued.
    pub fetch_timeout_ticks: u64,
    /// Sync ticks between metadata refreshes while not catching up.
    pub metadata_refresh_ticks: u64,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            retention_floor: 1,
            max_in_flight: 4,
            fetch_timeout_ticks: 3,
            metadata_refresh_ticks: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingFetch {
    peer: Address,
    issued_at: u64,
}

/// Both halves of the state-sync protocol.
///
/// Server side answers metadata and block requests straight from persistence.
/// Client side tracks what peers advertise, decides which heights to fetch from whom,
/// and buffers arriving blocks so the engine can apply them strictly in height order.
/// Nothing here touches the network or the chain; the engine feeds it events and acts
/// on what it returns.
#[derive(Debug)]
pub struct StateSyncCoordinator {
    address: Address,
    config: StateSyncConfig,
    peers: BTreeMap<Address, StateSyncMetadata>,
    in_flight: BTreeMap<Height, PendingFetch>,
    buffered: BTreeMap<Height, (Address, Block)>,
    attempts: BTreeMap<Height, u64>,
    tick: u64,
    lag_reported_at: Option<Height>,
}

impl StateSyncCoordinator {
    pub fn new(address: Address, config: StateSyncConfig) -> Self {
        Self {
            address,
            config,
            peers: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            buffered: BTreeMap::new(),
            attempts: BTreeMap::new(),
            tick: 0,
            lag_reported_at: None,
        }
    }

    // -------------------------------------------------------------------------
    // Server side
    // -------------------------------------------------------------------------

    /// Contiguous range of committed blocks this node serves. `0..0` when it has none.
    pub fn metadata(
        &self,
        persistence: &dyn Persistence,
    ) -> Result<StateSyncMetadata, StateSyncError> {
        let max_height = persistence.latest_height()?;
        let min_height = if max_height == 0 {
            0
        } else {
            persistence
                .lowest_height()?
                .max(self.config.retention_floor)
                .min(max_height)
        };
        Ok(StateSyncMetadata {
            peer_address: self.address,
            min_height,
            max_height,
        })
    }

    /// The committed block at `height`, or `NotFound` if it lies outside the served range.
    pub fn serve_block(
        &self,
        persistence: &dyn Persistence,
        height: Height,
    ) -> Result<Block, StateSyncError> {
        let range = self.metadata(persistence)?;
        if !range.covers(height) {
            return Err(StateSyncError::NotFound(height));
        }
        match persistence.read(height)? {
            Some(block) if block.height() == height => Ok(block),
            _ => Err(StateSyncError::NotFound(height)),
        }
    }

    // -------------------------------------------------------------------------
    // Client side
    // -------------------------------------------------------------------------

    /// Records a peer's advertised range, replacing what it advertised before.
    pub fn record_metadata(&mut self, metadata: StateSyncMetadata) {
        if metadata.peer_address == self.address {
            return;
        }
        if metadata.max_height == 0 || metadata.min_height > metadata.max_height {
            self.peers.remove(&metadata.peer_address);
            return;
        }
        debug!(
            "Peer {} serves {}..={}",
            metadata.peer_address, metadata.min_height, metadata.max_height
        );
        self.peers.insert(metadata.peer_address, metadata);
    }

    pub fn peers(&self) -> impl Iterator<Item = &StateSyncMetadata> {
        self.peers.values()
    }

    /// Highest committed height any known peer advertises.
    pub fn network_max_height(&self) -> Height {
        self.peers.values().map(|m| m.max_height).max().unwrap_or(0)
    }

    /// True when some peer has already committed the height this node is working on
    /// and advertises that it can serve it.
    pub fn is_behind(&self, local_height: Height) -> bool {
        self.peers.values().any(|m| m.covers(local_height))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Issues block requests for missing heights, lowest first, up to the pipelining limit.
    /// Each height goes to one of the peers covering it, rotating on every retry.
    pub fn next_requests(&mut self, local_height: Height) -> Vec<(Address, Height)> {
        let mut requests = Vec::new();
        let target = self.network_max_height();
        let mut height = local_height;
        while height <= target && self.in_flight.len() < self.config.max_in_flight {
            if self.in_flight.contains_key(&height) || self.buffered.contains_key(&height) {
                height += 1;
                continue;
            }
            let covering: Vec<Address> = self
                .peers
                .values()
                .filter(|m| m.covers(height))
                .map(|m| m.peer_address)
                .collect();
            if covering.is_empty() {
                // Skip the gap to the next advertised range.
                match self
                    .peers
                    .values()
                    .map(|m| m.min_height)
                    .filter(|min| *min > height)
                    .min()
                {
                    Some(next) => height = next,
                    None => break,
                }
                continue;
            }
            let attempt = self.attempts.get(&height).copied().unwrap_or(0);
            let peer = covering[((height + attempt) % covering.len() as u64) as usize];
            self.in_flight.insert(
                height,
                PendingFetch {
                    peer,
                    issued_at: self.tick,
                },
            );
            requests.push((peer, height));
            height += 1;
        }
        requests
    }

    /// Buffers a fetched block. Returns false for late or duplicate deliveries.
    pub fn on_block(
        &mut self,
        local_height: Height,
        peer: Address,
        requested: Height,
        block: Block,
    ) -> Result<bool, StateSyncError> {
        if block.height() != requested {
            return Err(StateSyncError::HeightMismatch {
                requested,
                got: block.height(),
            });
        }
        if requested < local_height || self.buffered.contains_key(&requested) {
            debug!("Dropping duplicate block {} from {}", requested, peer);
            return Ok(false);
        }
        self.in_flight.remove(&requested);
        self.buffered.insert(requested, (peer, block));
        Ok(true)
    }

    /// Next block to apply, if the one at `local_height` has arrived.
    pub fn pop_ready(&mut self, local_height: Height) -> Option<(Address, Block)> {
        self.buffered.remove(&local_height)
    }

    /// The peer could not serve `height`: forget its advertisement and refetch elsewhere.
    pub fn on_not_found(&mut self, peer: Address, height: Height) {
        info!("Peer {} has no block {}; dropping its metadata", peer, height);
        self.forget(peer, height);
    }

    /// A block from `peer` failed validation.
    pub fn reject(&mut self, peer: Address, height: Height) {
        self.forget(peer, height);
        self.buffered.remove(&height);
    }

    fn forget(&mut self, peer: Address, height: Height) {
        self.peers.remove(&peer);
        self.in_flight.retain(|_, f| f.peer != peer);
        *self.attempts.entry(height).or_default() += 1;
    }

    /// Advances the sync clock and expires unanswered requests.
    /// Returns true when a periodic metadata refresh is due.
    pub fn on_tick(&mut self) -> bool {
        self.tick += 1;
        let now = self.tick;
        let timeout = self.config.fetch_timeout_ticks;
        let expired: Vec<Height> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_sub(f.issued_at) >= timeout)
            .map(|(h, _)| *h)
            .collect();
        for height in expired {
            if let Some(fetch) = self.in_flight.get(&height).copied() {
                info!(
                    "Block request for {} to {} timed out; dropping its metadata",
                    height, fetch.peer
                );
                self.forget(fetch.peer, height);
            }
        }
        self.config.metadata_refresh_ticks > 0 && now % self.config.metadata_refresh_ticks == 0
    }

    /// Called when a message from a future height arrives. True the first time per local
    /// height, so the caller asks for metadata once rather than on every such message.
    pub fn note_future_height(&mut self, local_height: Height) -> bool {
        if self.lag_reported_at == Some(local_height) {
            return false;
        }
        self.lag_reported_at = Some(local_height);
        true
    }

    /// Drops bookkeeping for heights the node has already committed.
    pub fn prune(&mut self, local_height: Height) {
        self.in_flight = self.in_flight.split_off(&local_height);
        self.buffered = self.buffered.split_off(&local_height);
        self.attempts = self.attempts.split_off(&local_height);
    }

    pub fn reset(&mut self) {
        self.peers.clear();
        self.in_flight.clear();
        self.buffered.clear();
        self.attempts.clear();
        self.lag_reported_at = None;
    }
}
