use crate::crypto::{Address, Hash, PrivateKey, verify};
use crate::pacemaker::{Pacemaker, PacemakerConfig};
use crate::quorum::{AggregationError, CertificateError, QuorumCertificateAggregator};
use crate::state_sync::{StateSyncConfig, StateSyncCoordinator, StateSyncError};
use crate::storage::{ConsensusState, Persistence, StorageError};
use crate::types::{
    Block, BlockReply, ConsensusMessage, ConsensusNodeState, DebugAction, Height, NodeId, Phase,
    Proposal, QuorumCertificate, Round, StateSyncMessage, ViewStamp, Vote,
};
use crate::utility::{Utility, UtilityError};
use crate::validators::ValidatorSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Stale message: {0}")]
    Stale(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(#[from] CertificateError),
    #[error("Utility error: {0}")]
    Utility(#[from] UtilityError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
    #[error("Local key {0} is not in the validator set")]
    NotAValidator(Address),
    #[error("Block {height} was stored but its effects could not be committed: {source}")]
    CommitFailed { height: Height, source: UtilityError },
}

impl ConsensusError {
    /// Fatal errors mean the replica can no longer guarantee safety and must stop.
    /// Everything else is an expected consequence of asynchrony or a faulty peer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::Persistence(_)
                | ConsensusError::NotAValidator(_)
                | ConsensusError::CommitFailed { .. }
        )
    }
}

impl From<AggregationError> for ConsensusError {
    fn from(e: AggregationError) -> Self {
        match e {
            AggregationError::Stale { .. } | AggregationError::DuplicateVote(_) => {
                ConsensusError::Stale(e.to_string())
            }
            AggregationError::Certificate(c) => ConsensusError::InvalidCertificate(c),
            other => ConsensusError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<StateSyncError> for ConsensusError {
    fn from(e: StateSyncError) -> Self {
        match e {
            StateSyncError::Storage(s) => ConsensusError::Persistence(s),
            other => ConsensusError::ProtocolViolation(other.to_string()),
        }
    }
}

fn violation(msg: impl Into<String>) -> ConsensusError {
    ConsensusError::ProtocolViolation(msg.into())
}

/// Abstract actions emitted by the consensus state machine.
/// This decouples logic from side-effects (networking, timers).
#[derive(Debug, Clone)]
pub enum ConsensusAction {
    BroadcastProposal(Proposal),
    /// Unicast to the round leader, which may be this node.
    SendVote(Address, Vote),
    BroadcastStateSync(StateSyncMessage),
    SendStateSync(Address, StateSyncMessage),
    /// Schedule `on_timeout(stamp)` after the delay.
    ArmTimer(ViewStamp, Duration),
}

#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub pacemaker: PacemakerConfig,
    pub state_sync: StateSyncConfig,
    pub max_block_transactions: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            pacemaker: PacemakerConfig::default(),
            state_sync: StateSyncConfig::default(),
            max_block_transactions: 500,
        }
    }
}

/// The replica's phase state machine.
///
/// Every public handler runs to completion and returns the actions the caller must
/// perform. Messages that are stale or violate the protocol are logged and dropped
/// inside the handler; only fatal errors are returned.
pub struct ConsensusEngine {
    address: Address,
    key: PrivateKey,
    validators: ValidatorSet,
    persistence: Arc<dyn Persistence>,
    utility: Arc<dyn Utility>,
    pacemaker: Pacemaker,
    aggregator: QuorumCertificateAggregator,
    sync: StateSyncCoordinator,
    max_block_transactions: usize,

    height: Height,
    round: Round,
    phase: Phase,
    syncing: bool,

    // Committed tip.
    last_state_hash: Hash,
    last_block_hash: Hash,
    last_commit_qc: Option<QuorumCertificate>,

    pending_block: Option<Block>,
    locked_block: Option<Block>,
    last_vote: Option<ViewStamp>,
}

impl ConsensusEngine {
    pub fn new(
        key: PrivateKey,
        validators: ValidatorSet,
        persistence: Arc<dyn Persistence>,
        utility: Arc<dyn Utility>,
        config: ConsensusConfig,
    ) -> Result<Self, ConsensusError> {
        let address = key.public_key().address();
        if !validators.contains(&address) {
            return Err(ConsensusError::NotAValidator(address));
        }

        let mut engine = Self {
            address,
            key,
            validators,
            persistence,
            utility,
            pacemaker: Pacemaker::new(config.pacemaker),
            aggregator: QuorumCertificateAggregator::new(),
            sync: StateSyncCoordinator::new(address, config.state_sync),
            max_block_transactions: config.max_block_transactions,
            height: 1,
            round: 0,
            phase: Phase::NewRound,
            syncing: false,
            last_state_hash: Hash::default(),
            last_block_hash: Hash::default(),
            last_commit_qc: None,
            pending_block: None,
            locked_block: None,
            last_vote: None,
        };
        engine.load_chain()?;
        Ok(engine)
    }

    fn load_chain(&mut self) -> Result<(), ConsensusError> {
        self.height = 1;
        self.round = 0;
        self.phase = Phase::NewRound;
        self.last_state_hash = Hash::default();
        self.last_block_hash = Hash::default();
        self.last_commit_qc = None;
        self.pending_block = None;
        self.locked_block = None;
        self.last_vote = None;

        if let Some(tip) = self.persistence.latest_block()? {
            self.height = tip.height() + 1;
            self.last_state_hash = tip.header.state_hash;
            self.last_block_hash = tip.hash();
            self.last_commit_qc = tip.header.quorum_certificate.clone();
        }
        if let Some(state) = self.persistence.get_consensus_state()? {
            self.last_vote = state.last_vote;
            if state.height == self.height {
                self.round = state.round;
                self.locked_block = state.locked_block;
            }
            log::info!(
                "Loaded persistent state: height {}, round {}, last vote {:?}",
                self.height,
                self.round,
                self.last_vote
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.validators.get(&self.address).map(|v| v.id)
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stamp(&self) -> ViewStamp {
        ViewStamp::new(self.height, self.round, self.phase)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn is_manual(&self) -> bool {
        self.pacemaker.is_manual()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn locked_block(&self) -> Option<&Block> {
        self.locked_block.as_ref()
    }

    pub fn pacemaker_config(&self) -> &PacemakerConfig {
        self.pacemaker.config()
    }

    pub fn is_leader(&self) -> bool {
        !self.syncing && self.validators.leader_for(self.height, self.round).address == self.address
    }

    /// Leader of the current view; unknown while catching up.
    pub fn leader_id(&self) -> Option<NodeId> {
        if self.syncing {
            return None;
        }
        Some(self.validators.leader_for(self.height, self.round).id)
    }

    pub fn node_state(&self) -> ConsensusNodeState {
        ConsensusNodeState {
            height: self.height,
            round: self.round,
            phase: self.phase,
            is_leader: self.is_leader(),
            leader_id: self.leader_id(),
        }
    }

    /// Same answer on every replica. The phase does not influence the choice.
    pub fn get_leader_for_view(&self, height: Height, round: Round, _phase: Phase) -> NodeId {
        self.validators.leader_for(height, round).id
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Asks peers where the chain is and enters the first round.
    pub fn start(&mut self) -> Result<Vec<ConsensusAction>, ConsensusError> {
        log::info!(
            "Starting consensus at height {} as node {:?} ({})",
            self.height,
            self.node_id(),
            self.address
        );
        let mut out = vec![self.metadata_request()];
        let res = self.enter_new_round(&mut out);
        self.absorb(res)?;
        Ok(out)
    }

    pub fn handle_consensus_message(
        &mut self,
        msg: ConsensusMessage,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut out = Vec::new();
        let res = match msg {
            ConsensusMessage::Proposal(p) => self.on_proposal(p, &mut out),
            ConsensusMessage::Vote(v) => self.on_vote(v, &mut out),
        };
        self.absorb(res)?;
        Ok(out)
    }

    pub fn handle_state_sync_message(
        &mut self,
        msg: StateSyncMessage,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut out = Vec::new();
        let res = match msg {
            StateSyncMessage::MetadataRequest { peer_address } => {
                self.on_metadata_request(peer_address, &mut out)
            }
            StateSyncMessage::MetadataResponse(metadata) => {
                self.sync.record_metadata(metadata);
                self.check_sync(&mut out)
            }
            StateSyncMessage::GetBlockRequest {
                peer_address,
                height,
            } => self.on_block_request(peer_address, height, &mut out),
            StateSyncMessage::GetBlockResponse {
                peer_address,
                height,
                block,
            } => self.on_block_response(peer_address, height, block, &mut out),
        };
        self.absorb(res)?;
        Ok(out)
    }

    pub fn handle_debug_message(
        &mut self,
        action: DebugAction,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut out = Vec::new();
        match action {
            DebugAction::ResetToGenesis => {
                log::warn!("Resetting to genesis from height {}", self.height);
                self.persistence.reset()?;
                self.sync.reset();
                self.aggregator.reset();
                self.pacemaker.disarm();
                self.syncing = false;
                self.load_chain()?;
                let res = self.enter_new_round(&mut out);
                self.absorb(res)?;
            }
            DebugAction::PrintNodeState => {
                log::info!(
                    "Node state: {:?} (syncing: {}, manual: {}, locked: {:?})",
                    self.node_state(),
                    self.syncing,
                    self.pacemaker.is_manual(),
                    self.locked_block.as_ref().map(|b| b.hash())
                );
            }
            DebugAction::TriggerNextView => return self.advance_view(),
            DebugAction::TogglePacemakerMode => {
                let manual = self.pacemaker.toggle_manual_mode();
                if !manual && !self.syncing {
                    self.arm_timer(&mut out);
                }
            }
            DebugAction::ShowLatestBlockInStore => match self.persistence.latest_block()? {
                Some(block) => log::info!(
                    "Latest block in store: height {} hash {} ({} txs)",
                    block.height(),
                    block.hash(),
                    block.transactions.len()
                ),
                None => log::info!("Block store is empty"),
            },
        }
        Ok(out)
    }

    /// A timer armed for `stamp` fired. Ignored unless it is the live timer and the
    /// replica has made no progress since it was armed.
    pub fn on_timeout(&mut self, stamp: ViewStamp) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut out = Vec::new();
        if self.syncing || !self.pacemaker.on_timeout(stamp, self.stamp()) {
            return Ok(out);
        }
        log::warn!("View {} timed out; moving to round {}", stamp, self.round + 1);
        let res = self.next_round(&mut out);
        self.absorb(res)?;
        Ok(out)
    }

    /// Forced view change, as a timeout would do, but externally triggered.
    pub fn advance_view(&mut self) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut out = Vec::new();
        if self.syncing {
            log::info!("Not advancing the view while catching up");
            return Ok(out);
        }
        self.pacemaker.disarm();
        log::info!("Manually advancing to round {}", self.round + 1);
        let res = self.next_round(&mut out);
        self.absorb(res)?;
        Ok(out)
    }

    /// Periodic state-sync housekeeping: refresh peer metadata, re-issue stalled fetches.
    pub fn on_sync_tick(&mut self) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut out = Vec::new();
        let refresh = self.sync.on_tick();
        if self.syncing || refresh {
            out.push(self.metadata_request());
        }
        if self.syncing {
            let res = self.check_sync(&mut out);
            self.absorb(res)?;
        }
        Ok(out)
    }

    /// Feeds a peer's advertised range as if it had arrived in a `MetadataResponse`.
    pub fn set_aggregated_state_sync_metadata(
        &mut self,
        min_height: Height,
        max_height: Height,
        peer_address: Address,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        self.handle_state_sync_message(StateSyncMessage::MetadataResponse(
            crate::types::StateSyncMetadata {
                peer_address,
                min_height,
                max_height,
            },
        ))
    }

    fn absorb(&self, result: Result<(), ConsensusError>) -> Result<(), ConsensusError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                log::error!("Unrecoverable consensus error at {}: {}", self.stamp(), e);
                Err(e)
            }
            Err(ConsensusError::Stale(reason)) => {
                log::debug!("Dropping stale message at {}: {}", self.stamp(), reason);
                Ok(())
            }
            Err(ConsensusError::InvalidCertificate(e)) => {
                log::error!("certificate rejected at {}: {}", self.stamp(), e);
                Ok(())
            }
            Err(e) => {
                log::warn!("Dropping message at {}: {}", self.stamp(), e);
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Rounds
    // -------------------------------------------------------------------------

    fn arm_timer(&mut self, out: &mut Vec<ConsensusAction>) {
        let stamp = self.stamp();
        if let Some(delay) = self.pacemaker.arm(stamp) {
            out.push(ConsensusAction::ArmTimer(stamp, delay));
        }
    }

    fn next_round(&mut self, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        self.round += 1;
        self.enter_new_round(out)
    }

    fn enter_new_round(&mut self, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        self.phase = Phase::NewRound;
        self.pending_block = None;
        self.aggregator.reset();
        if self.syncing {
            return Ok(());
        }

        let leader = self.validators.leader_for(self.height, self.round);
        let (leader_id, leader_address) = (leader.id, leader.address);
        log::info!(
            "Entering round {} at height {} (leader {})",
            self.round,
            self.height,
            leader_id
        );
        self.arm_timer(out);
        if leader_address == self.address {
            self.propose(out)?;
        }
        Ok(())
    }

    fn propose(&mut self, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        let block = match &self.locked_block {
            Some(locked) => {
                log::info!("Re-proposing locked block {}", locked.hash());
                locked.clone()
            }
            None => {
                let mut uow = self.utility.new_unit_of_work(self.height)?;
                let built = uow.create_proposal(self.last_state_hash, self.max_block_transactions);
                uow.release();
                let (state_hash, transactions) = built?;
                Block::new(
                    self.height,
                    self.round,
                    state_hash,
                    self.last_state_hash,
                    self.address,
                    transactions,
                )
            }
        };

        self.phase = Phase::Propose;
        self.aggregator
            .expect(ViewStamp::new(self.height, self.round, Phase::Prepare));
        let proposal = Proposal::new(
            &self.key,
            self.address,
            self.stamp(),
            Some(block),
            self.last_commit_qc.clone(),
        );
        log::info!(
            "Proposing block at height {} round {}",
            self.height,
            self.round
        );
        out.push(ConsensusAction::BroadcastProposal(proposal.clone()));
        self.arm_timer(out);
        self.on_proposal(proposal, out)
    }

    // -------------------------------------------------------------------------
    // Proposals
    // -------------------------------------------------------------------------

    fn on_proposal(
        &mut self,
        proposal: Proposal,
        out: &mut Vec<ConsensusAction>,
    ) -> Result<(), ConsensusError> {
        if proposal.height < self.height {
            return Err(ConsensusError::Stale(format!(
                "proposal for height {} at height {}",
                proposal.height, self.height
            )));
        }
        if proposal.height > self.height {
            self.note_lag(out);
            return Err(ConsensusError::Stale(format!(
                "proposal for future height {}",
                proposal.height
            )));
        }
        if self.syncing {
            return Err(ConsensusError::Stale("proposal while catching up".into()));
        }

        let leader = self.validators.leader_for(proposal.height, proposal.round);
        if proposal.sender != leader.address {
            return Err(violation(format!(
                "proposal from {} but the leader of round {} is {}",
                proposal.sender, proposal.round, leader.address
            )));
        }
        if !verify(
            &leader.public_key,
            &proposal.signing_digest().0,
            &proposal.signature,
        ) {
            return Err(violation("bad proposal signature"));
        }
        let block = proposal
            .block
            .clone()
            .ok_or_else(|| violation("proposal without a block"))?;
        if block.height() != self.height {
            return Err(violation(format!(
                "proposal carries block for height {}",
                block.height()
            )));
        }

        // A commit certificate settles the height whatever round the replica is in.
        if proposal.phase == Phase::Decide {
            return self.on_decide(proposal, block, out);
        }

        if proposal.round < self.round {
            return Err(ConsensusError::Stale(format!(
                "proposal for round {} in round {}",
                proposal.round, self.round
            )));
        }
        // A higher round only takes effect once the proposal has passed every check.
        let jump = proposal.round > self.round;
        let current = if jump { Phase::NewRound } else { self.phase };

        let target = proposal
            .phase
            .vote_phase()
            .ok_or_else(|| violation(format!("unexpected proposal phase {}", proposal.phase)))?;
        if target <= current {
            return Err(ConsensusError::Stale(format!(
                "{} proposal while in {}",
                proposal.phase, self.phase
            )));
        }

        self.check_justify(&proposal, &block)?;
        if let Some(locked) = &self.locked_block {
            if locked.hash() != block.hash() {
                return Err(violation(format!(
                    "block {} conflicts with locked block {}",
                    block.hash(),
                    locked.hash()
                )));
            }
        }
        self.validate_block(&block, proposal.round)?;

        if jump {
            log::info!(
                "Jumping from round {} to round {} at height {}",
                self.round,
                proposal.round,
                self.height
            );
            self.round = proposal.round;
            self.aggregator.reset();
        }
        let block_hash = block.hash();
        self.phase = target;
        if target == Phase::Commit {
            log::debug!("Locking on block {} at height {}", block_hash, self.height);
            self.locked_block = Some(block.clone());
        }
        self.pending_block = Some(block);
        self.vote(block_hash, out)?;
        self.arm_timer(out);
        Ok(())
    }

    fn on_decide(
        &mut self,
        proposal: Proposal,
        block: Block,
        out: &mut Vec<ConsensusAction>,
    ) -> Result<(), ConsensusError> {
        self.check_justify(&proposal, &block)?;
        self.validate_block(&block, proposal.round)?;
        let qc = proposal
            .justify
            .ok_or_else(|| violation("decide without commit certificate"))?;
        self.commit_block(block.with_certificate(qc))?;
        self.after_commit(out)
    }

    /// The certificate a leader message must carry: the parent's commit QC for `Propose`,
    /// otherwise the QC of the previous phase for this very block.
    fn check_justify(&self, proposal: &Proposal, block: &Block) -> Result<(), ConsensusError> {
        if proposal.phase == Phase::Propose {
            if self.height == 1 {
                return match proposal.justify {
                    None => Ok(()),
                    Some(_) => Err(violation("first block cannot have a parent certificate")),
                };
            }
            let qc = proposal
                .justify
                .as_ref()
                .ok_or_else(|| violation("proposal does not carry the parent commit certificate"))?;
            if qc.phase != Phase::Commit
                || qc.height + 1 != self.height
                || qc.block_hash != self.last_block_hash
            {
                return Err(violation(format!(
                    "justify {} for {} does not extend the committed tip",
                    qc.stamp(),
                    qc.block_hash
                )));
            }
            if self.last_commit_qc.as_ref() != Some(qc) {
                qc.verify(&self.validators)?;
            }
            return Ok(());
        }

        let expected = match proposal.phase {
            Phase::PreCommit => Phase::Prepare,
            Phase::Commit => Phase::PreCommit,
            Phase::Decide => Phase::Commit,
            other => return Err(violation(format!("unexpected proposal phase {}", other))),
        };
        let qc = proposal
            .justify
            .as_ref()
            .ok_or_else(|| violation(format!("{} proposal without certificate", proposal.phase)))?;
        if qc.phase != expected
            || qc.height != proposal.height
            || qc.round != proposal.round
            || qc.block_hash != block.hash()
        {
            return Err(violation(format!(
                "certificate {} does not match {} proposal",
                qc.stamp(),
                proposal.phase
            )));
        }
        qc.verify(&self.validators)?;
        Ok(())
    }

    fn validate_block(&self, block: &Block, round: Round) -> Result<(), ConsensusError> {
        let hash = block.hash();
        let known = |b: &Option<Block>| b.as_ref().is_some_and(|b| b.hash() == hash);
        if known(&self.pending_block) || known(&self.locked_block) {
            return Ok(());
        }

        if block.height() != self.height {
            return Err(violation(format!("block height {}", block.height())));
        }
        if block.header.round > round {
            return Err(violation("block built in a later round"));
        }
        let builder = self.validators.leader_for(block.height(), block.header.round);
        if block.header.proposer_address != builder.address {
            return Err(violation(format!(
                "block proposer {} is not the leader of round {}",
                block.header.proposer_address, block.header.round
            )));
        }
        if block.header.prev_state_hash != self.last_state_hash {
            return Err(violation("block does not build on the committed state"));
        }

        let mut uow = self.utility.new_unit_of_work(self.height)?;
        let applied = uow.apply_block(block);
        uow.release();
        if applied? != block.header.state_hash {
            return Err(violation(format!("state hash mismatch for block {}", hash)));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Votes
    // -------------------------------------------------------------------------

    fn vote(&mut self, block_hash: Hash, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        let stamp = self.stamp();
        if self.last_vote.is_some_and(|last| stamp <= last) {
            log::warn!(
                "Refusing to vote at {}: already voted at {:?}",
                stamp,
                self.last_vote
            );
            return Ok(());
        }
        self.last_vote = Some(stamp);
        self.persist_state()?;

        let leader = self.validators.leader_for(self.height, self.round).address;
        let vote = Vote::new(&self.key, self.address, stamp, block_hash);
        out.push(ConsensusAction::SendVote(leader, vote));
        Ok(())
    }

    fn on_vote(&mut self, vote: Vote, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        if vote.height < self.height {
            return Err(ConsensusError::Stale(format!(
                "vote for height {} at height {}",
                vote.height, self.height
            )));
        }
        if vote.height > self.height {
            self.note_lag(out);
            return Err(ConsensusError::Stale(format!(
                "vote for future height {}",
                vote.height
            )));
        }
        if vote.round < self.round {
            return Err(ConsensusError::Stale(format!(
                "vote for round {} in round {}",
                vote.round, self.round
            )));
        }
        if self.validators.leader_for(vote.height, vote.round).address != self.address {
            return Err(violation(format!(
                "vote from {} for round {} sent to a non-leader",
                vote.validator, vote.round
            )));
        }

        if let Some(qc) = self.aggregator.add_vote(&vote, &self.validators)? {
            self.on_certificate(qc, out)?;
        }
        Ok(())
    }

    /// Leader side: a quorum formed, so move every replica to the next phase.
    fn on_certificate(
        &mut self,
        qc: QuorumCertificate,
        out: &mut Vec<ConsensusAction>,
    ) -> Result<(), ConsensusError> {
        let next = qc
            .phase
            .after_certificate()
            .ok_or_else(|| violation(format!("certificate for phase {}", qc.phase)))?;
        let block = self
            .pending_block
            .clone()
            .filter(|b| b.hash() == qc.block_hash)
            .ok_or_else(|| violation(format!("certificate for unknown block {}", qc.block_hash)))?;
        log::info!("QC formed for {} at {}", qc.block_hash, qc.stamp());

        match next.vote_phase() {
            Some(vote_phase) => self
                .aggregator
                .expect(ViewStamp::new(self.height, self.round, vote_phase)),
            None => self.aggregator.reset(),
        }
        let proposal = Proposal::new(
            &self.key,
            self.address,
            ViewStamp::new(self.height, self.round, next),
            Some(block),
            Some(qc),
        );
        out.push(ConsensusAction::BroadcastProposal(proposal.clone()));
        self.on_proposal(proposal, out)
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Applies and stores a block that carries its commit certificate, then moves to
    /// the next height.
    fn commit_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        let mut uow = self.utility.new_unit_of_work(self.height)?;
        let state_hash = match uow.apply_block(&block) {
            Ok(hash) => hash,
            Err(e) => {
                uow.release();
                return Err(e.into());
            }
        };
        if state_hash != block.header.state_hash {
            uow.release();
            return Err(violation(format!(
                "state hash mismatch applying block {}",
                block.height()
            )));
        }

        self.persistence.store(&block)?;
        // The block is already durable; a ledger that missed it cannot continue.
        uow.commit().map_err(|source| ConsensusError::CommitFailed {
            height: block.height(),
            source,
        })?;
        log::info!(
            "Committed block {} at height {} (round {}, {} txs)",
            block.hash(),
            block.height(),
            self.round,
            block.transactions.len()
        );

        self.last_state_hash = block.header.state_hash;
        self.last_block_hash = block.hash();
        self.last_commit_qc = block.header.quorum_certificate;
        self.height += 1;
        self.round = 0;
        self.phase = Phase::NewRound;
        self.pending_block = None;
        self.locked_block = None;
        self.aggregator.reset();
        self.pacemaker.disarm();
        self.sync.prune(self.height);
        self.persist_state()
    }

    fn after_commit(&mut self, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        if self.sync.is_behind(self.height) {
            self.check_sync(out)
        } else {
            self.enter_new_round(out)
        }
    }

    fn persist_state(&self) -> Result<(), ConsensusError> {
        let state = ConsensusState {
            height: self.height,
            round: self.round,
            locked_block: self.locked_block.clone(),
            last_vote: self.last_vote,
        };
        self.persistence.save_consensus_state(&state)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // State sync
    // -------------------------------------------------------------------------

    fn metadata_request(&self) -> ConsensusAction {
        ConsensusAction::BroadcastStateSync(StateSyncMessage::MetadataRequest {
            peer_address: self.address,
        })
    }

    fn note_lag(&mut self, out: &mut Vec<ConsensusAction>) {
        if self.sync.note_future_height(self.height) {
            log::info!(
                "Seen traffic above height {}; asking peers for their range",
                self.height
            );
            out.push(self.metadata_request());
        }
    }

    fn on_metadata_request(
        &mut self,
        peer: Address,
        out: &mut Vec<ConsensusAction>,
    ) -> Result<(), ConsensusError> {
        if peer == self.address {
            return Ok(());
        }
        let metadata = self.sync.metadata(self.persistence.as_ref())?;
        out.push(ConsensusAction::SendStateSync(
            peer,
            StateSyncMessage::MetadataResponse(metadata),
        ));
        Ok(())
    }

    fn on_block_request(
        &mut self,
        peer: Address,
        height: Height,
        out: &mut Vec<ConsensusAction>,
    ) -> Result<(), ConsensusError> {
        if peer == self.address {
            return Ok(());
        }
        let reply = match self.sync.serve_block(self.persistence.as_ref(), height) {
            Ok(block) => BlockReply::Found(Box::new(block)),
            Err(StateSyncError::NotFound(_)) => {
                log::debug!("Block {} requested by {} is not served here", height, peer);
                BlockReply::NotFound
            }
            Err(e) => return Err(e.into()),
        };
        out.push(ConsensusAction::SendStateSync(
            peer,
            StateSyncMessage::GetBlockResponse {
                peer_address: self.address,
                height,
                block: reply,
            },
        ));
        Ok(())
    }

    fn on_block_response(
        &mut self,
        peer: Address,
        height: Height,
        reply: BlockReply,
        out: &mut Vec<ConsensusAction>,
    ) -> Result<(), ConsensusError> {
        let block = match reply {
            BlockReply::NotFound => {
                self.sync.on_not_found(peer, height);
                return self.check_sync(out);
            }
            BlockReply::Found(block) => *block,
        };
        if height < self.height {
            return Err(ConsensusError::Stale(format!(
                "block {} arrived at height {}",
                height, self.height
            )));
        }
        if let Err(e) = self.validate_certified(&block, height) {
            self.sync.reject(peer, height);
            return Err(e);
        }
        self.sync.on_block(self.height, peer, height, block)?;
        self.apply_synced(out)?;
        self.check_sync(out)
    }

    /// Checks a fetched block stands on its own: a valid commit certificate for it and
    /// a proposer that was entitled to build it. Chaining is checked when applied.
    fn validate_certified(&self, block: &Block, requested: Height) -> Result<(), ConsensusError> {
        if block.height() != requested {
            return Err(violation(format!(
                "requested block {}, received {}",
                requested,
                block.height()
            )));
        }
        let qc = block
            .header
            .quorum_certificate
            .as_ref()
            .ok_or_else(|| violation("synced block carries no commit certificate"))?;
        if qc.phase != Phase::Commit || qc.height != block.height() || qc.block_hash != block.hash()
        {
            return Err(violation(format!(
                "certificate {} does not commit block {}",
                qc.stamp(),
                block.height()
            )));
        }
        if block.header.round > qc.round {
            return Err(violation("block built after its commit round"));
        }
        let builder = self.validators.leader_for(block.height(), block.header.round);
        if block.header.proposer_address != builder.address {
            return Err(violation(format!(
                "synced block {} proposer is not the leader of round {}",
                block.height(),
                block.header.round
            )));
        }
        qc.verify(&self.validators)?;
        Ok(())
    }

    /// Applies buffered blocks strictly in height order.
    fn apply_synced(&mut self, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        let mut applied = false;
        while let Some((peer, block)) = self.sync.pop_ready(self.height) {
            let height = block.height();
            if block.header.prev_state_hash != self.last_state_hash {
                log::warn!("Synced block {} from {} does not extend the local tip", height, peer);
                self.sync.reject(peer, height);
                break;
            }
            match self.commit_block(block) {
                Ok(()) => applied = true,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("Failed to apply synced block {} from {}: {}", height, peer, e);
                    self.sync.reject(peer, height);
                    break;
                }
            }
        }
        if applied && !self.syncing {
            self.after_commit(out)?;
        }
        Ok(())
    }

    /// Enters or leaves catch-up mode and keeps block requests flowing while in it.
    fn check_sync(&mut self, out: &mut Vec<ConsensusAction>) -> Result<(), ConsensusError> {
        if self.sync.is_behind(self.height) {
            if !self.syncing {
                log::info!(
                    "Behind the network (local height {}, network tip {}); catching up",
                    self.height,
                    self.sync.network_max_height()
                );
                self.syncing = true;
                self.phase = Phase::NewRound;
                self.pending_block = None;
                self.pacemaker.disarm();
                self.aggregator.reset();
            }
            for (peer, height) in self.sync.next_requests(self.height) {
                out.push(ConsensusAction::SendStateSync(
                    peer,
                    StateSyncMessage::GetBlockRequest {
                        peer_address: self.address,
                        height,
                    },
                ));
            }
        } else if self.syncing {
            self.syncing = false;
            log::info!("Caught up at height {}", self.height);
            self.enter_new_round(out)?;
        }
        Ok(())
    }
}
