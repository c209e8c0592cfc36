use crate::crypto::{Address, Hash, PrivateKey, Signature, hash_data, sign};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Block height (u64). Height 1 is the first block; 0 means "nothing committed".
pub type Height = u64;
/// Round within a height, reset to 0 on every new height.
pub type Round = u64;
/// Position of a validator in the ordered validator set (1..=n).
pub type NodeId = u64;

/// Consensus phases, in the order a replica walks through them within a round.
/// `Decide` is never a resting phase: it tags the leader's broadcast of the commit QC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    NewRound,
    Propose,
    Prepare,
    PreCommit,
    Commit,
    Decide,
}

impl Phase {
    /// The vote a replica answers with after entering this phase from a leader message.
    pub fn vote_phase(self) -> Option<Phase> {
        match self {
            Phase::Propose => Some(Phase::Prepare),
            Phase::PreCommit => Some(Phase::PreCommit),
            Phase::Commit => Some(Phase::Commit),
            _ => None,
        }
    }

    /// The leader message that follows a QC of this (vote) phase.
    pub fn after_certificate(self) -> Option<Phase> {
        match self {
            Phase::Prepare => Some(Phase::PreCommit),
            Phase::PreCommit => Some(Phase::Commit),
            Phase::Commit => Some(Phase::Decide),
            _ => None,
        }
    }

    pub fn is_vote_phase(self) -> bool {
        matches!(self, Phase::Prepare | Phase::PreCommit | Phase::Commit)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// (height, round, phase) captured when a timer or fetch is created.
/// Work whose stamp no longer matches the replica's view is discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewStamp {
    pub height: Height,
    pub round: Round,
    pub phase: Phase,
}

impl ViewStamp {
    pub fn new(height: Height, round: Round, phase: Phase) -> Self {
        Self {
            height,
            round,
            phase,
        }
    }
}

impl fmt::Display for ViewStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h={} r={} {}", self.height, self.round, self.phase)
    }
}

/// Header of a block. `(height, state_hash)` identifies the block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: Height,
    /// Round the block was built in; the proposer is the leader of (height, round).
    pub round: Round,
    pub state_hash: Hash,
    pub prev_state_hash: Hash,
    pub proposer_address: Address,
    /// Commit QC for this block, attached when the block is finalized.
    pub quorum_certificate: Option<QuorumCertificate>,
}

/// A block: header plus ordered opaque transactions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn new(
        height: Height,
        round: Round,
        state_hash: Hash,
        prev_state_hash: Hash,
        proposer_address: Address,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            header: BlockHeader {
                height,
                round,
                state_hash,
                prev_state_hash,
                proposer_address,
                quorum_certificate: None,
            },
            transactions,
        }
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Hash over everything except the embedded certificate, so a block keeps
    /// its identity once its commit QC is attached.
    pub fn hash(&self) -> Hash {
        hash_data(&(
            self.header.height,
            self.header.round,
            &self.header.state_hash,
            &self.header.prev_state_hash,
            &self.header.proposer_address,
            &self.transactions,
        ))
    }

    pub fn with_certificate(mut self, qc: QuorumCertificate) -> Self {
        self.header.quorum_certificate = Some(qc);
        self
    }
}

/// Bytes every validator signs when voting for `block_hash` at a given view.
pub fn vote_digest(height: Height, round: Round, phase: Phase, block_hash: &Hash) -> Hash {
    hash_data(&("vote", height, round, phase, block_hash))
}

/// A vote from a validator for a block at (height, round, phase).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub validator: Address,
    pub height: Height,
    pub round: Round,
    pub phase: Phase,
    pub block_hash: Hash,
    pub signature: Signature,
}

impl Vote {
    pub fn new(
        key: &PrivateKey,
        validator: Address,
        stamp: ViewStamp,
        block_hash: Hash,
    ) -> Self {
        let digest = vote_digest(stamp.height, stamp.round, stamp.phase, &block_hash);
        Self {
            validator,
            height: stamp.height,
            round: stamp.round,
            phase: stamp.phase,
            block_hash,
            signature: sign(key, &digest.0),
        }
    }

    pub fn stamp(&self) -> ViewStamp {
        ViewStamp::new(self.height, self.round, self.phase)
    }
}

/// A Quorum Certificate (QC) proves that a byzantine quorum voted for a block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuorumCertificate {
    pub height: Height,
    pub round: Round,
    pub phase: Phase,
    pub block_hash: Hash,
    pub signature: Signature,  // Aggregated signature
    pub signers: Vec<Address>, // Sorted addresses of the signers
}

/// A leader message. `phase` is the phase replicas enter on accepting it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub phase: Phase,
    pub sender: Address,
    pub block: Option<Block>,
    pub justify: Option<QuorumCertificate>,
    pub signature: Signature,
}

impl Proposal {
    pub fn new(
        key: &PrivateKey,
        sender: Address,
        stamp: ViewStamp,
        block: Option<Block>,
        justify: Option<QuorumCertificate>,
    ) -> Self {
        let digest = Self::digest(stamp, &sender, block.as_ref(), justify.as_ref());
        Self {
            height: stamp.height,
            round: stamp.round,
            phase: stamp.phase,
            sender,
            block,
            justify,
            signature: sign(key, &digest.0),
        }
    }

    pub fn digest(
        stamp: ViewStamp,
        sender: &Address,
        block: Option<&Block>,
        justify: Option<&QuorumCertificate>,
    ) -> Hash {
        hash_data(&(
            "proposal",
            stamp.height,
            stamp.round,
            stamp.phase,
            sender,
            block.map(|b| b.hash()),
            justify,
        ))
    }

    pub fn signing_digest(&self) -> Hash {
        Self::digest(
            self.stamp(),
            &self.sender,
            self.block.as_ref(),
            self.justify.as_ref(),
        )
    }

    pub fn stamp(&self) -> ViewStamp {
        ViewStamp::new(self.height, self.round, self.phase)
    }
}

/// Phase-tagged consensus payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn stamp(&self) -> ViewStamp {
        match self {
            ConsensusMessage::Proposal(p) => p.stamp(),
            ConsensusMessage::Vote(v) => v.stamp(),
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            ConsensusMessage::Proposal(p) => p.sender,
            ConsensusMessage::Vote(v) => v.validator,
        }
    }
}

/// Range of committed blocks a peer can serve.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSyncMetadata {
    pub peer_address: Address,
    pub min_height: Height,
    pub max_height: Height,
}

impl StateSyncMetadata {
    pub fn covers(&self, height: Height) -> bool {
        self.min_height > 0 && self.min_height <= height && height <= self.max_height
    }
}

/// Answer to a block request. Not-found is explicit, never an empty block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockReply {
    Found(Box<Block>),
    NotFound,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StateSyncMessage {
    MetadataRequest {
        peer_address: Address,
    },
    MetadataResponse(StateSyncMetadata),
    GetBlockRequest {
        peer_address: Address,
        height: Height,
    },
    GetBlockResponse {
        peer_address: Address,
        height: Height,
        block: BlockReply,
    },
}

/// Diagnostic actions. Not part of the safety-critical path.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DebugAction {
    ResetToGenesis,
    PrintNodeState,
    TriggerNextView,
    TogglePacemakerMode,
    ShowLatestBlockInStore,
}

impl FromStr for DebugAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset_to_genesis" | "reset" => Ok(DebugAction::ResetToGenesis),
            "print_node_state" | "state" => Ok(DebugAction::PrintNodeState),
            "trigger_next_view" | "next" => Ok(DebugAction::TriggerNextView),
            "toggle_pacemaker_mode" | "toggle" => Ok(DebugAction::TogglePacemakerMode),
            "show_latest_block_in_store" | "latest" => Ok(DebugAction::ShowLatestBlockInStore),
            other => Err(format!("unknown debug action: {}", other)),
        }
    }
}

/// Snapshot of a replica's current view.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusNodeState {
    pub height: Height,
    pub round: Round,
    pub phase: Phase,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair_from_id, verify};

    #[test]
    fn test_block_hash_ignores_certificate() {
        let (pk, sk) = generate_keypair_from_id(1);
        let block = Block::new(3, 0, Hash([1; 32]), Hash([2; 32]), pk.address(), vec![vec![9]]);
        let hash = block.hash();

        let vote = Vote::new(&sk, pk.address(), ViewStamp::new(3, 0, Phase::Commit), hash);
        let qc = QuorumCertificate {
            height: 3,
            round: 0,
            phase: Phase::Commit,
            block_hash: hash,
            signature: vote.signature.clone(),
            signers: vec![pk.address()],
        };
        assert_eq!(block.clone().with_certificate(qc).hash(), hash);
    }

    #[test]
    fn test_proposal_signature_covers_contents() {
        let (pk, sk) = generate_keypair_from_id(2);
        let stamp = ViewStamp::new(1, 0, Phase::Propose);
        let block = Block::new(1, 0, Hash([5; 32]), Hash::default(), pk.address(), vec![]);
        let mut proposal = Proposal::new(&sk, pk.address(), stamp, Some(block), None);

        assert!(verify(&pk, &proposal.signing_digest().0, &proposal.signature));

        proposal.round = 1;
        assert!(!verify(&pk, &proposal.signing_digest().0, &proposal.signature));
    }

    #[test]
    fn test_phase_pipeline() {
        assert_eq!(Phase::Propose.vote_phase(), Some(Phase::Prepare));
        assert_eq!(Phase::Prepare.after_certificate(), Some(Phase::PreCommit));
        assert_eq!(Phase::Commit.after_certificate(), Some(Phase::Decide));
        assert!(Phase::NewRound < Phase::Propose && Phase::PreCommit < Phase::Commit);
        assert!(Phase::Decide.vote_phase().is_none());
    }

    #[test]
    fn test_debug_action_parse() {
        assert_eq!(
            "trigger_next_view".parse::<DebugAction>(),
            Ok(DebugAction::TriggerNextView)
        );
        assert!("bogus".parse::<DebugAction>().is_err());
    }
}
