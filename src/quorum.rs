use crate::crypto::{Address, Hash, PublicKey, Signature, aggregate, verify, verify_aggregate};
use crate::types::{QuorumCertificate, ViewStamp, Vote, vote_digest};
use crate::validators::ValidatorSet;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Certificate phase {0} is not a voting phase")]
    InvalidPhase(crate::types::Phase),
    #[error("Unknown signer {0}")]
    UnknownSigner(Address),
    #[error("Duplicate signer {0}")]
    DuplicateSigner(Address),
    #[error("Insufficient signers: have {have}, need {need}")]
    InsufficientSigners { have: usize, need: usize },
    #[error("Aggregate signature does not verify")]
    BadSignature,
}

impl QuorumCertificate {
    pub fn stamp(&self) -> ViewStamp {
        ViewStamp::new(self.height, self.round, self.phase)
    }

    /// Checks that the signers are distinct known validators forming a quorum and
    /// that the aggregate signature covers this certificate's vote digest.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), CertificateError> {
        if !self.phase.is_vote_phase() {
            return Err(CertificateError::InvalidPhase(self.phase));
        }

        let mut seen = BTreeSet::new();
        let mut keys: Vec<PublicKey> = Vec::with_capacity(self.signers.len());
        for signer in &self.signers {
            if !seen.insert(*signer) {
                return Err(CertificateError::DuplicateSigner(*signer));
            }
            let validator = validators
                .get(signer)
                .ok_or(CertificateError::UnknownSigner(*signer))?;
            keys.push(validator.public_key.clone());
        }

        let need = validators.quorum_size();
        if keys.len() < need {
            return Err(CertificateError::InsufficientSigners {
                have: keys.len(),
                need,
            });
        }

        let digest = vote_digest(self.height, self.round, self.phase, &self.block_hash);
        if !verify_aggregate(&keys, &digest.0, &self.signature) {
            return Err(CertificateError::BadSignature);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Stale vote for {got}, aggregating {pending:?}")]
    Stale {
        got: ViewStamp,
        pending: Option<ViewStamp>,
    },
    #[error("Validator {0} already voted")]
    DuplicateVote(Address),
    #[error("Vote from unknown validator {0}")]
    UnknownValidator(Address),
    #[error("Invalid vote signature from {0}")]
    InvalidSignature(Address),
    #[error("Aggregate signature could not be built")]
    Aggregation,
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
}

/// Collects votes for the one (height, round, phase) the leader is currently waiting on.
///
/// Votes are grouped by block hash; a validator is counted at most once per view,
/// whichever block it voted for first. The first group to reach a byzantine quorum
/// yields a certificate, which is verified before it is handed out.
#[derive(Debug, Default)]
pub struct QuorumCertificateAggregator {
    pending: Option<ViewStamp>,
    votes: BTreeMap<Hash, BTreeMap<Address, Signature>>,
    voters: BTreeSet<Address>,
    certified: bool,
}

impl QuorumCertificateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts aggregating for `stamp`, discarding everything collected so far.
    pub fn expect(&mut self, stamp: ViewStamp) {
        self.pending = Some(stamp);
        self.votes.clear();
        self.voters.clear();
        self.certified = false;
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.votes.clear();
        self.voters.clear();
        self.certified = false;
    }

    pub fn pending(&self) -> Option<ViewStamp> {
        self.pending
    }

    /// Number of distinct validators counted for `block_hash` in the pending view.
    pub fn vote_count(&self, block_hash: &Hash) -> usize {
        self.votes.get(block_hash).map_or(0, |v| v.len())
    }

    /// Records a vote. Returns `Ok(Some(qc))` exactly once, when the quorum is first reached.
    pub fn add_vote(
        &mut self,
        vote: &Vote,
        validators: &ValidatorSet,
    ) -> Result<Option<QuorumCertificate>, AggregationError> {
        let stamp = vote.stamp();
        if self.pending != Some(stamp) {
            return Err(AggregationError::Stale {
                got: stamp,
                pending: self.pending,
            });
        }
        if self.voters.contains(&vote.validator) {
            return Err(AggregationError::DuplicateVote(vote.validator));
        }
        let validator = validators
            .get(&vote.validator)
            .ok_or(AggregationError::UnknownValidator(vote.validator))?;

        let digest = vote_digest(vote.height, vote.round, vote.phase, &vote.block_hash);
        if !verify(&validator.public_key, &digest.0, &vote.signature) {
            return Err(AggregationError::InvalidSignature(vote.validator));
        }

        self.voters.insert(vote.validator);
        let group = self.votes.entry(vote.block_hash).or_default();
        group.insert(vote.validator, vote.signature.clone());
        debug!(
            "Vote from {} for {} at {} ({}/{})",
            vote.validator,
            vote.block_hash,
            stamp,
            group.len(),
            validators.quorum_size()
        );

        if self.certified || group.len() < validators.quorum_size() {
            return Ok(None);
        }

        let signers: Vec<Address> = group.keys().copied().collect();
        let signatures: Vec<Signature> = group.values().cloned().collect();
        let signature = aggregate(&signatures).ok_or(AggregationError::Aggregation)?;
        let qc = QuorumCertificate {
            height: vote.height,
            round: vote.round,
            phase: vote.phase,
            block_hash: vote.block_hash,
            signature,
            signers,
        };
        qc.verify(validators)?;
        self.certified = true;
        Ok(Some(qc))
    }
}
