use crate::crypto::{Address, PublicKey};
use crate::types::{Height, NodeId, Round};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("Validator set is empty")]
    Empty,
    #[error("Duplicate validator {0}")]
    Duplicate(Address),
}

#[derive(Clone, Debug)]
pub struct Validator {
    pub id: NodeId,
    pub address: Address,
    pub public_key: PublicKey,
}

/// Validators ordered by address. Node ids are positions in that order, starting at 1.
/// The set is fixed for the lifetime of the engine.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(keys: Vec<PublicKey>) -> Result<Self, ValidatorSetError> {
        if keys.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut entries: Vec<(Address, PublicKey)> =
            keys.into_iter().map(|pk| (pk.address(), pk)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in entries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(ValidatorSetError::Duplicate(pair[0].0));
            }
        }

        let validators = entries
            .into_iter()
            .enumerate()
            .map(|(i, (address, public_key))| Validator {
                id: i as NodeId + 1,
                address,
                public_key,
            })
            .collect();
        Ok(Self { validators })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Byzantine quorum: 2f+1 of 3f+1, i.e. floor(2n/3) + 1.
    pub fn quorum_size(&self) -> usize {
        (self.validators.len() * 2) / 3 + 1
    }

    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| &self.validators[i])
    }

    pub fn by_id(&self, id: NodeId) -> Option<&Validator> {
        if id == 0 {
            return None;
        }
        self.validators.get(id as usize - 1)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.validators.iter().map(|v| v.address).collect()
    }

    /// Deterministic leader for (height, round): SHA-256(height || round) mod n.
    pub fn leader_for(&self, height: Height, round: Round) -> &Validator {
        let mut hasher = Sha256::new();
        hasher.update(height.to_be_bytes());
        hasher.update(round.to_be_bytes());
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(word) % self.validators.len() as u64;
        &self.validators[index as usize]
    }
}
