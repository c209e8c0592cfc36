use crate::crypto::{Hash, hash_data};
use crate::tx_pool::{PoolError, TxPool};
use crate::types::{Block, Height};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UtilityError {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Unit of work is for height {expected}, block has height {got}")]
    HeightMismatch { expected: Height, got: Height },
    #[error("Nothing applied to commit")]
    NothingApplied,
}

/// Transaction execution collaborator. One unit of work per height attempt.
pub trait Utility: Send + Sync {
    fn new_unit_of_work(&self, height: Height) -> Result<Box<dyn UnitOfWork>, UtilityError>;
}

pub trait UnitOfWork: Send {
    /// Builds a candidate block body on top of `prev_state_hash`.
    /// Returns the resulting state hash and the chosen transactions.
    fn create_proposal(
        &mut self,
        prev_state_hash: Hash,
        max_transactions: usize,
    ) -> Result<(Hash, Vec<Vec<u8>>), UtilityError>;

    /// Executes `block` and returns the state hash it produces. The caller compares it
    /// against the header.
    fn apply_block(&mut self, block: &Block) -> Result<Hash, UtilityError>;

    /// Makes the last applied block's effects permanent.
    fn commit(self: Box<Self>) -> Result<(), UtilityError>;

    /// Discards the work without side effects.
    fn release(self: Box<Self>);
}

/// State hash of a ledger that only orders opaque transactions.
pub fn ledger_state_hash(height: Height, prev_state_hash: &Hash, transactions: &[Vec<u8>]) -> Hash {
    hash_data(&(height, prev_state_hash, transactions))
}

/// Reference utility: blocks carry pooled transactions, state is the hash chain over them.
#[derive(Clone)]
pub struct LedgerUtility {
    pool: TxPool,
}

impl LedgerUtility {
    pub fn new(pool: TxPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }
}

impl Utility for LedgerUtility {
    fn new_unit_of_work(&self, height: Height) -> Result<Box<dyn UnitOfWork>, UtilityError> {
        Ok(Box::new(LedgerUnitOfWork {
            height,
            pool: self.pool.clone(),
            applied: None,
        }))
    }
}

struct LedgerUnitOfWork {
    height: Height,
    pool: TxPool,
    applied: Option<Vec<Vec<u8>>>,
}

impl UnitOfWork for LedgerUnitOfWork {
    fn create_proposal(
        &mut self,
        prev_state_hash: Hash,
        max_transactions: usize,
    ) -> Result<(Hash, Vec<Vec<u8>>), UtilityError> {
        let txs = self.pool.reap(max_transactions)?;
        let state_hash = ledger_state_hash(self.height, &prev_state_hash, &txs);
        debug!(
            "Built proposal body for height {} with {} txs",
            self.height,
            txs.len()
        );
        Ok((state_hash, txs))
    }

    fn apply_block(&mut self, block: &Block) -> Result<Hash, UtilityError> {
        if block.height() != self.height {
            return Err(UtilityError::HeightMismatch {
                expected: self.height,
                got: block.height(),
            });
        }
        let state_hash = ledger_state_hash(
            self.height,
            &block.header.prev_state_hash,
            &block.transactions,
        );
        self.applied = Some(block.transactions.clone());
        Ok(state_hash)
    }

    fn commit(self: Box<Self>) -> Result<(), UtilityError> {
        let txs = self.applied.ok_or(UtilityError::NothingApplied)?;
        self.pool.remove_transactions(&txs)?;
        Ok(())
    }

    fn release(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;

    #[test]
    fn test_proposal_applies_to_same_state() {
        let pool = TxPool::default();
        pool.add_transaction(b"tx1".to_vec()).unwrap();
        let utility = LedgerUtility::new(pool.clone());

        let mut uow = utility.new_unit_of_work(1).unwrap();
        let (state_hash, txs) = uow.create_proposal(Hash::default(), 10).unwrap();
        uow.release();
        let block = Block::new(1, 0, state_hash, Hash::default(), Address::default(), txs);

        let mut uow = utility.new_unit_of_work(1).unwrap();
        assert_eq!(uow.apply_block(&block).unwrap(), state_hash);
        assert_eq!(pool.len(), 1);
        uow.commit().unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_rejects_wrong_height() {
        let utility = LedgerUtility::new(TxPool::default());
        let mut uow = utility.new_unit_of_work(2).unwrap();
        let block = Block::new(3, 0, Hash::default(), Hash::default(), Address::default(), vec![]);
        assert_eq!(
            uow.apply_block(&block),
            Err(UtilityError::HeightMismatch {
                expected: 2,
                got: 3
            })
        );
        assert_eq!(uow.commit(), Err(UtilityError::NothingApplied));
    }
}
