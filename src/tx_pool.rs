use crate::crypto::{Hash, hash_data};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Transaction already exists")]
    AlreadyExists,
    #[error("Empty transaction")]
    Empty,
    #[error("Transaction of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
    #[error("Pool is full ({0} transactions)")]
    Full(usize),
    #[error("Pool lock poisoned")]
    Poisoned,
}

#[derive(Default)]
struct PoolInner {
    seen: HashSet<Hash>,
    queue: VecDeque<(Hash, Vec<u8>)>,
}

/// FIFO pool of opaque transactions, deduplicated by content hash.
/// Clones share the same pool.
#[derive(Clone)]
pub struct TxPool {
    inner: Arc<Mutex<PoolInner>>,
    max_transactions: usize,
    max_transaction_bytes: usize,
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new(10_000, 64 * 1024)
    }
}

impl TxPool {
    pub fn new(max_transactions: usize, max_transaction_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            max_transactions,
            max_transaction_bytes,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolInner>, PoolError> {
        self.inner.lock().map_err(|_| PoolError::Poisoned)
    }

    /// Add a transaction to the back of the queue. Returns its hash.
    pub fn add_transaction(&self, tx: Vec<u8>) -> Result<Hash, PoolError> {
        if tx.is_empty() {
            return Err(PoolError::Empty);
        }
        if tx.len() > self.max_transaction_bytes {
            return Err(PoolError::TooLarge(tx.len(), self.max_transaction_bytes));
        }
        let hash = hash_data(&tx);

        let mut inner = self.lock()?;
        if inner.seen.contains(&hash) {
            return Err(PoolError::AlreadyExists);
        }
        if inner.queue.len() >= self.max_transactions {
            return Err(PoolError::Full(inner.queue.len()));
        }
        inner.seen.insert(hash);
        inner.queue.push_back((hash, tx));
        Ok(hash)
    }

    /// Oldest `max` transactions, left in the pool until committed.
    pub fn reap(&self, max: usize) -> Result<Vec<Vec<u8>>, PoolError> {
        let inner = self.lock()?;
        Ok(inner
            .queue
            .iter()
            .take(max)
            .map(|(_, tx)| tx.clone())
            .collect())
    }

    /// Remove transactions that were included in a committed block.
    pub fn remove_transactions(&self, txs: &[Vec<u8>]) -> Result<(), PoolError> {
        let committed: HashSet<Hash> = txs.iter().map(hash_data).collect();
        let mut inner = self.lock()?;
        inner.queue.retain(|(hash, _)| !committed.contains(hash));
        for hash in &committed {
            inner.seen.remove(hash);
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), PoolError> {
        let mut inner = self.lock()?;
        inner.queue.clear();
        inner.seen.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
