use crate::types::{Block, Height, Round, ViewStamp};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const TABLE_BLOCKS: TableDefinition<u64, Vec<u8>> = TableDefinition::new("blocks");
const TABLE_META: TableDefinition<&str, Vec<u8>> = TableDefinition::new("meta");

const CONSENSUS_STATE_KEY: &str = "consensus_state";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redb error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Database error: {0}")]
    Database(Box<redb::DatabaseError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Block height {got} does not extend tip {tip}")]
    NonContiguous { tip: Height, got: Height },
    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<redb::Error> for StorageError {
    fn from(e: redb::Error) -> Self {
        Self::Redb(Box::new(e))
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        Self::Table(Box::new(e))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(Box::new(e))
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        Self::Commit(Box::new(e))
    }
}

/// Replica state that must survive a restart so the node never signs twice for a view.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct ConsensusState {
    pub height: Height,
    pub round: Round,
    pub locked_block: Option<Block>,
    pub last_vote: Option<ViewStamp>,
}

/// Durable block store. Blocks are appended at `latest_height() + 1` only.
pub trait Persistence: Send + Sync {
    fn store(&self, block: &Block) -> Result<(), StorageError>;
    fn read(&self, height: Height) -> Result<Option<Block>, StorageError>;
    /// Height of the newest block, 0 when empty.
    fn latest_height(&self) -> Result<Height, StorageError>;
    /// Height of the oldest block still held, 0 when empty.
    fn lowest_height(&self) -> Result<Height, StorageError>;

    fn save_consensus_state(&self, state: &ConsensusState) -> Result<(), StorageError>;
    fn get_consensus_state(&self) -> Result<Option<ConsensusState>, StorageError>;

    /// Drops every block and the saved consensus state.
    fn reset(&self) -> Result<(), StorageError>;

    fn latest_block(&self) -> Result<Option<Block>, StorageError> {
        match self.latest_height()? {
            0 => Ok(None),
            h => self.read(h),
        }
    }
}

fn check_contiguous(tip: Height, block: &Block) -> Result<(), StorageError> {
    if block.height() != tip + 1 {
        return Err(StorageError::NonContiguous {
            tip,
            got: block.height(),
        });
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// In-Memory Storage (tests and throwaway devnets)
// -----------------------------------------------------------------------------
#[derive(Clone, Default)]
pub struct MemStorage {
    blocks: Arc<Mutex<BTreeMap<Height, Block>>>,
    state: Arc<Mutex<Option<ConsensusState>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn blocks(&self) -> Result<MutexGuard<'_, BTreeMap<Height, Block>>, StorageError> {
        self.blocks
            .lock()
            .map_err(|_| StorageError::Custom("block map lock poisoned".into()))
    }

    fn state(&self) -> Result<MutexGuard<'_, Option<ConsensusState>>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Custom("state lock poisoned".into()))
    }
}

impl Persistence for MemStorage {
    fn store(&self, block: &Block) -> Result<(), StorageError> {
        let mut blocks = self.blocks()?;
        let tip = blocks.keys().next_back().copied().unwrap_or(0);
        check_contiguous(tip, block)?;
        blocks.insert(block.height(), block.clone());
        Ok(())
    }

    fn read(&self, height: Height) -> Result<Option<Block>, StorageError> {
        Ok(self.blocks()?.get(&height).cloned())
    }

    fn latest_height(&self) -> Result<Height, StorageError> {
        Ok(self.blocks()?.keys().next_back().copied().unwrap_or(0))
    }

    fn lowest_height(&self) -> Result<Height, StorageError> {
        Ok(self.blocks()?.keys().next().copied().unwrap_or(0))
    }

    fn save_consensus_state(&self, state: &ConsensusState) -> Result<(), StorageError> {
        *self.state()? = Some(state.clone());
        Ok(())
    }

    fn get_consensus_state(&self) -> Result<Option<ConsensusState>, StorageError> {
        Ok(self.state()?.clone())
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.blocks()?.clear();
        *self.state()? = None;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Redb Storage
// -----------------------------------------------------------------------------
pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let p = path.as_ref();
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Custom(format!("Failed to create DB dir: {}", e)))?;
        }
        let db = Database::create(p)?;
        Self::create_tables(&db)?;
        Ok(Self { db })
    }

    fn create_tables(db: &Database) -> Result<(), StorageError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TABLE_BLOCKS)?;
            let _ = write_txn.open_table(TABLE_META)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl Persistence for RedbStorage {
    fn store(&self, block: &Block) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCKS)?;
            let tip = match table.last()? {
                Some((k, _)) => k.value(),
                None => 0,
            };
            check_contiguous(tip, block)?;
            let val = bincode::serialize(block)?;
            table.insert(block.height(), val)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn read(&self, height: Height) -> Result<Option<Block>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;
        if let Some(val) = table.get(height)? {
            let block = bincode::deserialize(&val.value())?;
            Ok(Some(block))
        } else {
            Ok(None)
        }
    }

    fn latest_height(&self) -> Result<Height, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;
        Ok(table.last()?.map(|(k, _)| k.value()).unwrap_or(0))
    }

    fn lowest_height(&self) -> Result<Height, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;
        Ok(table.first()?.map(|(k, _)| k.value()).unwrap_or(0))
    }

    fn save_consensus_state(&self, state: &ConsensusState) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_META)?;
            let val = bincode::serialize(state)?;
            table.insert(CONSENSUS_STATE_KEY, val)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_consensus_state(&self) -> Result<Option<ConsensusState>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_META)?;
        if let Some(val) = table.get(CONSENSUS_STATE_KEY)? {
            let state = bincode::deserialize(&val.value())?;
            Ok(Some(state))
        } else {
            Ok(None)
        }
    }

    fn reset(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(TABLE_BLOCKS)?;
        write_txn.delete_table(TABLE_META)?;
        {
            let _ = write_txn.open_table(TABLE_BLOCKS)?;
            let _ = write_txn.open_table(TABLE_META)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, Hash};

    fn block(height: Height) -> Block {
        Block::new(
            height,
            0,
            Hash([height as u8; 32]),
            Hash([height as u8 - 1; 32]),
            Address::default(),
            vec![],
        )
    }

    #[test]
    fn test_mem_storage_is_append_only() {
        let store = MemStorage::new();
        assert_eq!(store.latest_height().unwrap(), 0);
        assert!(store.latest_block().unwrap().is_none());

        store.store(&block(1)).unwrap();
        store.store(&block(2)).unwrap();
        assert!(matches!(
            store.store(&block(4)),
            Err(StorageError::NonContiguous { tip: 2, got: 4 })
        ));
        assert_eq!(store.lowest_height().unwrap(), 1);
        assert_eq!(store.latest_block().unwrap().unwrap().height(), 2);

        store.reset().unwrap();
        assert_eq!(store.latest_height().unwrap(), 0);
    }
}
