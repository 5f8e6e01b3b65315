use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;

use crate::config::StorageConfig;

use super::block::Block;
use super::crypto::{Address, DigitalSignature};
use super::transaction::{self, Transaction};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Block {0} is already stored")]
    BlockExists(u64),

    #[error("Corrupted store: {0}")]
    Corrupted(String),
}

/// Durable mirror of the ledger.
///
/// Blocks are insert-only. Transactions are recorded unconfirmed and later
/// flagged confirmed by id; confirming an unknown or already confirmed id is
/// a no-op.
pub trait LedgerStore: Send + Sync {
    fn append_block(&self, block: &Block) -> Result<(), StorageError>;

    /// All stored blocks, ascending by index
    fn list_blocks(&self) -> Result<Vec<Block>, StorageError>;

    fn append_transaction(&self, transaction: &Transaction) -> Result<(), StorageError>;

    fn mark_transaction_confirmed(&self, id: &str) -> Result<(), StorageError>;

    /// Unconfirmed transactions in the order they were appended
    fn list_unconfirmed_transactions(&self) -> Result<Vec<Transaction>, StorageError>;
}

/// Persisted shape of a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    pub signature: Option<String>,
    pub timestamp: String,
}

impl From<&Transaction> for TransactionRecord {
    fn from(transaction: &Transaction) -> Self {
        TransactionRecord {
            id: transaction.id.clone(),
            sender: transaction.sender.0.clone(),
            recipient: transaction.recipient.0.clone(),
            amount: transaction.amount,
            signature: transaction.signature.as_ref().map(|s| s.0.clone()),
            timestamp: transaction::format_timestamp(&transaction.timestamp),
        }
    }
}

impl TransactionRecord {
    pub fn into_transaction(self) -> Result<Transaction, StorageError> {
        let timestamp = parse_timestamp(&self.timestamp)?;

        Ok(Transaction::restore(
            self.id,
            Address(self.sender),
            Address(self.recipient),
            self.amount,
            self.signature.map(DigitalSignature),
            timestamp,
        ))
    }
}

/// Persisted shape of a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub index: u64,
    pub timestamp: String,
    pub transactions: Vec<TransactionRecord>,
    pub previous_hash: String,
    pub nonce: u64,
    pub hash: String,
}

impl From<&Block> for BlockRecord {
    fn from(block: &Block) -> Self {
        BlockRecord {
            index: block.index,
            timestamp: transaction::format_timestamp(&block.timestamp),
            transactions: block.transactions.iter().map(TransactionRecord::from).collect(),
            previous_hash: block.previous_hash.clone(),
            nonce: block.nonce,
            hash: block.hash.clone(),
        }
    }
}

impl BlockRecord {
    pub fn into_block(self) -> Result<Block, StorageError> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        let transactions = self
            .transactions
            .into_iter()
            .map(TransactionRecord::into_transaction)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Block::restore(
            self.index,
            timestamp,
            transactions,
            self.previous_hash,
            self.nonce,
            self.hash,
        ))
    }
}

/// A stored transaction row with its confirmation flag
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransactionRow {
    transaction: TransactionRecord,
    confirmed: bool,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::DeserializationError(format!("Bad timestamp {}: {}", value, e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

/// sled-backed ledger store
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian index
    blocks: Tree,

    /// Transaction rows keyed by big-endian sequence number
    transactions: Tree,

    /// `id ‖ sequence` -> ()
    tx_index: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("blocks", &self.blocks.len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

impl SledStore {
    /// Opens (or creates) a store
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let transactions = db.open_tree("transactions")?;
        let tx_index = db.open_tree("tx_index")?;

        Ok(Self {
            db,
            blocks,
            transactions,
            tx_index,
        })
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn index_key(id: &str, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(id.len() + 8);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

impl LedgerStore for SledStore {
    fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let key = block.index.to_be_bytes();
        let value = encode(&BlockRecord::from(block))?;

        self.blocks
            .compare_and_swap(key, None::<&[u8]>, Some(value))?
            .map_err(|_| StorageError::BlockExists(block.index))?;

        self.flush()?;
        debug!("Stored block {} ({})", block.index, block.hash);
        Ok(())
    }

    fn list_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        for entry in self.blocks.iter() {
            let (_, value) = entry?;
            let record: BlockRecord = decode(&value)?;
            blocks.push(record.into_block()?);
        }

        Ok(blocks)
    }

    fn append_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
        let sequence = self.db.generate_id()?;
        let row = TransactionRow {
            transaction: TransactionRecord::from(transaction),
            confirmed: false,
        };

        self.transactions.insert(sequence.to_be_bytes(), encode(&row)?)?;
        self.tx_index
            .insert(Self::index_key(&transaction.id, sequence), &[] as &[u8])?;

        self.flush()
    }

    fn mark_transaction_confirmed(&self, id: &str) -> Result<(), StorageError> {
        let mut changed = false;

        for entry in self.tx_index.scan_prefix(id.as_bytes()) {
            let (key, _) = entry?;
            // Another id may share this one as a prefix
            if key.len() != id.len() + 8 {
                continue;
            }
            let sequence = &key[id.len()..];

            let Some(value) = self.transactions.get(sequence)? else {
                continue;
            };
            let mut row: TransactionRow = decode(&value)?;
            if row.confirmed {
                continue;
            }
            row.confirmed = true;
            self.transactions.insert(sequence, encode(&row)?)?;
            changed = true;
        }

        if changed {
            self.flush()?;
        }
        Ok(())
    }

    fn list_unconfirmed_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        let mut pending = Vec::new();

        for entry in self.transactions.iter() {
            let (_, value) = entry?;
            let row: TransactionRow = decode(&value)?;
            if !row.confirmed {
                pending.push(row.transaction.into_transaction()?);
            }
        }

        Ok(pending)
    }
}

/// Opens the store described by `config`.
///
/// Memory is used only when asked for; a durable store that cannot be opened
/// is an error.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>, StorageError> {
    if config.in_memory {
        warn!("Using in-memory storage, nothing survives a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = SledStore::open(&config.path)?;
    info!("Opened ledger storage at {}", config.path);
    Ok(Arc::new(store))
}

/// Volatile store with the same semantics as [`SledStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<Vec<Block>>,
    transactions: Mutex<Vec<(Transaction, bool)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut blocks = self.blocks.lock();
        if blocks.iter().any(|stored| stored.index == block.index) {
            return Err(StorageError::BlockExists(block.index));
        }
        blocks.push(block.clone());
        Ok(())
    }

    fn list_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = self.blocks.lock().clone();
        blocks.sort_by_key(|block| block.index);
        Ok(blocks)
    }

    fn append_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
        self.transactions.lock().push((transaction.clone(), false));
        Ok(())
    }

    fn mark_transaction_confirmed(&self, id: &str) -> Result<(), StorageError> {
        for (transaction, confirmed) in self.transactions.lock().iter_mut() {
            if transaction.id == id {
                *confirmed = true;
            }
        }
        Ok(())
    }

    fn list_unconfirmed_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        Ok(self
            .transactions
            .lock()
            .iter()
            .filter(|(_, confirmed)| !confirmed)
            .map(|(transaction, _)| transaction.clone())
            .collect())
    }
}
