use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::crypto;
use super::transaction::{self, Transaction};

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Nonces tried between two checks of the mining signal
const SIGNAL_CHECK_INTERVAL: u64 = 1024;

/// Why a proof-of-work search stopped without a result
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MiningAborted {
    #[error("Mining cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error("Mining deadline exceeded after {attempts} attempts")]
    TimedOut { attempts: u64 },
}

/// Shared stop switch for an in-flight proof-of-work search.
///
/// Clones share the cancel flag, so a caller can keep one half and hand the
/// other to the miner.
#[derive(Debug, Clone, Default)]
pub struct MiningSignal {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl MiningSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        MiningSignal {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self, attempts: u64) -> Result<(), MiningAborted> {
        if self.is_cancelled() {
            return Err(MiningAborted::Cancelled { attempts });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MiningAborted::TimedOut { attempts });
            }
        }
        Ok(())
    }
}

/// Represents a block in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00.000Z")]
    pub timestamp: DateTime<Utc>,

    /// Transactions included in this block, reward first
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Proof of work counter
    pub nonce: u64,

    /// Hash of the current block
    pub hash: String,
}

impl Block {
    /// Creates a new unmined block with `nonce = 0`
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `transactions` - The transactions to include, in order
    /// * `previous_hash` - The hash of the previous block
    pub fn new(index: u64, transactions: Vec<Transaction>, previous_hash: String) -> Self {
        let mut block = Block {
            index,
            timestamp: transaction::now(),
            transactions,
            previous_hash,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn genesis() -> Self {
        Self::new(0, Vec::new(), GENESIS_PREVIOUS_HASH.to_string())
    }

    /// Rebuilds a block from persisted fields without recomputing anything
    pub fn restore(
        index: u64,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        previous_hash: String,
        nonce: u64,
        hash: String,
    ) -> Self {
        Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            nonce,
            hash,
        }
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 digest of `index ‖ timestamp ‖ transactions ‖ previous_hash ‖ nonce`
    pub fn calculate_hash(&self) -> String {
        let transactions = serde_json::Value::Array(
            self.transactions
                .iter()
                .map(Transaction::canonical_json)
                .collect(),
        );

        let preimage = format!(
            "{}{}{}{}{}",
            self.index,
            transaction::format_timestamp(&self.timestamp),
            transactions,
            self.previous_hash,
            self.nonce
        );

        crypto::digest(preimage.as_bytes())
    }

    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        self.hash.bytes().take_while(|b| *b == b'0').count() >= difficulty
    }

    /// Searches nonces until the hash has `difficulty` leading zero digits
    pub fn mine(mut self, difficulty: usize) -> Self {
        while !self.meets_difficulty(difficulty) {
            self.nonce += 1;
            self.hash = self.calculate_hash();
        }
        self
    }

    /// Like [`Block::mine`], but gives up once `signal` is cancelled or its
    /// deadline passes. An aborted block is consumed.
    pub fn mine_with(mut self, difficulty: usize, signal: &MiningSignal) -> Result<Self, MiningAborted> {
        let mut attempts: u64 = 0;
        signal.check(attempts)?;

        while !self.meets_difficulty(difficulty) {
            self.nonce += 1;
            self.hash = self.calculate_hash();
            attempts += 1;

            if attempts % SIGNAL_CHECK_INTERVAL == 0 {
                signal.check(attempts)?;
            }
        }

        Ok(self)
    }
}
