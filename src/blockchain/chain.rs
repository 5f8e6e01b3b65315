use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::config::LedgerConfig;

use super::block::{Block, MiningAborted, MiningSignal};
use super::crypto::Address;
use super::storage::{LedgerStore, StorageError};
use super::transaction::{self, Transaction, TransactionError};

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StorageError),

    #[error("Mining aborted: {0}")]
    MiningAborted(#[from] MiningAborted),

    #[error("Chain tip moved from block {expected} to block {found} while mining")]
    TipChanged { expected: u64, found: u64 },

    /// The block is committed, but some of its transactions are still
    /// stored as unconfirmed
    #[error("Block {index} was committed but confirming its transactions failed: {source}")]
    ConfirmationFailed {
        index: u64,
        block: Box<Block>,
        #[source]
        source: StorageError,
    },
}

impl BlockchainError {
    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlockchainError::TipChanged { .. } | BlockchainError::MiningAborted(_)
        )
    }
}

/// First integrity violation found while walking the chain
#[derive(Debug, Error, PartialEq)]
pub enum ChainCorruption {
    #[error("Block {index} hash does not match its contents")]
    HashMismatch { index: u64 },

    #[error("Block {index} does not link to its predecessor")]
    BrokenLink { index: u64 },

    #[error("Block {index} contains invalid transaction {id}: {reason}")]
    InvalidTransaction {
        index: u64,
        id: String,
        reason: TransactionError,
    },
}

#[derive(Debug)]
struct LedgerState {
    /// Always holds at least the genesis block
    chain: Vec<Block>,

    /// Transactions waiting for the next block, in submission order
    pending_transactions: Vec<Transaction>,
}

impl LedgerState {
    fn tip(&self) -> &Block {
        &self.chain[self.chain.len() - 1]
    }
}

/// A candidate block cut from the pool, not yet committed
#[derive(Debug)]
struct MiningJob {
    block: Block,
    /// Number of pool entries the block consumes on commit
    snapshot_len: usize,
}

/// The ledger: chain of blocks plus the pending pool.
///
/// Cheap to clone; clones share the same state and store.
#[derive(Clone)]
pub struct Blockchain {
    state: Arc<RwLock<LedgerState>>,
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Blockchain")
            .field("length", &state.chain.len())
            .field("pending", &state.pending_transactions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Blockchain {
    /// Rebuilds the ledger from `store`, creating the genesis block if the
    /// store is empty.
    ///
    /// Stored blocks and transactions are trusted verbatim; use
    /// [`Blockchain::validate_chain`] to re-check them.
    pub fn open(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Result<Self, BlockchainError> {
        let mut chain = store.list_blocks()?;

        if chain.is_empty() {
            info!("No stored chain found, creating genesis block");
            let genesis = Block::genesis();
            store.append_block(&genesis)?;
            chain.push(genesis);
        } else {
            for (position, block) in chain.iter().enumerate() {
                if block.index != position as u64 {
                    return Err(StorageError::Corrupted(format!(
                        "expected block {} but found block {}",
                        position, block.index
                    ))
                    .into());
                }
            }
            info!("Loaded {} blocks from storage", chain.len());
        }

        let pending_transactions = store.list_unconfirmed_transactions()?;
        info!("Loaded {} pending transactions", pending_transactions.len());

        Ok(Blockchain {
            state: Arc::new(RwLock::new(LedgerState {
                chain,
                pending_transactions,
            })),
            store,
            config,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Validates and queues a transaction for the next block
    ///
    /// # Returns
    ///
    /// The id of the accepted transaction
    pub fn submit_transaction(&self, transaction: Transaction) -> Result<String, BlockchainError> {
        if let Err(err) = transaction
            .check_shape()
            .and_then(|_| transaction.verify())
        {
            warn!("Rejected transaction {}: {}", transaction.id, err);
            return Err(err.into());
        }

        let mut state = self.state.write();

        // Durable first: a transaction that cannot be recorded never enters the pool
        if let Err(err) = self.store.append_transaction(&transaction) {
            error!("Failed to persist transaction {}: {}", transaction.id, err);
            return Err(err.into());
        }

        let id = transaction.id.clone();
        state.pending_transactions.push(transaction);
        info!(
            "Accepted transaction {} ({} pending)",
            id,
            state.pending_transactions.len()
        );

        Ok(id)
    }

    /// Mines every pending transaction into a new block, rewarding
    /// `miner_address`
    pub fn mine_pending_transactions(&self, miner_address: &Address) -> Result<Block, BlockchainError> {
        let job = self.prepare_block(miner_address);
        let block = job.block.mine(self.config.difficulty);

        self.commit_block(MiningJob {
            block,
            snapshot_len: job.snapshot_len,
        })
    }

    /// Cancellable form of [`Blockchain::mine_pending_transactions`].
    ///
    /// The proof-of-work search runs without holding the ledger lock. If the
    /// tip moves in the meantime the block is discarded with
    /// [`BlockchainError::TipChanged`]. An aborted or rejected attempt leaves
    /// the chain, the pool and the store untouched.
    pub fn mine_pending_transactions_with(
        &self,
        miner_address: &Address,
        signal: &MiningSignal,
    ) -> Result<Block, BlockchainError> {
        let job = self.prepare_block(miner_address);
        debug!(
            "Mining block {} with {} transactions at difficulty {}",
            job.block.index,
            job.block.transactions.len(),
            self.config.difficulty
        );

        let block = match job.block.mine_with(self.config.difficulty, signal) {
            Ok(block) => block,
            Err(aborted) => {
                warn!("{}", aborted);
                return Err(aborted.into());
            }
        };

        self.commit_block(MiningJob {
            block,
            snapshot_len: job.snapshot_len,
        })
    }

    /// Snapshots the pool behind a fresh reward transaction
    fn prepare_block(&self, miner_address: &Address) -> MiningJob {
        let state = self.state.read();
        let tip = state.tip();

        let mut transactions = Vec::with_capacity(state.pending_transactions.len() + 1);
        transactions.push(Transaction::reward(
            miner_address.clone(),
            self.config.mining_reward,
        ));
        transactions.extend(state.pending_transactions.iter().cloned());

        MiningJob {
            block: Block::new(tip.index + 1, transactions, tip.hash.clone()),
            snapshot_len: state.pending_transactions.len(),
        }
    }

    fn commit_block(&self, job: MiningJob) -> Result<Block, BlockchainError> {
        let MiningJob {
            block,
            snapshot_len,
        } = job;

        let mut state = self.state.write();

        let tip = state.tip();
        if tip.hash != block.previous_hash {
            let err = BlockchainError::TipChanged {
                expected: block.index - 1,
                found: tip.index,
            };
            warn!("Discarding mined block {}: {}", block.index, err);
            return Err(err);
        }

        if let Err(err) = self.store.append_block(&block) {
            error!("Failed to persist block {}: {}", block.index, err);
            return Err(err.into());
        }

        state.chain.push(block.clone());
        // Only a commit shrinks the pool, and a commit moves the tip, so the
        // snapshot is still the pool's prefix here.
        state.pending_transactions.drain(..snapshot_len);

        // Try every id so one failure does not leave the rest unconfirmed
        let mut failure = None;
        for transaction in &block.transactions {
            if let Err(err) = self.store.mark_transaction_confirmed(&transaction.id) {
                error!(
                    "Failed to confirm transaction {} in block {}: {}",
                    transaction.id, block.index, err
                );
                failure.get_or_insert(err);
            }
        }

        info!(
            "Mined block {} ({}) with {} transactions",
            block.index,
            block.hash,
            block.transactions.len()
        );

        match failure {
            None => Ok(block),
            Some(source) => Err(BlockchainError::ConfirmationFailed {
                index: block.index,
                block: Box::new(block),
                source,
            }),
        }
    }

    /// Re-verifies every block after genesis, reporting the first violation
    pub fn validate_chain(&self) -> Result<(), ChainCorruption> {
        let state = self.state.read();
        validate_blocks(&state.chain)
    }

    pub fn is_chain_valid(&self) -> bool {
        self.validate_chain().is_ok()
    }

    /// Sum of credits minus debits for `address` across the whole chain
    pub fn get_balance(&self, address: &Address) -> f64 {
        let state = self.state.read();

        let balance = state
            .chain
            .iter()
            .flat_map(|block| block.transactions.iter())
            .fold(0.0, |mut balance, tx| {
                if tx.recipient == *address {
                    balance += tx.amount;
                }
                if tx.sender == *address {
                    balance -= tx.amount;
                }
                balance
            });

        transaction::normalize_amount(balance)
    }

    pub fn get_chain(&self) -> Vec<Block> {
        self.state.read().chain.clone()
    }

    pub fn get_last_block(&self) -> Block {
        self.state.read().tip().clone()
    }

    pub fn get_pending_transactions(&self) -> Vec<Transaction> {
        self.state.read().pending_transactions.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().chain.len()
    }
}

/// Re-verifies a chain snapshot taken with [`Blockchain::get_chain`]
pub fn validate_blocks(chain: &[Block]) -> Result<(), ChainCorruption> {
    for pair in chain.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);

        if current.hash != current.calculate_hash() {
            return Err(ChainCorruption::HashMismatch {
                index: current.index,
            });
        }

        if current.previous_hash != previous.hash {
            return Err(ChainCorruption::BrokenLink {
                index: current.index,
            });
        }

        for tx in current.transactions.iter().filter(|tx| !tx.is_reward()) {
            if let Err(reason) = tx.verify() {
                return Err(ChainCorruption::InvalidTransaction {
                    index: current.index,
                    id: tx.id.clone(),
                    reason,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::storage::{MemoryStore, SledStore};
    use crate::blockchain::Wallet;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            difficulty: 2,
            mining_reward: 50.0,
            mining_timeout_secs: 30,
        }
    }

    fn new_ledger() -> (Arc<MemoryStore>, Blockchain) {
        let store = Arc::new(MemoryStore::new());
        let blockchain = Blockchain::open(store.clone(), test_config()).unwrap();
        (store, blockchain)
    }

    fn transfer(from: &Wallet, to: &Address, amount: f64) -> Transaction {
        let mut transaction = Transaction::new(from.address().clone(), to.clone(), amount);
        transaction.sign(from);
        transaction
    }

    /// Memory store whose writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_blocks: AtomicBool,
        fail_transactions: AtomicBool,
        fail_confirmations: AtomicBool,
    }

    impl LedgerStore for FlakyStore {
        fn append_block(&self, block: &Block) -> Result<(), StorageError> {
            if self.fail_blocks.load(Ordering::SeqCst) {
                return Err(StorageError::DatabaseError(sled::Error::Unsupported("disk full".to_string())));
            }
            self.inner.append_block(block)
        }

        fn list_blocks(&self) -> Result<Vec<Block>, StorageError> {
            self.inner.list_blocks()
        }

        fn append_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
            if self.fail_transactions.load(Ordering::SeqCst) {
                return Err(StorageError::DatabaseError(sled::Error::Unsupported("disk full".to_string())));
            }
            self.inner.append_transaction(transaction)
        }

        fn mark_transaction_confirmed(&self, id: &str) -> Result<(), StorageError> {
            if self.fail_confirmations.load(Ordering::SeqCst) {
                return Err(StorageError::DatabaseError(sled::Error::Unsupported("disk full".to_string())));
            }
            self.inner.mark_transaction_confirmed(id)
        }

        fn list_unconfirmed_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
            self.inner.list_unconfirmed_transactions()
        }
    }

    #[test]
    fn test_new_blockchain() {
        let (store, blockchain) = new_ledger();
        let chain = blockchain.get_chain();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 0);
        assert_eq!(chain[0].previous_hash, "0");
        assert!(chain[0].transactions.is_empty());
        assert_eq!(store.list_blocks().unwrap(), chain);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_transfer_scenario() {
        let (store, blockchain) = new_ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();

        let transaction = transfer(&alice, bob.address(), 10.0);
        let id = blockchain.submit_transaction(transaction).unwrap();
        assert_eq!(blockchain.get_pending_transactions().len(), 1);
        assert_eq!(store.list_unconfirmed_transactions().unwrap().len(), 1);

        let block = blockchain.mine_pending_transactions(carol.address()).unwrap();

        assert_eq!(blockchain.len(), 2);
        assert_eq!(block.index, 1);
        assert!(block.hash.starts_with("00"));
        assert_eq!(block.previous_hash, blockchain.get_chain()[0].hash);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1].id, id);

        assert_eq!(blockchain.get_balance(bob.address()), 10.0);
        assert_eq!(blockchain.get_balance(alice.address()), -10.0);
        assert_eq!(blockchain.get_balance(carol.address()), 50.0);
        assert_eq!(blockchain.get_balance(&Address("nobody".to_string())), 0.0);

        assert!(blockchain.get_pending_transactions().is_empty());
        assert!(store.list_unconfirmed_transactions().unwrap().is_empty());
        assert_eq!(store.list_blocks().unwrap().len(), 2);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_reject_foreign_signature() {
        let (store, blockchain) = new_ledger();
        let alice = Wallet::new();
        let mallory = Wallet::new();

        let mut transaction = Transaction::new(alice.address().clone(), mallory.address().clone(), 5.0);
        transaction.sign(&mallory);

        let result = blockchain.submit_transaction(transaction);
        assert!(matches!(
            result,
            Err(BlockchainError::InvalidTransaction(TransactionError::InvalidSignature))
        ));
        assert!(blockchain.get_pending_transactions().is_empty());
        assert!(store.list_unconfirmed_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_reject_unsigned_and_negative() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();

        let unsigned = Transaction::new(alice.address().clone(), "bob".into(), 1.0);
        assert!(matches!(
            blockchain.submit_transaction(unsigned),
            Err(BlockchainError::InvalidTransaction(TransactionError::NotSigned))
        ));

        let negative = transfer(&alice, &"bob".into(), -3.0);
        assert!(matches!(
            blockchain.submit_transaction(negative),
            Err(BlockchainError::InvalidTransaction(TransactionError::InvalidAmount(_)))
        ));

        assert!(blockchain.get_pending_transactions().is_empty());
    }

    #[test]
    fn test_system_sender_is_accepted_unsigned() {
        let (store, blockchain) = new_ledger();
        let bob = Address("bob".to_string());

        let grant = Transaction::new(Address::system(), bob.clone(), 5.0);
        assert!(grant.is_valid());
        let id = blockchain.submit_transaction(grant).unwrap();

        assert_eq!(blockchain.get_pending_transactions()[0].id, id);
        assert_eq!(store.list_unconfirmed_transactions().unwrap().len(), 1);

        blockchain.mine_pending_transactions(&"miner".into()).unwrap();
        assert_eq!(blockchain.get_balance(&bob), 5.0);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_mine_empty_pool() {
        let (_, blockchain) = new_ledger();
        let miner = Address("miner".to_string());

        let block = blockchain.mine_pending_transactions(&miner).unwrap();

        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].sender.is_system());
        assert_eq!(block.transactions[0].amount, 50.0);
        assert_eq!(blockchain.get_balance(&miner), 50.0);

        blockchain.mine_pending_transactions(&miner).unwrap();
        assert_eq!(blockchain.get_balance(&miner), 100.0);
        assert_eq!(blockchain.len(), 3);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_duplicate_submissions_are_both_mined() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();
        let bob = Address("bob".to_string());

        let transaction = transfer(&alice, &bob, 2.5);
        blockchain.submit_transaction(transaction.clone()).unwrap();
        blockchain.submit_transaction(transaction).unwrap();

        let block = blockchain.mine_pending_transactions(&"miner".into()).unwrap();
        assert_eq!(block.transactions.len(), 3);
        assert_eq!(blockchain.get_balance(&bob), 5.0);
    }

    #[test]
    fn test_chain_validation_detects_tampering() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();
        let bob = Address("bob".to_string());

        blockchain.submit_transaction(transfer(&alice, &bob, 10.0)).unwrap();
        blockchain.mine_pending_transactions(&"miner".into()).unwrap();
        blockchain.mine_pending_transactions(&"miner".into()).unwrap();

        assert!(blockchain.is_chain_valid());
        // Repeated checks agree and change nothing
        assert!(blockchain.is_chain_valid());
        let snapshot = blockchain.get_chain();

        let tamper = |mutate: fn(&mut Vec<Block>)| {
            let mut chain = snapshot.clone();
            mutate(&mut chain);
            validate_blocks(&chain)
        };

        assert_eq!(
            tamper(|chain| chain[1].transactions[1].amount = 1000.0),
            Err(ChainCorruption::HashMismatch { index: 1 })
        );
        assert_eq!(
            tamper(|chain| chain[2].previous_hash = "f".repeat(64)),
            Err(ChainCorruption::HashMismatch { index: 2 })
        );
        assert_eq!(
            tamper(|chain| chain[1].hash = "0".repeat(64)),
            Err(ChainCorruption::HashMismatch { index: 1 })
        );
        assert_eq!(
            tamper(|chain| {
                chain[2].previous_hash = "f".repeat(64);
                chain[2].hash = chain[2].calculate_hash();
            }),
            Err(ChainCorruption::BrokenLink { index: 2 })
        );

        // Re-sealing a block around a forged transfer still fails on the transfer
        let result = tamper(|chain| {
            chain[1].transactions[1].amount = 1000.0;
            chain[1].hash = chain[1].calculate_hash();
            chain.truncate(2);
        });
        assert!(matches!(
            result,
            Err(ChainCorruption::InvalidTransaction { index: 1, .. })
        ));

        // Mutating the live ledger is caught too
        blockchain.state.write().chain[1].transactions[1].amount = 1.0;
        assert!(!blockchain.is_chain_valid());
        assert_eq!(
            blockchain.validate_chain(),
            Err(ChainCorruption::HashMismatch { index: 1 })
        );
        assert_eq!(blockchain.len(), snapshot.len());
    }

    #[test]
    fn test_persistence_failure_on_submit() {
        let store = Arc::new(FlakyStore::default());
        let blockchain = Blockchain::open(store.clone(), test_config()).unwrap();
        let alice = Wallet::new();

        store.fail_transactions.store(true, Ordering::SeqCst);
        let result = blockchain.submit_transaction(transfer(&alice, &"bob".into(), 1.0));

        assert!(matches!(result, Err(BlockchainError::Persistence(_))));
        assert!(blockchain.get_pending_transactions().is_empty());
    }

    #[test]
    fn test_persistence_failure_on_mine() {
        let store = Arc::new(FlakyStore::default());
        let blockchain = Blockchain::open(store.clone(), test_config()).unwrap();
        let alice = Wallet::new();
        blockchain
            .submit_transaction(transfer(&alice, &"bob".into(), 1.0))
            .unwrap();

        store.fail_blocks.store(true, Ordering::SeqCst);
        let result = blockchain.mine_pending_transactions(&"miner".into());

        assert!(matches!(result, Err(BlockchainError::Persistence(_))));
        assert_eq!(blockchain.len(), 1);
        assert_eq!(blockchain.get_pending_transactions().len(), 1);
        assert_eq!(store.list_unconfirmed_transactions().unwrap().len(), 1);

        store.fail_blocks.store(false, Ordering::SeqCst);
        let block = blockchain.mine_pending_transactions(&"miner".into()).unwrap();
        assert_eq!(block.index, 1);
        assert!(blockchain.get_pending_transactions().is_empty());
    }

    #[test]
    fn test_confirmation_failure_is_reported() {
        let store = Arc::new(FlakyStore::default());
        let blockchain = Blockchain::open(store.clone(), test_config()).unwrap();
        let alice = Wallet::new();
        let transaction = transfer(&alice, &"bob".into(), 1.0);
        blockchain.submit_transaction(transaction.clone()).unwrap();

        store.fail_confirmations.store(true, Ordering::SeqCst);
        let err = blockchain
            .mine_pending_transactions(&"miner".into())
            .unwrap_err();

        let committed = match &err {
            BlockchainError::ConfirmationFailed { index, block, .. } => {
                assert_eq!(*index, 1);
                block.as_ref().clone()
            }
            other => panic!("unexpected error: {}", other),
        };
        assert!(!err.is_retryable());

        // The block itself is committed in memory and in storage
        assert_eq!(blockchain.get_last_block(), committed);
        assert_eq!(store.list_blocks().unwrap().len(), 2);
        assert!(blockchain.get_pending_transactions().is_empty());
        assert_eq!(
            store.list_unconfirmed_transactions().unwrap(),
            vec![transaction.clone()]
        );

        // Rehydrate loads every unconfirmed row
        store.fail_confirmations.store(false, Ordering::SeqCst);
        let reopened = Blockchain::open(store.clone(), test_config()).unwrap();
        assert_eq!(reopened.get_pending_transactions(), vec![transaction]);
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_resubmitted_transaction_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let blockchain = Blockchain::open(store.clone(), test_config()).unwrap();
        let alice = Wallet::new();
        let transaction = transfer(&alice, &"bob".into(), 1.0);

        blockchain.submit_transaction(transaction.clone()).unwrap();
        blockchain.mine_pending_transactions(&"miner".into()).unwrap();
        blockchain.submit_transaction(transaction.clone()).unwrap();

        assert_eq!(blockchain.get_pending_transactions(), vec![transaction.clone()]);
        assert_eq!(
            store.list_unconfirmed_transactions().unwrap(),
            vec![transaction.clone()]
        );

        let reopened = Blockchain::open(store, test_config()).unwrap();
        assert_eq!(reopened.get_pending_transactions(), vec![transaction]);
        assert_eq!(reopened.get_chain(), blockchain.get_chain());
    }

    #[test]
    fn test_snapshot_validation_ignores_later_changes() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();
        blockchain
            .submit_transaction(transfer(&alice, &"bob".into(), 1.0))
            .unwrap();
        blockchain.mine_pending_transactions(&"miner".into()).unwrap();

        let snapshot = blockchain.get_chain();
        blockchain.mine_pending_transactions(&"miner".into()).unwrap();
        blockchain.state.write().chain[1].transactions[1].amount = 9.0;

        assert!(!blockchain.is_chain_valid());
        assert_eq!(validate_blocks(&snapshot), Ok(()));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_aborted_mining_changes_nothing() {
        let (store, blockchain) = new_ledger();
        let alice = Wallet::new();
        blockchain
            .submit_transaction(transfer(&alice, &"bob".into(), 1.0))
            .unwrap();

        let signal = MiningSignal::new();
        signal.cancel();
        let result = blockchain.mine_pending_transactions_with(&"miner".into(), &signal);

        assert!(matches!(result, Err(BlockchainError::MiningAborted(_))));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(blockchain.len(), 1);
        assert_eq!(blockchain.get_pending_transactions().len(), 1);
        assert_eq!(store.list_blocks().unwrap().len(), 1);
        assert_eq!(store.list_unconfirmed_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_stale_block_is_rejected() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();
        blockchain
            .submit_transaction(transfer(&alice, &"bob".into(), 1.0))
            .unwrap();

        let first = blockchain.prepare_block(&"first".into());
        let second = blockchain.prepare_block(&"second".into());

        let mined = first.block.mine(1);
        blockchain
            .commit_block(MiningJob {
                block: mined,
                snapshot_len: first.snapshot_len,
            })
            .unwrap();

        let stale = second.block.mine(1);
        let result = blockchain.commit_block(MiningJob {
            block: stale,
            snapshot_len: second.snapshot_len,
        });

        assert!(matches!(
            result,
            Err(BlockchainError::TipChanged {
                expected: 0,
                found: 1
            })
        ));
        assert_eq!(blockchain.len(), 2);
        assert_eq!(blockchain.get_balance(&"first".into()), 50.0);
        assert_eq!(blockchain.get_balance(&"second".into()), 0.0);
    }

    #[test]
    fn test_submissions_during_mining_stay_pending() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();
        blockchain
            .submit_transaction(transfer(&alice, &"bob".into(), 1.0))
            .unwrap();

        let job = blockchain.prepare_block(&"miner".into());
        let late = transfer(&alice, &"carol".into(), 2.0);
        blockchain.submit_transaction(late.clone()).unwrap();

        let block = blockchain
            .commit_block(MiningJob {
                block: job.block.mine(1),
                snapshot_len: job.snapshot_len,
            })
            .unwrap();

        assert_eq!(block.transactions.len(), 2);
        assert_eq!(blockchain.get_pending_transactions(), vec![late]);
    }

    #[test]
    fn test_concurrent_submit_and_mine() {
        let (_, blockchain) = new_ledger();
        let alice = Wallet::new();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let blockchain = blockchain.clone();
                let alice = alice.clone();
                thread::spawn(move || {
                    let recipient = Address(format!("recipient-{}", i));
                    blockchain
                        .submit_transaction(transfer(&alice, &recipient, 1.0))
                        .unwrap();
                    blockchain.mine_pending_transactions(&"miner".into())
                })
            })
            .collect();

        let mut mined = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => mined += 1,
                Err(err) => assert!(err.is_retryable()),
            }
        }

        let chain = blockchain.get_chain();
        assert_eq!(chain.len(), mined + 1);
        let included: usize = chain
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| !tx.is_reward())
            .count();
        assert_eq!(included + blockchain.get_pending_transactions().len(), 4);
        assert_eq!(blockchain.get_balance(alice.address()), -(included as f64));
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_rehydrate_from_sled() {
        let dir = tempfile::TempDir::new().unwrap();
        let alice = Wallet::new();
        let bob = Address("bob".to_string());

        let (chain, pending) = {
            let store = Arc::new(SledStore::open(dir.path()).unwrap());
            let blockchain = Blockchain::open(store, test_config()).unwrap();
            blockchain.submit_transaction(transfer(&alice, &bob, 4.0)).unwrap();
            blockchain.mine_pending_transactions(&"miner".into()).unwrap();
            blockchain.submit_transaction(transfer(&alice, &bob, 6.0)).unwrap();
            (blockchain.get_chain(), blockchain.get_pending_transactions())
        };

        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let reloaded = Blockchain::open(store, test_config()).unwrap();

        assert_eq!(reloaded.get_chain(), chain);
        assert_eq!(reloaded.get_pending_transactions(), pending);
        assert!(reloaded.is_chain_valid());
        assert_eq!(reloaded.get_balance(&bob), 4.0);

        let block = reloaded.mine_pending_transactions(&"miner".into()).unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(reloaded.get_balance(&bob), 10.0);
        assert!(reloaded.is_chain_valid());
    }

    #[test]
    fn test_rehydrate_rejects_gaps() {
        let store = Arc::new(MemoryStore::new());
        let genesis = Block::genesis();
        store.append_block(&genesis).unwrap();
        store
            .append_block(&Block::new(2, Vec::new(), genesis.hash.clone()))
            .unwrap();

        let result = Blockchain::open(store, test_config());
        assert!(matches!(
            result,
            Err(BlockchainError::Persistence(StorageError::Corrupted(_)))
        ));
    }
}
