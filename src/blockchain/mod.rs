// Blockchain module
//
// This module contains the ledger core:
// - Digest and signature helpers
// - Transaction structure
// - Block structure and proof of work
// - Ledger coordinator
// - Persistence port and its adapters

pub mod block;
pub mod chain;
pub mod crypto;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::{Block, MiningSignal};
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, DigitalSignature, Wallet};
pub use storage::{LedgerStore, MemoryStore, SledStore};
pub use transaction::Transaction;
