//! Single-node hash-chained ledger
//!
//! - [`blockchain`] - Transactions, blocks, proof of work, the ledger and its storage
//! - [`config`] - Node configuration
//! - [`api`] - HTTP transport over the ledger

pub mod api;
pub mod blockchain;
pub mod config;
