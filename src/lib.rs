//! txwatch - Ethereum transaction notifier
//!
//! This library watches an Ethereum-compatible chain for new blocks and
//! notifies subscribers, once per block, of the transactions touching their
//! addresses. Block and transaction data is pulled over JSON-RPC and kept in
//! an in-memory cache for the lifetime of the process.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod hex;
pub mod notifier;
pub mod rpc;
pub mod types;
pub mod watcher;

// Re-export the main types for convenience
pub use cache::Cache;
pub use config::WatcherConfig;
pub use error::WatchError;
pub use notifier::{ChannelNotifier, LogNotifier, Notifier};
pub use rpc::{HttpRpcClient, RpcClient};
pub use types::{Block, Notification, Transaction};
pub use watcher::Watcher;
