//! In-memory block and transaction cache
//!
//! Shared store behind the watcher: fetched blocks, which of them have been
//! fully processed, fetched transactions and the subscribed address set.
//!
//! Strategy:
//! - Blocks and transactions are write-once: the first successful fetch wins
//!   and later inserts for the same key are silently ignored.
//! - Nothing is ever evicted. The cache lives as long as the process.
//! - One coarse lock guards everything. Callers never hold it across I/O.

use crate::error::{Result, WatchError};
use crate::types::{Block, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    blocks: HashMap<String, Block>,
    /// Invariant: every key here is also a key of `blocks`.
    processed: HashSet<String>,
    transactions: HashMap<String, Transaction>,
    subscriptions: Vec<String>,
}

/// Concurrency-safe cache for blocks, transactions and subscriptions.
#[derive(Default)]
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block under its number. No-op if the number is already present.
    pub fn add_block(&self, number: &str, block: Block) {
        self.inner
            .lock()
            .blocks
            .entry(number.to_string())
            .or_insert(block);
    }

    pub fn get_block(&self, number: &str) -> Result<Block> {
        self.inner
            .lock()
            .blocks
            .get(number)
            .cloned()
            .ok_or_else(|| WatchError::BlockNotFound(number.to_string()))
    }

    /// Mark a block as fully processed.
    ///
    /// Fails with [`WatchError::BlockNotFound`] if the block was never added.
    pub fn set_block_processed(&self, number: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.blocks.contains_key(number) {
            return Err(WatchError::BlockNotFound(number.to_string()));
        }
        inner.processed.insert(number.to_string());
        Ok(())
    }

    /// Whether a known block has been processed.
    pub fn get_block_processed(&self, number: &str) -> Result<bool> {
        let inner = self.inner.lock();
        if !inner.blocks.contains_key(number) {
            return Err(WatchError::BlockNotFound(number.to_string()));
        }
        Ok(inner.processed.contains(number))
    }

    /// Store a transaction keyed by its hash. No-op if already present.
    pub fn add_tx(&self, tx: Transaction) {
        self.inner
            .lock()
            .transactions
            .entry(tx.hash.clone())
            .or_insert(tx);
    }

    /// Look up a transaction.
    ///
    /// A miss is reported as [`WatchError::TxNotFound`] carrying the hash.
    pub fn get_tx(&self, hash: &str) -> Result<Transaction> {
        self.inner
            .lock()
            .transactions
            .get(hash)
            .cloned()
            .ok_or_else(|| WatchError::TxNotFound(hash.to_string()))
    }

    /// All cached transactions sent from or to `address`.
    ///
    /// Linear scan, meant for diagnostics rather than the polling path.
    pub fn tx_for_address(&self, address: &str) -> Vec<Transaction> {
        self.inner
            .lock()
            .transactions
            .values()
            .filter(|tx| tx.touches(address))
            .cloned()
            .collect()
    }

    /// Add an address to the subscription set. Idempotent.
    pub fn subscribe(&self, address: &str) {
        let mut inner = self.inner.lock();
        if !inner.subscriptions.iter().any(|a| a == address) {
            inner.subscriptions.push(address.to_string());
        }
    }

    pub fn unsubscribe(&self, address: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.subscriptions.iter().position(|a| a == address) {
            Some(idx) => {
                inner.subscriptions.remove(idx);
                Ok(())
            }
            None => Err(WatchError::AddressNotFound(address.to_string())),
        }
    }

    /// Subscribed addresses in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.clone()
    }

    /// Clear the cache (useful for testing).
    #[cfg(test)]
    pub(crate) fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }
}
