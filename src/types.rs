//! Ethereum JSON-RPC types
//!
//! Only the fields the watcher reads are typed. Everything else a node
//! returns for a transaction is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Block as returned by `eth_getBlockByNumber` with `full_tx = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block hash
    pub hash: String,

    /// Hashes of the transactions in the block, in block order
    #[serde(rename = "transactions", default)]
    pub transaction_hashes: Vec<String>,
}

/// Ethereum transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash
    pub hash: String,

    /// Sender address
    pub from: String,

    /// Recipient address (None for contract creation)
    #[serde(default)]
    pub to: Option<String>,

    /// Remaining RPC fields (value, gas, nonce, signature, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Transaction {
    /// Check whether `address` is the sender or the recipient, compared verbatim.
    pub fn touches(&self, address: &str) -> bool {
        self.from == address || self.to.as_deref() == Some(address)
    }
}

/// Per-address notification payload for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub address: String,
    #[serde(rename = "txs")]
    pub transactions: Vec<Transaction>,
}
