//! Error types for the watcher and its cache.

use std::num::ParseIntError;
use thiserror::Error;

/// Errors produced by the codec, the cache and the watcher.
///
/// `NotFound` variants carry the missing key so callers can match on them
/// structurally (e.g. "not fetched yet" vs. any other failure).
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid string format, expected '0x' prefix: {0:?}")]
    BadFormat(String),

    #[error("could not parse hex value {value:?}: {source}")]
    InvalidHex {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("block {0} not found")]
    BlockNotFound(String),

    #[error("transaction {0} not found")]
    TxNotFound(String),

    #[error("address {0} not subscribed")]
    AddressNotFound(String),

    #[error("{op} failed: {source}")]
    Rpc {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cache consistency violated: {0}")]
    Consistency(String),

    #[error("resolution task failed: {0}")]
    Task(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl WatchError {
    /// Wrap an upstream RPC error with the name of the failing method.
    pub fn rpc(op: &'static str, err: anyhow::Error) -> Self {
        Self::Rpc {
            op,
            source: err.into(),
        }
    }

    /// Returns `true` for the "key absent" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlockNotFound(_) | Self::TxNotFound(_) | Self::AddressNotFound(_)
        )
    }
}

pub type Result<T, E = WatchError> = std::result::Result<T, E>;
