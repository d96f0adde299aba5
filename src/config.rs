//! Configuration and watchlist loading
//!
//! Watcher construction parameters with their defaults, and loading the
//! set of addresses to subscribe from a file.
//! Each line of a watchlist should contain one Ethereum address in hex format.

use crate::hex::{is_address, normalize_address};
use crate::rpc::DEFAULT_RPC_TIMEOUT;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(2);

/// Watcher construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// JSON-RPC endpoint URL
    pub rpc_endpoint: String,
    /// Delay between the end of one poll tick and the start of the next
    pub poll_interval: Duration,
    /// Transactions resolved concurrently per batch
    pub batch_size: usize,
    /// Delay between successive batch launches
    pub batch_delay: Duration,
    /// Per-request timeout for the HTTP RPC client
    pub rpc_timeout: Duration,
}

impl WatcherConfig {
    pub fn new(rpc_endpoint: impl Into<String>) -> Self {
        Self {
            rpc_endpoint: rpc_endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Replace unset (zero) values with their defaults.
    ///
    /// A zero batch delay is kept: it turns the rate limiter off.
    pub fn normalized(mut self) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.rpc_timeout.is_zero() {
            self.rpc_timeout = DEFAULT_RPC_TIMEOUT;
        }
        self
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Load a watchlist from a file.
///
/// Each line should contain one `0x`-prefixed address. Empty lines and lines
/// starting with '#' are ignored. Addresses are returned normalized, in file
/// order, without duplicates.
///
/// # Example file format:
/// ```text
/// 0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb
/// 0xdAC17F958D2ee523a2206206994597C13D831ec7
/// # This is a comment
/// ```
pub fn load_watchlist(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read watchlist file: {:?}", path))?;

    let mut addresses: Vec<String> = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if !is_address(line) {
            anyhow::bail!("Invalid address on line {}: {}", line_num + 1, line);
        }

        let addr = normalize_address(line);
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    if addresses.is_empty() {
        anyhow::bail!("Watchlist is empty (no valid addresses found)");
    }

    Ok(addresses)
}
