//! CLI implementation for txwatch
//!
//! Parses arguments, builds the watcher, subscribes the requested addresses
//! and runs the poll loop until Ctrl+C.

use crate::config::{load_watchlist, WatcherConfig};
use crate::hex::is_address;
use crate::notifier::LogNotifier;
use crate::watcher::Watcher;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Ethereum transaction notifier
#[derive(Parser, Debug)]
#[command(name = "txwatch")]
#[command(about = "Watch new blocks and report transactions touching subscribed addresses")]
pub struct Args {
    /// RPC endpoint URL (e.g., https://eth.llamarpc.com)
    #[arg(short, long, default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// Poll interval in seconds
    #[arg(short, long, default_value_t = 15)]
    pub interval: u64,

    /// Transactions fetched concurrently per batch
    #[arg(long, default_value_t = 25)]
    pub batch_size: usize,

    /// Delay between transaction batches in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub batch_delay_ms: u64,

    /// Per-request RPC timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub rpc_timeout: u64,

    /// Address to subscribe to (repeatable)
    #[arg(short, long = "address")]
    pub addresses: Vec<String>,

    /// Path to watchlist file (one address per line)
    #[arg(short, long)]
    pub watchlist: Option<PathBuf>,
}

impl Args {
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig::new(self.rpc_url.clone())
            .with_poll_interval(Duration::from_secs(self.interval))
            .with_batch_size(self.batch_size)
            .with_batch_delay(Duration::from_millis(self.batch_delay_ms))
            .with_rpc_timeout(Duration::from_secs(self.rpc_timeout))
    }

    /// Addresses from `--address` followed by those from `--watchlist`.
    pub fn subscriptions(&self) -> Result<Vec<String>> {
        let mut addresses = Vec::new();
        for addr in &self.addresses {
            if !is_address(addr) {
                anyhow::bail!("Invalid address: {}", addr);
            }
            addresses.push(addr.clone());
        }

        if let Some(path) = &self.watchlist {
            addresses.extend(load_watchlist(path).context("Failed to load watchlist")?);
        }

        if addresses.is_empty() {
            anyhow::bail!("No addresses to watch (use --address or --watchlist)");
        }
        Ok(addresses)
    }
}

/// Run the watcher until Ctrl+C.
pub async fn run(args: Args) -> Result<()> {
    let addresses = args.subscriptions()?;
    let config = args.watcher_config();

    let watcher = Watcher::new(config, Arc::new(LogNotifier))
        .context("Failed to initialize watcher")?;

    info!("Starting transaction watcher");
    info!("RPC URL: {}", watcher.config().rpc_endpoint);

    for addr in &addresses {
        watcher.subscribe(addr);
    }
    info!("Watching {} addresses", watcher.subscriptions().len());

    let ctx = CancellationToken::new();
    tokio::select! {
        _ = watcher.listen(ctx.clone()) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down gracefully...");
            watcher.close();
        }
    }

    info!("Watcher stopped");
    Ok(())
}
