//! txwatch - Ethereum transaction notifier
//!
//! Polls a JSON-RPC node for new blocks and reports, once per block, the
//! transactions sent from or to each subscribed address.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use txwatch::cli::{self, Args};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    cli::run(args).await
}
