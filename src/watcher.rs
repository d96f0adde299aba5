//! Main watcher loop
//!
//! Polls the chain head, advances through blocks one at a time, resolves
//! each block's transactions into the cache and fans notifications out to
//! subscribed addresses.
//!
//! The watcher is in one of three derived states:
//! - uninitialized: no block processed yet (`current_block` empty)
//! - behind: `current_block != latest_block`
//! - synced: `current_block == latest_block`
//!
//! Each tick advances by at most one block. A block is only marked processed
//! once every one of its transactions is cached; a failed attempt leaves the
//! block pending and keeps whatever was resolved so the next tick does less.

use crate::cache::Cache;
use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::hex::{normalize_address, num_to_str, str_to_hex};
use crate::notifier::Notifier;
use crate::rpc::{HttpRpcClient, RpcClient};
use crate::types::{Block, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct WatcherState {
    /// Normalized, unique, in subscription order
    subscriptions: Vec<String>,
    /// Last fully processed block, empty before the first one
    current_block: String,
    /// Most recently observed chain head, empty before the first poll
    latest_block: String,
    cancel: Option<CancellationToken>,
}

/// Copy of the state a tick works from, taken without holding the lock.
struct Snapshot {
    subscriptions: Vec<String>,
    current_block: String,
    latest_block: String,
}

/// Block watcher that notifies subscribers of the transactions touching them.
pub struct Watcher {
    config: WatcherConfig,
    rpc: Arc<dyn RpcClient>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<Cache>,
    state: Mutex<WatcherState>,
    /// Serializes subscribe/unsubscribe so the watcher list and the cache
    /// set change together. Taken before, never while holding, `state`.
    subscription_changes: Mutex<()>,
}

impl Watcher {
    /// Create a watcher backed by an HTTP JSON-RPC client for `config.rpc_endpoint`.
    pub fn new(config: WatcherConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let config = config.normalized();
        let rpc = HttpRpcClient::new(config.rpc_endpoint.clone(), config.rpc_timeout)?;
        Ok(Self::with_client(config, Arc::new(rpc), notifier))
    }

    /// Create a watcher over any [`RpcClient`].
    pub fn with_client(
        config: WatcherConfig,
        rpc: Arc<dyn RpcClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_cache(config, rpc, notifier, Arc::new(Cache::new()))
    }

    /// Create a watcher over an existing cache, e.g. one also used for queries.
    pub fn with_cache(
        config: WatcherConfig,
        rpc: Arc<dyn RpcClient>,
        notifier: Arc<dyn Notifier>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            config: config.normalized(),
            rpc,
            notifier,
            cache,
            state: Mutex::new(WatcherState::default()),
            subscription_changes: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn current_block(&self) -> String {
        self.state.lock().current_block.clone()
    }

    pub fn latest_block(&self) -> String {
        self.state.lock().latest_block.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Register an address for notification. Idempotent on the normalized form.
    pub fn subscribe(&self, address: &str) {
        let address = normalize_address(address);
        let _changes = self.subscription_changes.lock();
        {
            let mut state = self.state.lock();
            if state.subscriptions.contains(&address) {
                debug!(%address, "already subscribed");
                return;
            }
            state.subscriptions.push(address.clone());
        }
        self.cache.subscribe(&address);
        info!(%address, "subscribed");
    }

    pub fn unsubscribe(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        let _changes = self.subscription_changes.lock();
        {
            let mut state = self.state.lock();
            let idx = state
                .subscriptions
                .iter()
                .position(|a| *a == address)
                .ok_or_else(|| WatchError::AddressNotFound(address.clone()))?;
            state.subscriptions.remove(idx);
        }
        self.cache.unsubscribe(&address)?;
        info!(%address, "unsubscribed");
        Ok(())
    }

    /// Stop a running [`listen`](Self::listen) loop.
    ///
    /// No-op if the loop is not running or was already closed. Work already
    /// in flight is not waited for.
    pub fn close(&self) {
        let token = self.state.lock().cancel.take();
        if let Some(token) = token {
            info!("closing watcher");
            token.cancel();
        }
    }

    /// Run the poll loop until `ctx` is cancelled or [`close`](Self::close) is called.
    ///
    /// The interval is a delay after each tick's work, so a slow tick pushes
    /// the next one back instead of piling up.
    pub async fn listen(&self, ctx: CancellationToken) {
        let token = ctx.child_token();
        self.state.lock().cancel = Some(token.clone());

        info!(
            "Starting watcher loop (poll interval {:?}, batch size {}, batch delay {:?})",
            self.config.poll_interval, self.config.batch_size, self.config.batch_delay
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            self.tick().await;
        }

        info!("Watcher loop stopped");
    }

    /// One poll iteration: observe the head, then advance by at most one block.
    ///
    /// Errors end the step early and are logged; they never escape.
    pub async fn tick(&self) {
        if let Err(err) = self.check_new_block().await {
            warn!(error = %err, "checking chain head failed, will retry next tick");
        }

        match self.process_next_block().await {
            Ok(Some(number)) => debug!(block = %number, "tick advanced"),
            Ok(None) => {}
            Err(err @ WatchError::Consistency(_)) => {
                error!(error = %err, "cache anomaly while processing block");
            }
            Err(err) => {
                warn!(error = %err, "block processing failed, block will be reprocessed");
            }
        }
    }

    /// Fetch the chain head and record it if it moved.
    pub async fn check_new_block(&self) -> Result<()> {
        let head = self
            .rpc
            .get_current_block_number()
            .await
            .map_err(|e| WatchError::rpc("eth_blockNumber", e))?;
        str_to_hex(&head)?;

        let mut state = self.state.lock();
        if state.latest_block == head {
            debug!("no new block, skipping");
            return Ok(());
        }

        info!(block = %head, "new block number");
        state.latest_block = head;
        Ok(())
    }

    /// Advance by at most one block.
    ///
    /// Returns the number of the block that was processed, or `None` when
    /// there was nothing to do.
    pub async fn process_next_block(&self) -> Result<Option<String>> {
        let Snapshot {
            subscriptions,
            mut current_block,
            latest_block,
        } = self.snapshot();

        if current_block == latest_block {
            debug!("no new block to process, skipping");
            return Ok(None);
        }

        // Start at the current head rather than at genesis.
        let offset = if current_block.is_empty() {
            current_block = latest_block.clone();
            0
        } else {
            1
        };

        let current_num = str_to_hex(&current_block)?;
        let next_block = match self.cache.get_block_processed(&current_block) {
            Ok(true) => {
                let next = current_num.checked_add(offset).ok_or_else(|| {
                    WatchError::Consistency(format!(
                        "block number overflow after {}",
                        current_block
                    ))
                })?;
                num_to_str(next)
            }
            // Unresolved by an earlier attempt: retry it.
            _ => current_block,
        };

        if str_to_hex(&next_block)? > str_to_hex(&latest_block)? {
            debug!(block = %next_block, head = %latest_block, "next block is past the observed head");
            return Ok(None);
        }

        info!(block = %next_block, "processing next block");

        let block = self.fetch_block_if_missing(&next_block).await?;
        info!(
            "Got block {} ({} transactions)",
            next_block,
            block.transaction_hashes.len()
        );

        self.resolve_transactions(&block.transaction_hashes).await?;

        if let Err(err) = self.cache.set_block_processed(&next_block) {
            return Err(WatchError::Consistency(format!(
                "could not mark block {} processed: {}",
                next_block, err
            )));
        }

        self.state.lock().current_block = next_block.clone();
        info!(block = %next_block, "processed block");

        self.spawn_notifications(next_block.clone(), subscriptions);

        Ok(Some(next_block))
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            subscriptions: state.subscriptions.clone(),
            current_block: state.current_block.clone(),
            latest_block: state.latest_block.clone(),
        }
    }

    async fn fetch_block_if_missing(&self, number: &str) -> Result<Block> {
        if let Ok(block) = self.cache.get_block(number) {
            debug!(block = %number, "block info already cached");
            return Ok(block);
        }

        let block = self
            .rpc
            .get_block_by_number(number)
            .await
            .map_err(|e| WatchError::rpc("eth_getBlockByNumber", e))?;
        self.cache.add_block(number, block);
        self.cache.get_block(number)
    }

    /// Resolve every hash into the cache, `batch_size` at a time with
    /// `batch_delay` between batch launches.
    ///
    /// All launched tasks run to completion; the first error seen is returned.
    async fn resolve_transactions(&self, hashes: &[String]) -> Result<()> {
        let mut tasks = JoinSet::new();

        for (i, batch) in hashes.chunks(self.config.batch_size).enumerate() {
            if i > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            debug!("Launching batch {} ({} transactions)", i, batch.len());
            for hash in batch {
                let rpc = Arc::clone(&self.rpc);
                let cache = Arc::clone(&self.cache);
                let hash = hash.clone();
                tasks.spawn(async move { fetch_tx_if_missing(rpc.as_ref(), &cache, &hash).await });
            }
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| WatchError::Task(e.to_string()))
                .and_then(|r| r);
            if let Err(err) = outcome {
                debug!(error = %err, "transaction resolution failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Dispatch notifications for a processed block without blocking the caller.
    fn spawn_notifications(&self, block_number: String, subscribers: Vec<String>) {
        let cache = Arc::clone(&self.cache);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            notify_for_block(&cache, &notifier, &block_number, subscribers);
        });
    }
}

/// Make sure a transaction is in the cache, fetching it if needed.
async fn fetch_tx_if_missing(rpc: &dyn RpcClient, cache: &Cache, hash: &str) -> Result<()> {
    match cache.get_tx(hash) {
        Ok(_) => {
            debug!(hash, "already have tx, skipping");
            return Ok(());
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err),
    }

    let tx = rpc
        .get_transaction_by_hash(hash)
        .await
        .map_err(|e| WatchError::rpc("eth_getTransactionByHash", e.context(format!("hash={}", hash))))?;
    cache.add_tx(tx);
    Ok(())
}

/// Bucket a block's transactions and notify every subscriber exactly once.
///
/// Subscribers with no activity still get an empty notification.
fn notify_for_block(
    cache: &Cache,
    notifier: &Arc<dyn Notifier>,
    block_number: &str,
    subscribers: Vec<String>,
) {
    let block = match cache.get_block(block_number) {
        Ok(block) => block,
        Err(err) => {
            error!(block = %block_number, error = %err, "cache.get_block failed");
            return;
        }
    };

    let mut transactions = Vec::with_capacity(block.transaction_hashes.len());
    for hash in &block.transaction_hashes {
        match cache.get_tx(hash) {
            Ok(tx) => transactions.push(tx),
            // Every hash was resolved before the block was marked processed.
            Err(err) => error!(hash = %hash, error = %err, "cache.get_tx failed"),
        }
    }

    let mut buckets = bucket_by_address(transactions);
    for address in subscribers {
        let bucket = buckets.remove(&address).unwrap_or_default();
        let notifier = Arc::clone(notifier);
        tokio::spawn(async move {
            notifier.notify(&address, bucket);
        });
    }
}

/// Group transactions under their normalized sender and recipient.
///
/// A self-transfer is listed once.
fn bucket_by_address(transactions: Vec<Transaction>) -> HashMap<String, Vec<Transaction>> {
    let mut buckets: HashMap<String, Vec<Transaction>> = HashMap::new();

    for tx in transactions {
        let from = normalize_address(&tx.from);
        let to = tx.to.as_deref().map(normalize_address);

        match to {
            Some(to) if to != from => {
                buckets.entry(to).or_default().push(tx.clone());
                buckets.entry(from).or_default().push(tx);
            }
            _ => buckets.entry(from).or_default().push(tx),
        }
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ChannelNotifier;
    use crate::types::Notification;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::UnboundedReceiver;

    const HEAD: &str = "0x154d535";

    #[derive(Default)]
    struct MockRpc {
        head: Mutex<String>,
        head_fails: AtomicBool,
        blocks: Mutex<HashMap<String, Block>>,
        txs: HashMap<String, Transaction>,
        failing: Mutex<HashSet<String>>,
        block_calls: AtomicUsize,
        tx_calls: AtomicUsize,
        /// Cache to wipe on every transaction fetch
        wipe_on_tx: Mutex<Option<Arc<Cache>>>,
    }

    impl MockRpc {
        fn new(head: &str) -> Self {
            Self {
                head: Mutex::new(head.to_string()),
                ..Self::default()
            }
        }

        fn with_block(self, number: &str, hashes: &[&str]) -> Self {
            self.blocks.lock().insert(
                number.to_string(),
                Block {
                    hash: format!("0xb{}", number.trim_start_matches("0x")),
                    transaction_hashes: hashes.iter().map(|h| h.to_string()).collect(),
                },
            );
            self
        }

        fn with_tx(mut self, hash: &str, from: &str, to: Option<&str>) -> Self {
            self.txs.insert(hash.to_string(), tx(hash, from, to));
            self
        }

        fn set_head(&self, head: &str) {
            *self.head.lock() = head.to_string();
        }
    }

    #[async_trait]
    impl RpcClient for MockRpc {
        async fn get_current_block_number(&self) -> anyhow::Result<String> {
            if self.head_fails.load(Ordering::SeqCst) {
                anyhow::bail!("mock head unavailable");
            }
            Ok(self.head.lock().clone())
        }

        async fn get_block_by_number(&self, number: &str) -> anyhow::Result<Block> {
            self.block_calls.fetch_add(1, Ordering::SeqCst);
            self.blocks
                .lock()
                .get(number)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("mock has no block {}", number))
        }

        async fn get_transaction_by_hash(&self, hash: &str) -> anyhow::Result<Transaction> {
            self.tx_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cache) = self.wipe_on_tx.lock().as_ref() {
                cache.clear();
            }
            if self.failing.lock().contains(hash) {
                anyhow::bail!("mock failure for {}", hash);
            }
            self.txs
                .get(hash)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("mock has no tx {}", hash))
        }
    }

    fn tx(hash: &str, from: &str, to: Option<&str>) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            from: from.to_string(),
            to: to.map(str::to_string),
            extra: Map::new(),
        }
    }

    fn test_config() -> WatcherConfig {
        WatcherConfig::new("mock")
            .with_poll_interval(Duration::from_millis(10))
            .with_batch_delay(Duration::ZERO)
    }

    fn watcher_with(
        mock: &Arc<MockRpc>,
        config: WatcherConfig,
    ) -> (Watcher, UnboundedReceiver<Notification>) {
        let (notifier, rx) = ChannelNotifier::new();
        let watcher = Watcher::with_client(config, mock.clone(), Arc::new(notifier));
        (watcher, rx)
    }

    async fn recv_notifications(
        rx: &mut UnboundedReceiver<Notification>,
        count: usize,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        for _ in 0..count {
            let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for notification")
                .expect("notification channel closed");
            out.push(n);
        }
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    #[tokio::test]
    async fn test_check_new_block_updates_latest() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());

        assert_eq!(watcher.latest_block(), "");
        watcher.check_new_block().await.unwrap();

        assert_eq!(watcher.latest_block(), HEAD);
        assert_eq!(watcher.current_block(), "");
    }

    #[tokio::test]
    async fn test_check_new_block_failure_keeps_state() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());
        watcher.check_new_block().await.unwrap();

        mock.set_head("0x154d536");
        mock.head_fails.store(true, Ordering::SeqCst);
        let err = watcher.check_new_block().await.unwrap_err();

        assert!(matches!(err, WatchError::Rpc { op: "eth_blockNumber", .. }));
        assert_eq!(watcher.latest_block(), HEAD);
    }

    #[tokio::test]
    async fn test_check_new_block_rejects_malformed_head() {
        let mock = Arc::new(MockRpc::new("154d535"));
        let (watcher, _rx) = watcher_with(&mock, test_config());

        let err = watcher.check_new_block().await.unwrap_err();
        assert!(matches!(err, WatchError::BadFormat(_)));
        assert_eq!(watcher.latest_block(), "");
    }

    #[tokio::test]
    async fn test_nothing_to_do_before_first_head() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());

        assert_eq!(watcher.process_next_block().await.unwrap(), None);
        assert_eq!(mock.block_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_processes_head_block_first() {
        let mock = Arc::new(
            MockRpc::new(HEAD)
                .with_block(HEAD, &["0xh1"])
                .with_tx("0xh1", "0xa", Some("0xc")),
        );
        let (watcher, _rx) = watcher_with(&mock, test_config());

        watcher.check_new_block().await.unwrap();
        let processed = watcher.process_next_block().await.unwrap();

        assert_eq!(processed.as_deref(), Some(HEAD));
        assert_eq!(watcher.current_block(), HEAD);
        assert!(watcher.cache().get_block_processed(HEAD).unwrap());
        assert!(watcher.cache().get_tx("0xh1").is_ok());

        // Synced now
        assert_eq!(watcher.process_next_block().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_tx_leaves_block_pending() {
        let mock = Arc::new(
            MockRpc::new(HEAD)
                .with_block(HEAD, &["0xh1", "0xh2"])
                .with_tx("0xh1", "0xa", Some("0xc"))
                .with_tx("0xh2", "0xb", None),
        );
        mock.failing.lock().insert("0xh2".to_string());
        let (watcher, _rx) = watcher_with(&mock, test_config());

        watcher.check_new_block().await.unwrap();
        let err = watcher.process_next_block().await.unwrap_err();

        assert!(matches!(err, WatchError::Rpc { op: "eth_getTransactionByHash", .. }));
        assert_eq!(watcher.current_block(), "");
        assert!(!watcher.cache().get_block_processed(HEAD).unwrap());
        assert!(watcher.cache().get_tx("0xh1").is_ok());
        assert!(matches!(
            watcher.cache().get_tx("0xh2"),
            Err(WatchError::TxNotFound(ref h)) if h == "0xh2"
        ));

        // Next attempt only fetches what is still missing
        mock.failing.lock().clear();
        let processed = watcher.process_next_block().await.unwrap();

        assert_eq!(processed.as_deref(), Some(HEAD));
        assert_eq!(watcher.current_block(), HEAD);
        assert_eq!(mock.tx_calls.load(Ordering::SeqCst), 3);
        assert_eq!(mock.block_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_advances_one_block_per_call() {
        let mock = Arc::new(
            MockRpc::new("0x10")
                .with_block("0x10", &[])
                .with_block("0x11", &[])
                .with_block("0x12", &[]),
        );
        let (watcher, _rx) = watcher_with(&mock, test_config());

        watcher.check_new_block().await.unwrap();
        assert_eq!(watcher.process_next_block().await.unwrap().as_deref(), Some("0x10"));

        mock.set_head("0x12");
        watcher.check_new_block().await.unwrap();
        assert_eq!(watcher.process_next_block().await.unwrap().as_deref(), Some("0x11"));
        assert_eq!(watcher.current_block(), "0x11");
        assert_eq!(watcher.process_next_block().await.unwrap().as_deref(), Some("0x12"));
        assert_eq!(watcher.process_next_block().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_does_not_run_past_observed_head() {
        let mock = Arc::new(MockRpc::new("0x10").with_block("0x10", &[]));
        let (watcher, _rx) = watcher_with(&mock, test_config());

        watcher.check_new_block().await.unwrap();
        watcher.process_next_block().await.unwrap();

        // A lagging node reports an older head
        mock.set_head("0xf");
        watcher.check_new_block().await.unwrap();
        assert_eq!(watcher.process_next_block().await.unwrap(), None);
        assert_eq!(watcher.current_block(), "0x10");
    }

    #[tokio::test]
    async fn test_notifies_every_subscriber_once() {
        let mock = Arc::new(
            MockRpc::new(HEAD)
                .with_block(HEAD, &["0xh1"])
                .with_tx("0xh1", "0x000a", Some("0x0c")),
        );
        let (watcher, mut rx) = watcher_with(&mock, test_config());
        watcher.subscribe("0xa");
        watcher.subscribe("0xb");
        watcher.subscribe("0x00c");

        watcher.check_new_block().await.unwrap();
        watcher.process_next_block().await.unwrap();

        let notifications = recv_notifications(&mut rx, 3).await;
        let addresses: Vec<_> = notifications.iter().map(|n| n.address.as_str()).collect();
        assert_eq!(addresses, vec!["0xa", "0xb", "0xc"]);
        assert_eq!(notifications[0].transactions.len(), 1);
        assert_eq!(notifications[0].transactions[0].hash, "0xh1");
        assert!(notifications[1].transactions.is_empty());
        assert_eq!(notifications[2].transactions.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batches_resolve_all_transactions() {
        let hashes = ["0x1", "0x2", "0x3", "0x4", "0x5"];
        let mut mock = MockRpc::new(HEAD).with_block(HEAD, &hashes);
        for h in hashes {
            mock = mock.with_tx(h, "0xa", Some("0xb"));
        }
        let mock = Arc::new(mock);
        let config = test_config()
            .with_batch_size(2)
            .with_batch_delay(Duration::from_millis(20));
        let (watcher, _rx) = watcher_with(&mock, config);

        watcher.check_new_block().await.unwrap();
        let started = Instant::now();
        watcher.process_next_block().await.unwrap();

        // Three batches, two delays between launches
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(mock.tx_calls.load(Ordering::SeqCst), 5);
        for h in hashes {
            assert!(watcher.cache().get_tx(h).is_ok());
        }
        assert_eq!(watcher.cache().tx_for_address("0xb").len(), 5);
    }

    #[test]
    fn test_bucket_by_address() {
        let buckets = bucket_by_address(vec![
            tx("0x1", "0x0a", Some("0xc")),
            tx("0x2", "0xa", Some("0x00a")),
            tx("0x3", "0xd", None),
        ]);

        let hashes = |addr: &str| -> Vec<String> {
            buckets[addr].iter().map(|t| t.hash.clone()).collect()
        };
        assert_eq!(hashes("0xa"), vec!["0x1", "0x2"]);
        assert_eq!(hashes("0xc"), vec!["0x1"]);
        assert_eq!(hashes("0xd"), vec!["0x3"]);
        assert_eq!(buckets.len(), 3);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());

        watcher.subscribe("0x0012");
        watcher.subscribe("0x12");
        watcher.subscribe("0x34");
        assert_eq!(watcher.subscriptions(), vec!["0x12", "0x34"]);
        assert_eq!(watcher.cache().subscriptions(), vec!["0x12", "0x34"]);

        watcher.unsubscribe("0x00012").unwrap();
        assert_eq!(watcher.subscriptions(), vec!["0x34"]);
        assert_eq!(watcher.cache().subscriptions(), vec!["0x34"]);
        assert!(matches!(
            watcher.unsubscribe("0x12"),
            Err(WatchError::AddressNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_without_listen_is_noop() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());
        watcher.close();
        watcher.close();
    }

    #[tokio::test]
    async fn test_listen_polls_until_closed() {
        let mock = Arc::new(MockRpc::new(HEAD).with_block(HEAD, &[]));
        let (watcher, _rx) = watcher_with(&mock, test_config());
        let watcher = Arc::new(watcher);

        let handle = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.listen(CancellationToken::new()).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.close();
        watcher.close();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listen did not stop")
            .unwrap();
        assert_eq!(watcher.latest_block(), HEAD);
        assert_eq!(watcher.current_block(), HEAD);
    }

    #[tokio::test]
    async fn test_listen_stops_on_parent_cancel() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());
        let watcher = Arc::new(watcher);
        let ctx = CancellationToken::new();

        let handle = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            let ctx = ctx.clone();
            async move { watcher.listen(ctx).await }
        });

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listen did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_block_number_overflow_is_reported() {
        let max = "0x7fffffffffffffff";
        let mock = Arc::new(MockRpc::new(max).with_block(max, &[]));
        let (watcher, _rx) = watcher_with(&mock, test_config());

        watcher.check_new_block().await.unwrap();
        assert_eq!(watcher.process_next_block().await.unwrap().as_deref(), Some(max));

        mock.set_head("0x1");
        watcher.check_new_block().await.unwrap();
        let err = watcher.process_next_block().await.unwrap_err();

        assert!(matches!(err, WatchError::Consistency(_)));
        assert_eq!(watcher.current_block(), max);

        // The tick boundary swallows it
        watcher.tick().await;
        assert_eq!(watcher.current_block(), max);
    }

    #[tokio::test]
    async fn test_block_missing_at_mark_time_is_consistency_error() {
        let cache = Arc::new(Cache::new());
        let mock = Arc::new(
            MockRpc::new(HEAD)
                .with_block(HEAD, &["0xh1"])
                .with_tx("0xh1", "0xa", Some("0xc")),
        );
        *mock.wipe_on_tx.lock() = Some(Arc::clone(&cache));
        let (notifier, _rx) = ChannelNotifier::new();
        let watcher = Watcher::with_cache(
            test_config(),
            mock.clone(),
            Arc::new(notifier),
            Arc::clone(&cache),
        );

        watcher.check_new_block().await.unwrap();
        let err = watcher.process_next_block().await.unwrap_err();

        assert!(matches!(err, WatchError::Consistency(_)));
        assert_eq!(watcher.current_block(), "");

        // Recovers once the cache behaves
        *mock.wipe_on_tx.lock() = None;
        assert_eq!(watcher.process_next_block().await.unwrap().as_deref(), Some(HEAD));
        assert!(cache.get_block_processed(HEAD).unwrap());
        assert_eq!(mock.block_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listen_keeps_polling_through_rpc_failures() {
        let mock = Arc::new(MockRpc::new(HEAD).with_block(HEAD, &[]));
        mock.head_fails.store(true, Ordering::SeqCst);
        let (watcher, _rx) = watcher_with(&mock, test_config());
        let watcher = Arc::new(watcher);

        let handle = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.listen(CancellationToken::new()).await }
        });

        // Several failing ticks
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!handle.is_finished());
        assert_eq!(watcher.latest_block(), "");

        mock.head_fails.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), async {
            while watcher.current_block() != HEAD {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watcher did not recover");

        watcher.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listen did not stop")
            .unwrap();
    }

    #[test]
    fn test_concurrent_subscription_changes_stay_in_sync() {
        let mock = Arc::new(MockRpc::new(HEAD));
        let (watcher, _rx) = watcher_with(&mock, test_config());
        let watcher = Arc::new(watcher);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let watcher = Arc::clone(&watcher);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        watcher.subscribe(&format!("0x{:x}", (i + t) % 7 + 1));
                        let _ = watcher.unsubscribe(&format!("0x{:x}", (i + t + 3) % 7 + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(watcher.subscriptions(), watcher.cache().subscriptions());
    }
}
