//! Notification delivery
//!
//! The watcher hands each subscriber's bucket of transactions to a
//! [`Notifier`] once per processed block. Delivery itself (websockets, push,
//! queues) lives behind this trait.

use crate::types::{Notification, Transaction};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sink for per-address block notifications.
///
/// Called once per subscriber per block, possibly with an empty list.
/// Implementations must return promptly.
pub trait Notifier: Send + Sync {
    fn notify(&self, address: &str, transactions: Vec<Transaction>);
}

/// Notifier that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, address: &str, transactions: Vec<Transaction>) {
        if transactions.is_empty() {
            debug!(address, "no activity in block");
            return;
        }
        for tx in &transactions {
            info!(
                address,
                hash = %tx.hash,
                from = %tx.from,
                to = tx.to.as_deref().unwrap_or("<create>"),
                "notification: got tx"
            );
        }
    }
}

/// Notifier that forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier together with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, address: &str, transactions: Vec<Transaction>) {
        let notification = Notification {
            address: address.to_string(),
            transactions,
        };
        if self.tx.send(notification).is_err() {
            warn!(address, "notification receiver dropped");
        }
    }
}
