//! Pending transaction tracker
//!
//! Correlates submitted transactions with the consumer waiting for them.
//! A submission registers its hash and gets back a [`PendingTx`]; when the
//! hash shows up in a polled block the tracker resolves it with the receipt
//! and the block's logs for that transaction, then forgets it.
//!
//! Transactions that never appear in a polled block (dropped, reorganized
//! out) stay pending forever. Nothing times them out.

use crate::error::{SyncError, SyncResult};
use crate::logs::EventLogEntry;
use crate::types::{Receipt, TxHash};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Result delivered when a pending transaction is observed on chain.
#[derive(Debug, Clone)]
pub struct TxCompletion {
    pub receipt: Receipt,
    /// Events the transaction emitted, as tagged for the block it landed in
    pub logs: Vec<EventLogEntry>,
}

impl TxCompletion {
    /// Whether the transaction executed without reverting.
    pub fn succeeded(&self) -> bool {
        self.receipt.is_success()
    }
}

/// Completion handle for a submitted transaction.
#[derive(Debug)]
pub struct PendingTx {
    hash: TxHash,
    rx: oneshot::Receiver<TxCompletion>,
}

impl PendingTx {
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Wait until the transaction is seen in a polled block.
    ///
    /// Fails with [`SyncError::TransactionDropped`] if the registration was
    /// replaced or the engine shut down first.
    pub async fn wait(self) -> SyncResult<TxCompletion> {
        let hash = self.hash;
        self.rx
            .await
            .map_err(|_| SyncError::TransactionDropped(hash))
    }
}

/// Map from in-flight transaction hash to its waiting consumer.
///
/// At most one registration exists per hash. Registering a hash again
/// replaces the earlier registration, whose handle then reports
/// [`SyncError::TransactionDropped`].
#[derive(Debug, Default)]
pub struct PendingTxTracker {
    pending: HashMap<TxHash, oneshot::Sender<TxCompletion>>,
}

impl PendingTxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hash: TxHash) -> PendingTx {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(hash, tx).is_some() {
            debug!("TX {:?} re-registered, earlier waiter dropped", hash);
        }
        info!("TX {:?} pending...", hash);
        PendingTx { hash, rx }
    }

    pub fn is_pending(&self, hash: &TxHash) -> bool {
        self.pending.contains_key(hash)
    }

    /// Deliver the completion for `hash` and remove it.
    ///
    /// Returns `false` (and does nothing) if `hash` is not registered.
    pub fn resolve(&mut self, hash: TxHash, receipt: Receipt, logs: Vec<EventLogEntry>) -> bool {
        let Some(waiter) = self.pending.remove(&hash) else {
            return false;
        };
        let completion = TxCompletion { receipt, logs };
        if completion.succeeded() {
            info!("TX {:?} completed in block {}", hash, completion.receipt.block_number);
        } else {
            warn!("TX {:?} reverted in block {}", hash, completion.receipt.block_number);
        }
        if waiter.send(completion).is_err() {
            debug!("TX {:?} completed but nobody was waiting", hash);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{addr, tx_hash};

    fn receipt(hash: TxHash, block_number: u64) -> Receipt {
        Receipt {
            transaction_hash: hash,
            block_number,
            from: addr(0x11),
            status: Some(1),
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let mut tracker = PendingTxTracker::new();
        let hash = tx_hash(0xabc);
        let pending = tracker.register(hash);
        assert!(tracker.is_pending(&hash));

        assert!(tracker.resolve(hash, receipt(hash, 12), Vec::new()));
        assert!(!tracker.resolve(hash, receipt(hash, 13), Vec::new()));
        assert!(tracker.is_empty());

        let completion = pending.wait().await.unwrap();
        assert_eq!(completion.receipt.block_number, 12);
        assert!(completion.succeeded());
    }

    #[tokio::test]
    async fn test_reverted_transaction_still_completes() {
        let mut tracker = PendingTxTracker::new();
        let hash = tx_hash(0xdead);
        let pending = tracker.register(hash);

        let mut reverted = receipt(hash, 4);
        reverted.status = Some(0);
        assert!(tracker.resolve(hash, reverted, Vec::new()));

        let completion = pending.wait().await.unwrap();
        assert!(!completion.succeeded());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_resolve_unregistered_is_noop() {
        let mut tracker = PendingTxTracker::new();
        let _keep = tracker.register(tx_hash(1));
        assert!(!tracker.resolve(tx_hash(2), receipt(tx_hash(2), 1), Vec::new()));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_waiter() {
        let mut tracker = PendingTxTracker::new();
        let hash = tx_hash(7);
        let first = tracker.register(hash);
        let second = tracker.register(hash);
        assert_eq!(tracker.len(), 1);

        tracker.resolve(hash, receipt(hash, 3), Vec::new());
        assert!(matches!(first.wait().await, Err(SyncError::TransactionDropped(h)) if h == hash));
        assert!(second.wait().await.is_ok());
    }

    #[test]
    fn test_resolve_with_dropped_handle() {
        let mut tracker = PendingTxTracker::new();
        let hash = tx_hash(9);
        drop(tracker.register(hash));
        assert!(tracker.resolve(hash, receipt(hash, 1), Vec::new()));
    }
}
