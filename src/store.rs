// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Bounded in-memory transaction store with a live fan-out feed.
//!
//! Completed transactions land here in completion order. The store keeps a
//! fixed-capacity window (oldest evicted first) and pushes every append to
//! a broadcast channel; slow subscribers lag and lose messages rather than
//! backpressure the proxy.

use crate::transaction::Transaction;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;
const FEED_BUFFER: usize = 256;

/// Optional filters for `query`; all present fields must match.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Substring match on the origin host.
    pub host: Option<String>,
    /// Exact method, case-insensitive.
    pub method: Option<String>,
    /// Exact response status; transactions without a response never match.
    pub status: Option<u16>,
    /// Outcome kind string, e.g. "blocked" or "failed".
    pub outcome: Option<String>,
}

impl TransactionFilter {
    fn matches(&self, tx: &Transaction) -> bool {
        if let Some(host) = &self.host {
            if !tx.origin_host().contains(host.as_str()) {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if !tx.request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if tx.response.as_ref().map(|r| r.status) != Some(status) {
                return false;
            }
        }
        if let Some(outcome) = &self.outcome {
            if tx.outcome.kind() != outcome {
                return false;
            }
        }
        true
    }
}

pub struct TransactionStore {
    capacity: usize,
    entries: RwLock<VecDeque<Arc<Transaction>>>,
    feed: broadcast::Sender<Arc<Transaction>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_BUFFER);
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            feed,
        }
    }

    /// Append one completed transaction, evicting the oldest entry when at
    /// capacity, and publish it to the live feed.
    pub fn append(&self, tx: Transaction) -> Arc<Transaction> {
        let tx = Arc::new(tx);
        {
            let mut entries = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(tx.clone());
        }
        // No subscribers is fine; the send just drops the value.
        let _ = self.feed.send(tx.clone());
        tx
    }

    /// Subscribe to the live feed. Entries already in the store are not
    /// replayed; pair with `query` for history.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Transaction>> {
        self.feed.subscribe()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Transaction>> {
        self.read_entries().iter().find(|tx| tx.id == id).cloned()
    }

    /// Retained transactions matching the filter, oldest first.
    pub fn query(&self, filter: &TransactionFilter) -> Vec<Arc<Transaction>> {
        self.read_entries()
            .iter()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<Arc<Transaction>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_test_transaction, make_tx_for};
    use crate::transaction::Outcome;

    #[test]
    fn append_retains_in_completion_order() {
        let store = TransactionStore::new();
        let first = store.append(make_tx_for("GET", "http://a.test/1", "a.test:80"));
        let second = store.append(make_tx_for("GET", "http://a.test/2", "a.test:80"));

        let all = store.query(&TransactionFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let store = TransactionStore::with_capacity(2);
        let first = store.append(make_test_transaction());
        let second = store.append(make_test_transaction());
        let third = store.append(make_test_transaction());

        assert_eq!(store.len(), 2);
        assert!(store.get(first.id).is_none());
        assert!(store.get(second.id).is_some());
        assert!(store.get(third.id).is_some());
    }

    #[test]
    fn query_filters_compose() {
        let store = TransactionStore::new();
        store.append(make_tx_for("GET", "http://a.test/x", "a.test:80"));
        let mut blocked = make_tx_for("POST", "http://b.test/y", "b.test:443");
        blocked.outcome = Outcome::Blocked {
            rule: "deny".into(),
        };
        blocked.response = Some(crate::transaction::ResponseInfo::new(403));
        store.append(blocked);

        let by_host = store.query(&TransactionFilter {
            host: Some("b.test".into()),
            ..Default::default()
        });
        assert_eq!(by_host.len(), 1);

        let by_status = store.query(&TransactionFilter {
            status: Some(403),
            ..Default::default()
        });
        assert_eq!(by_status.len(), 1);

        let by_outcome = store.query(&TransactionFilter {
            method: Some("post".into()),
            outcome: Some("blocked".into()),
            ..Default::default()
        });
        assert_eq!(by_outcome.len(), 1);
        assert_eq!(by_outcome[0].origin, "b.test:443");
    }

    #[tokio::test]
    async fn feed_delivers_appends_to_subscribers() {
        let store = TransactionStore::new();
        let mut feed = store.subscribe();

        let appended = store.append(make_test_transaction());
        let received = feed.recv().await.expect("feed entry");
        assert_eq!(received.id, appended.id);
    }

    #[tokio::test]
    async fn late_subscribers_miss_history() {
        let store = TransactionStore::new();
        store.append(make_test_transaction());

        let mut feed = store.subscribe();
        let appended = store.append(make_test_transaction());
        let received = feed.recv().await.expect("feed entry");
        assert_eq!(received.id, appended.id);
        assert!(matches!(
            feed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
