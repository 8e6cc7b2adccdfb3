//! Last-seen ticket sets per leader account.
//!
//! Each account gets its own async mutex. Holding the guard for the whole diff
//! serializes heartbeats of one account while different accounts proceed in
//! parallel. A fresh slot is cold and must be seeded from the ledger before use.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Tickets seen in the previous heartbeat of one account.
#[derive(Debug, Default)]
pub struct LastSeen {
    tickets: Option<HashSet<i64>>,
}

impl LastSeen {
    /// True until the first seed or replace after a restart.
    pub fn is_cold(&self) -> bool {
        self.tickets.is_none()
    }

    pub fn seed(&mut self, tickets: impl IntoIterator<Item = i64>) {
        self.tickets = Some(tickets.into_iter().collect());
    }

    pub fn contains(&self, ticket: i64) -> bool {
        self.tickets.as_ref().is_some_and(|t| t.contains(&ticket))
    }

    pub fn tickets(&self) -> Vec<i64> {
        let mut tickets: Vec<i64> = self.tickets.iter().flatten().copied().collect();
        tickets.sort_unstable();
        tickets
    }

    pub fn replace(&mut self, tickets: HashSet<i64>) {
        self.tickets = Some(tickets);
    }

    pub fn len(&self) -> usize {
        self.tickets.as_ref().map_or(0, HashSet::len)
    }
}

/// Owner of every account's last-seen set.
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    accounts: DashMap<String, Arc<Mutex<LastSeen>>>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the account's slot exclusively until the guard is dropped.
    pub async fn lock(&self, account_id: &str) -> OwnedMutexGuard<LastSeen> {
        // Clone the Arc out so no map shard stays locked across the await
        let slot = self
            .accounts
            .entry(account_id.to_string())
            .or_default()
            .value()
            .clone();
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_slot_is_cold() {
        let tracker = SnapshotTracker::new();
        let mut seen = tracker.lock("L1").await;
        assert!(seen.is_cold());
        assert!(!seen.contains(100));

        seen.seed([100, 101]);
        assert!(!seen.is_cold());
        assert!(seen.contains(101));
        assert_eq!(seen.tickets(), vec![100, 101]);
    }

    #[tokio::test]
    async fn test_state_survives_between_locks() {
        let tracker = SnapshotTracker::new();
        {
            let mut seen = tracker.lock("L1").await;
            seen.replace(HashSet::from([5]));
        }
        let seen = tracker.lock("L1").await;
        assert!(seen.contains(5));
        assert_eq!(seen.len(), 1);
        drop(seen);

        assert!(tracker.lock("L2").await.is_cold());
    }

    #[tokio::test]
    async fn test_same_account_is_serialized() {
        let tracker = Arc::new(SnapshotTracker::new());
        let guard = tracker.lock("L1").await;

        let contender = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut seen = tracker.lock("L1").await;
                seen.seed([1]);
            })
        };

        // Other accounts are not blocked
        let other = tokio::time::timeout(Duration::from_millis(100), tracker.lock("L2")).await;
        assert!(other.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        assert!(guard.is_cold());

        drop(guard);
        contender.await.unwrap();
        assert!(tracker.lock("L1").await.contains(1));
    }
}
