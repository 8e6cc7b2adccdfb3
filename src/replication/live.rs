//! Best-effort in-memory view of each terminal's latest state.
//!
//! Serves status reads only. Nothing in the replication path consults it, so
//! losing it (restart) just means reads fall back to the durable store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::models::{ConnectionStatus, Heartbeat, TradingAccount};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    pub account_id: String,
    pub status: ConnectionStatus,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub open_positions: usize,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// False when rebuilt from the store rather than a live heartbeat
    pub from_cache: bool,
}

impl LiveState {
    /// Rebuild from the durable account row.
    pub fn from_account(account: &TradingAccount, open_positions: usize) -> Self {
        Self {
            account_id: account.id.clone(),
            status: account.status,
            balance: account.balance,
            equity: account.equity,
            margin: account.margin,
            open_positions,
            last_heartbeat_at: account.last_heartbeat_at,
            from_cache: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct LiveStateCache {
    states: DashMap<String, LiveState>,
}

impl LiveStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, account_id: &str, heartbeat: &Heartbeat, at: DateTime<Utc>) {
        self.states.insert(
            account_id.to_string(),
            LiveState {
                account_id: account_id.to_string(),
                status: ConnectionStatus::Online,
                balance: heartbeat.balance,
                equity: heartbeat.equity,
                margin: heartbeat.margin,
                open_positions: heartbeat.open_positions.len(),
                last_heartbeat_at: Some(at),
                from_cache: true,
            },
        );
    }

    pub fn get(&self, account_id: &str) -> Option<LiveState> {
        self.states.get(account_id).map(|s| s.value().clone())
    }

    pub fn mark_offline(&self, account_ids: &[String]) {
        for id in account_ids {
            if let Some(mut state) = self.states.get_mut(id) {
                state.status = ConnectionStatus::Offline;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_offline() {
        let cache = LiveStateCache::new();
        assert!(cache.get("F1").is_none());

        let heartbeat = Heartbeat {
            balance: 1_000.0,
            equity: 990.0,
            ..Default::default()
        };
        cache.record("F1", &heartbeat, Utc::now());

        let state = cache.get("F1").unwrap();
        assert_eq!(state.status, ConnectionStatus::Online);
        assert_eq!(state.equity, 990.0);
        assert!(state.from_cache);

        cache.mark_offline(&["F1".to_string(), "unknown".to_string()]);
        assert_eq!(cache.get("F1").unwrap().status, ConnectionStatus::Offline);
        assert_eq!(cache.len(), 1);
    }
}
