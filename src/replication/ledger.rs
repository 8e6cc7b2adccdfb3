//! Follower side of the position ledger.
//!
//! Follower snapshots are mirrored into the ledger without emitting signals.
//! Executed Open acks tag the follower ticket with the leader ticket it copies.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{Command, CommandStatus, CommandType, Position, PositionSide, SnapshotPosition};

use super::SnapshotTracker;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LedgerSync {
    pub inserted: usize,
    pub updated: usize,
    pub closed: usize,
    /// Per-ticket failures; the other tickets were still mirrored
    pub errors: Vec<String>,
}

impl LedgerSync {
    fn changed(&self) -> bool {
        self.inserted + self.updated + self.closed > 0
    }
}

pub struct PositionLedger {
    db: Database,
    tracker: Arc<SnapshotTracker>,
}

impl PositionLedger {
    pub fn new(db: Database, tracker: Arc<SnapshotTracker>) -> Self {
        Self { db, tracker }
    }

    /// Bring a follower's open ledger rows in line with its snapshot.
    ///
    /// Fails only when the open rows cannot be read. `unreadable` tickets are
    /// kept open as they are.
    pub async fn mirror_snapshot(
        &self,
        account_id: &str,
        snapshot: &[SnapshotPosition],
        unreadable: &[i64],
    ) -> Result<LedgerSync> {
        let mut seen = self.tracker.lock(account_id).await;
        let mut sync = LedgerSync::default();
        let now = Utc::now();

        let open: BTreeMap<i64, _> = self
            .db
            .get_open_positions(account_id)
            .await?
            .into_iter()
            .map(|p| (p.ticket, p))
            .collect();

        let mut present: HashSet<i64> = snapshot.iter().map(|p| p.ticket).filter(|&t| t > 0).collect();
        present.extend(unreadable.iter().copied().filter(|&t| t > 0));

        for item in snapshot {
            if let Err(e) = item.validate() {
                sync.errors.push(e.to_string());
                continue;
            }
            if let Err(e) = self.mirror_item(account_id, open.get(&item.ticket), item, now, &mut sync).await {
                warn!(account = %account_id, ticket = item.ticket, error = %e, "Follower ticket not mirrored");
                sync.errors.push(format!("ticket {}: {e:#}", item.ticket));
            }
        }

        for ticket in open.keys().filter(|t| !present.contains(t)) {
            match self.db.close_position(account_id, *ticket, now).await {
                Ok(Some(_)) => sync.closed += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(account = %account_id, ticket, error = %e, "Follower close not mirrored");
                    sync.errors.push(format!("close {ticket}: {e:#}"));
                }
            }
        }

        seen.replace(present);

        if sync.changed() {
            debug!(
                account = %account_id,
                inserted = sync.inserted,
                updated = sync.updated,
                closed = sync.closed,
                "Follower ledger mirrored"
            );
        }
        Ok(sync)
    }

    async fn mirror_item(
        &self,
        account_id: &str,
        known: Option<&Position>,
        item: &SnapshotPosition,
        now: DateTime<Utc>,
        sync: &mut LedgerSync,
    ) -> Result<()> {
        let Some(known) = known else {
            if self.db.insert_position(account_id, item, None, now).await? {
                sync.inserted += 1;
            }
            return Ok(());
        };

        let stops = item.stops();
        if stops.differs_from(&known.stops()) {
            self.db.apply_stop_change(account_id, item.ticket, stops, now).await?;
            sync.updated += 1;
        }
        if (known.volume - item.volume).abs() > f64::EPSILON {
            self.db
                .update_position_volume(account_id, item.ticket, item.volume, now)
                .await?;
            sync.updated += 1;
        }
        Ok(())
    }

    /// Record the follower position created by an executed Open command.
    ///
    /// Needs a numeric result reference (the follower ticket). Returns whether
    /// the ledger changed.
    pub async fn record_copied_open(&self, command: &Command) -> Result<bool> {
        if command.status != CommandStatus::Executed || !command.command_type.is_open() {
            return Ok(false);
        }

        let (Some(leader_ticket), Some(follower_ticket)) = (
            command.leader_ticket_ref,
            command
                .result_reference
                .as_deref()
                .and_then(|r| r.trim().parse::<i64>().ok())
                .filter(|t| *t > 0),
        ) else {
            debug!(command_id = %command.id, "Executed Open without a usable follower ticket");
            return Ok(false);
        };

        let side = if command.command_type == CommandType::Sell {
            PositionSide::Sell
        } else {
            PositionSide::Buy
        };
        let item = SnapshotPosition {
            ticket: follower_ticket,
            symbol: command.symbol.clone().unwrap_or_default(),
            side,
            volume: command.volume.unwrap_or_default(),
            open_price: 0.0,
            stop_loss: command.stop_loss,
            take_profit: command.take_profit,
        };

        let account = &command.target_account_id;
        let changed = if self.db.insert_position(account, &item, Some(leader_ticket), Utc::now()).await? {
            true
        } else {
            // The follower's own heartbeat got there first
            self.db.set_leader_ticket_ref(account, follower_ticket, leader_ticket).await?
        };

        if changed {
            info!(
                account = %account,
                ticket = follower_ticket,
                leader_ticket,
                "Follower position linked to leader ticket"
            );
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_ledger() -> (Database, PositionLedger) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let ledger = PositionLedger::new(db.clone(), Arc::new(SnapshotTracker::new()));
        (db, ledger)
    }

    fn item(ticket: i64, sl: Option<f64>) -> SnapshotPosition {
        SnapshotPosition {
            ticket,
            symbol: "EURUSD".to_string(),
            side: PositionSide::Buy,
            volume: 2.0,
            open_price: 1.1,
            stop_loss: sl,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_mirror_inserts_updates_closes() {
        let (db, ledger) = make_ledger().await;

        let sync = ledger
            .mirror_snapshot("F1", &[item(1, None), item(2, None)], &[])
            .await
            .unwrap();
        assert_eq!(sync.inserted, 2);

        let sync = ledger.mirror_snapshot("F1", &[item(1, Some(1.05))], &[]).await.unwrap();
        assert_eq!(
            sync,
            LedgerSync {
                inserted: 0,
                updated: 1,
                closed: 1,
                errors: vec![],
            }
        );

        assert_eq!(db.get_open_tickets("F1").await.unwrap(), vec![1]);
        assert!(db.get_signals_for_ticket("F1", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_ticket_does_not_stop_the_mirror() {
        let (db, ledger) = make_ledger().await;
        ledger
            .mirror_snapshot("F1", &[item(1, None), item(2, None), item(3, None)], &[])
            .await
            .unwrap();

        let mut broken = item(4, None);
        broken.volume = f64::NAN;
        let sync = ledger
            .mirror_snapshot("F1", &[broken, item(1, Some(1.05)), item(5, None)], &[2])
            .await
            .unwrap();

        assert_eq!(sync.errors.len(), 1);
        assert_eq!(sync.inserted, 1);
        assert_eq!(sync.updated, 1);
        assert_eq!(sync.closed, 1);
        let mut open = db.get_open_tickets("F1").await.unwrap();
        open.sort_unstable();
        assert_eq!(open, vec![1, 2, 5]);
    }

    fn executed_open(result_reference: &str) -> Command {
        Command {
            seq: 1,
            id: "c1".to_string(),
            target_account_id: "F1".to_string(),
            link_id: Some("link".to_string()),
            command_type: CommandType::Buy,
            symbol: Some("EURUSD".to_string()),
            volume: Some(2.0),
            stop_loss: Some(1.05),
            take_profit: None,
            magic: Some(1),
            leader_ticket_ref: Some(100),
            priority: 2,
            status: CommandStatus::Executed,
            source_signal_id: None,
            idempotency_key: "L1:100:OPEN:0".to_string(),
            result_reference: Some(result_reference.to_string()),
            error_message: None,
            created_at: Utc::now(),
            sent_at: None,
            completed_at: None,
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_copied_open_is_linked() {
        let (db, ledger) = make_ledger().await;

        assert!(ledger.record_copied_open(&executed_open("555")).await.unwrap());
        let pos = db.get_position("F1", 555).await.unwrap().unwrap();
        assert_eq!(pos.leader_ticket_ref, Some(100));
        assert_eq!(pos.volume, 2.0);
        assert_eq!(pos.stop_loss, 1.05);

        // Non-numeric references are ignored
        assert!(!ledger.record_copied_open(&executed_open("order-abc")).await.unwrap());

        let mut failed = executed_open("556");
        failed.status = CommandStatus::Failed;
        assert!(!ledger.record_copied_open(&failed).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_first_then_ack() {
        let (db, ledger) = make_ledger().await;
        ledger.mirror_snapshot("F1", &[item(555, None)], &[]).await.unwrap();

        assert!(ledger.record_copied_open(&executed_open("555")).await.unwrap());
        assert_eq!(db.get_position("F1", 555).await.unwrap().unwrap().leader_ticket_ref, Some(100));
    }
}
