//! Leader snapshot diffing: turns heartbeats into Open/Close/Modify signals.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{ChangeSignal, Position, SignalEvent, SnapshotPosition};

use super::snapshot::LastSeen;
use super::SnapshotTracker;

/// Outcome of diffing one leader snapshot.
#[derive(Debug, Default)]
pub struct DiffReport {
    pub signals: Vec<ChangeSignal>,
    /// Per-ticket failures; the rest of the snapshot was still processed
    pub errors: Vec<String>,
}

impl DiffReport {
    pub fn count(&self, event: SignalEvent) -> usize {
        self.signals.iter().filter(|s| s.event_type == event).count()
    }
}

pub struct SignalGenerator {
    db: Database,
    tracker: Arc<SnapshotTracker>,
}

impl SignalGenerator {
    pub fn new(db: Database, tracker: Arc<SnapshotTracker>) -> Self {
        Self { db, tracker }
    }

    /// Take the leader's heartbeat stream exclusively.
    ///
    /// Held across diff and fanout so a later heartbeat of the same leader
    /// cannot emit a Close before this heartbeat's Open has its commands.
    pub async fn lock_leader(&self, leader_id: &str) -> OwnedMutexGuard<LastSeen> {
        self.tracker.lock(leader_id).await
    }

    #[cfg(test)]
    pub async fn process_snapshot(&self, leader_id: &str, snapshot: &[SnapshotPosition]) -> DiffReport {
        let mut seen = self.lock_leader(leader_id).await;
        self.diff(leader_id, &mut seen, snapshot, &[]).await
    }

    /// Diff a leader snapshot against the previous one and record signals.
    ///
    /// `unreadable` lists tickets whose items could not be parsed; they count
    /// as present. A cold tracker is seeded from the ledger first, so a
    /// restart never re-announces a ticket that is still open.
    pub async fn diff(
        &self,
        leader_id: &str,
        seen: &mut LastSeen,
        snapshot: &[SnapshotPosition],
        unreadable: &[i64],
    ) -> DiffReport {
        let mut report = DiffReport::default();

        let ledger: BTreeMap<i64, Position> = match self.db.get_open_positions(leader_id).await {
            Ok(rows) => rows.into_iter().map(|p| (p.ticket, p)).collect(),
            Err(e) => {
                // Without the ledger neither Close nor Modify can be decided
                warn!(leader = %leader_id, error = %e, "Ledger unavailable, snapshot skipped");
                report.errors.push(format!("ledger unavailable: {e:#}"));
                return report;
            }
        };

        if seen.is_cold() {
            seen.seed(ledger.keys().copied());
            info!(leader = %leader_id, tickets = seen.len(), "Rehydrated last-seen tickets from ledger");
        }

        let mut current: BTreeMap<i64, &SnapshotPosition> = BTreeMap::new();
        for item in snapshot {
            if item.ticket <= 0 {
                report.errors.push(format!("dropped snapshot item with ticket {}", item.ticket));
                continue;
            }
            current.insert(item.ticket, item);
        }

        let mut next_seen: HashSet<i64> = current.keys().copied().collect();

        // A malformed item still counts as present so it never reads as a close,
        // but a ticket first seen malformed stays unseen until a valid sighting
        let unreadable: HashSet<i64> = unreadable.iter().copied().filter(|t| seen.contains(*t)).collect();
        next_seen.extend(&unreadable);

        for (&ticket, item) in &current {
            if let Err(e) = item.validate() {
                if !seen.contains(ticket) && !ledger.contains_key(&ticket) {
                    next_seen.remove(&ticket);
                }
                report.errors.push(e.to_string());
                continue;
            }

            if seen.contains(ticket) {
                if let Some(known) = ledger.get(&ticket) {
                    self.detect_modify(leader_id, known, item, &mut report).await;
                }
                continue;
            }

            match self.db.record_open(leader_id, item).await {
                Ok(Some(signal)) => {
                    info!(
                        leader = %leader_id,
                        ticket,
                        symbol = %item.symbol,
                        side = item.side.as_str(),
                        volume = item.volume,
                        "Open detected"
                    );
                    report.signals.push(signal);
                }
                Ok(None) => debug!(leader = %leader_id, ticket, "Ticket already known, no Open"),
                Err(e) => {
                    // Leave it unseen so the next heartbeat retries the Open
                    next_seen.remove(&ticket);
                    report.errors.push(format!("open {ticket}: {e:#}"));
                }
            }
        }

        for ticket in seen.tickets() {
            if current.contains_key(&ticket) || unreadable.contains(&ticket) {
                continue;
            }

            match self.db.record_close(leader_id, ticket).await {
                Ok(Some(signal)) => {
                    info!(leader = %leader_id, ticket, symbol = %signal.symbol, "Close detected");
                    report.signals.push(signal);
                }
                Ok(None) => debug!(leader = %leader_id, ticket, "Ticket already closed in ledger"),
                Err(e) => {
                    // Keep it seen so the next heartbeat retries the Close
                    next_seen.insert(ticket);
                    report.errors.push(format!("close {ticket}: {e:#}"));
                }
            }
        }

        seen.replace(next_seen);

        if !report.errors.is_empty() {
            warn!(leader = %leader_id, errors = report.errors.len(), "Snapshot processed with errors");
        }

        report
    }

    async fn detect_modify(
        &self,
        leader_id: &str,
        known: &Position,
        item: &SnapshotPosition,
        report: &mut DiffReport,
    ) {
        let ticket = item.ticket;

        // Partial closes only move volume; they are not replicated
        if (known.volume - item.volume).abs() > f64::EPSILON {
            if let Err(e) = self
                .db
                .update_position_volume(leader_id, ticket, item.volume, chrono::Utc::now())
                .await
            {
                report.errors.push(format!("volume {ticket}: {e:#}"));
            }
        }

        let stops = item.stops();
        if !stops.differs_from(&known.stops()) {
            return;
        }

        match self.db.record_modify(leader_id, ticket, stops).await {
            Ok(Some(signal)) => {
                info!(
                    leader = %leader_id,
                    ticket,
                    stop_loss = stops.stop_loss,
                    take_profit = stops.take_profit,
                    "Modify detected"
                );
                report.signals.push(signal);
            }
            Ok(None) => debug!(leader = %leader_id, ticket, "Modify raced a close"),
            Err(e) => report.errors.push(format!("modify {ticket}: {e:#}")),
        }
    }
}
