//! Fan a change signal out into one command per active copy link.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{idempotency_key, ChangeSignal, CopyLink, NewCommand, PositionStatus, SignalEvent};

use super::{CommandQueue, PositionSizer, ReplicatorConfig, SizingInputs};

/// What happened on one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Queued,
    /// A command for this key or ticket was already queued
    Duplicate,
    Skipped(String),
}

#[derive(Debug, Default)]
pub struct FanoutReport {
    pub generated: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub struct CommandFanout {
    db: Database,
    queue: Arc<CommandQueue>,
    config: ReplicatorConfig,
}

impl CommandFanout {
    pub fn new(db: Database, queue: Arc<CommandQueue>, config: ReplicatorConfig) -> Self {
        Self { db, queue, config }
    }

    /// Generate follower commands for a pending signal and mark it processed.
    ///
    /// Re-running on a signal that is no longer pending is a no-op, so the
    /// retry sweep can call this freely. Per-link failures are recorded and do
    /// not block other links.
    pub async fn process(&self, signal_id: &str) -> Result<FanoutReport> {
        let mut report = FanoutReport::default();

        // Re-read: the caller's copy may predate a supersede or an earlier run
        let Some(signal) = self.db.get_signal(signal_id).await? else {
            warn!(signal_id = %signal_id, "Signal vanished before fanout");
            return Ok(report);
        };

        if !signal.is_pending() {
            debug!(signal_id = %signal.id, status = ?signal.status, "Signal already handled");
            return Ok(report);
        }

        if signal.event_type == SignalEvent::Open && self.db.has_commands_for_key(&signal.idempotency_key).await? {
            info!(signal_id = %signal.id, key = %signal.idempotency_key, "Open already fanned out");
            self.db.mark_signal_processed(&signal.id, 0).await?;
            return Ok(report);
        }

        // A late Open for a ticket the leader already closed would leave an orphan on followers
        if signal.event_type == SignalEvent::Open && !self.leader_still_holds(&signal).await? {
            info!(
                signal_id = %signal.id,
                leader = %signal.leader_id,
                ticket = signal.ticket,
                "Ticket closed before its Open was fanned out, nothing to copy"
            );
            self.db.mark_signal_processed(&signal.id, 0).await?;
            return Ok(report);
        }

        let links: Vec<CopyLink> = self
            .db
            .get_active_links_for_leader(&signal.leader_id)
            .await?
            .into_iter()
            .filter(|link| {
                let accepted = link.accepts_symbol(&signal.symbol);
                if !accepted {
                    debug!(link_id = %link.id, symbol = %signal.symbol, "Symbol filtered by link");
                }
                accepted
            })
            .collect();

        let leader_balance = match signal.event_type {
            SignalEvent::Open => self
                .db
                .get_account(&signal.leader_id)
                .await?
                .map_or(0.0, |a| a.balance),
            _ => 0.0,
        };

        let outcomes = join_all(
            links
                .iter()
                .map(|link| self.fan_to_link(&signal, link, leader_balance)),
        )
        .await;

        for (link, outcome) in links.iter().zip(outcomes) {
            match outcome {
                Ok(LinkOutcome::Queued) => report.generated += 1,
                Ok(LinkOutcome::Duplicate) => report.duplicates += 1,
                Ok(LinkOutcome::Skipped(reason)) => {
                    debug!(link_id = %link.id, signal_id = %signal.id, reason = %reason, "Link skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(link_id = %link.id, signal_id = %signal.id, error = %e, "Fanout to link failed");
                    report.errors.push(format!("{}: {e:#}", link.follower_id));
                }
            }
        }

        if !report.errors.is_empty() {
            self.db.record_signal_error(&signal.id, &report.errors.join("; ")).await?;
        }
        self.db.mark_signal_processed(&signal.id, report.generated as i64).await?;

        info!(
            signal_id = %signal.id,
            event = signal.event_type.as_str(),
            ticket = signal.ticket,
            links = links.len(),
            generated = report.generated,
            "Signal fanned out"
        );

        Ok(report)
    }

    /// Re-run fanout on signals left pending since before `cutoff`.
    pub async fn retry_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stale = self.db.get_stale_pending_signals(cutoff).await?;
        let give_up = Utc::now() - self.config.command_ttl();
        let mut retried = 0;

        for signal in stale {
            // Commands generated now would already be past their TTL
            if signal.created_at < give_up {
                warn!(signal_id = %signal.id, "Pending signal outlived the command TTL");
                self.db
                    .mark_signal_failed(&signal.id, "fanout did not complete within the command TTL")
                    .await?;
                continue;
            }

            match self.process(&signal.id).await {
                Ok(_) => retried += 1,
                Err(e) => warn!(signal_id = %signal.id, error = %e, "Fanout retry failed"),
            }
        }

        if retried > 0 {
            info!(count = retried, "Retried pending signals");
        }
        Ok(retried)
    }

    async fn leader_still_holds(&self, signal: &ChangeSignal) -> Result<bool> {
        let open = self
            .db
            .get_position(&signal.leader_id, signal.ticket)
            .await?
            .is_some_and(|p| p.status == PositionStatus::Open);
        if !open {
            return Ok(false);
        }

        let close_key = idempotency_key(&signal.leader_id, signal.ticket, SignalEvent::Close, 0);
        Ok(!self.db.has_signal_for_key(&close_key).await?)
    }

    async fn fan_to_link(
        &self,
        signal: &ChangeSignal,
        link: &CopyLink,
        leader_balance: f64,
    ) -> Result<LinkOutcome> {
        let ttl = self.config.command_ttl();

        let cmd = match signal.event_type {
            SignalEvent::Open => {
                let follower_balance = self
                    .db
                    .get_account(&link.follower_id)
                    .await?
                    .map_or(0.0, |a| a.balance);
                let inputs = SizingInputs::from_f64(signal.volume, leader_balance, follower_balance);
                let volume = PositionSizer::calculate_volume(link, inputs);

                if volume.is_zero() {
                    return Ok(LinkOutcome::Skipped(format!(
                        "sized to zero ({} × {})",
                        link.sizing_mode.as_str(),
                        link.multiplier
                    )));
                }
                NewCommand::open(signal, link, PositionSizer::to_lots(volume), ttl)
            }
            SignalEvent::Close => {
                if self.db.has_live_close_command(&link.follower_id, signal.ticket).await? {
                    return Ok(LinkOutcome::Duplicate);
                }
                NewCommand::close(signal, link, ttl)
            }
            SignalEvent::Modify => NewCommand::modify(signal, link, ttl),
        };

        match self.queue.enqueue(&cmd).await? {
            Some(command) => {
                debug!(
                    command_id = %command.id,
                    follower = %link.follower_id,
                    "Replication command queued"
                );
                Ok(LinkOutcome::Queued)
            }
            None => Ok(LinkOutcome::Duplicate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccountRole, CommandStatus, CommandType, PositionSide, SignalStatus, SizingMode, SnapshotPosition,
    };

    struct Harness {
        db: Database,
        fanout: CommandFanout,
    }

    async fn make_harness() -> Harness {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let config = ReplicatorConfig::default();
        let queue = Arc::new(CommandQueue::new(db.clone(), config.clone()));
        let fanout = CommandFanout::new(db.clone(), queue, config);

        db.save_account("L1", "leader", AccountRole::Leader).await.unwrap();
        db.record_heartbeat("L1", 10_000.0, 10_000.0, 0.0, Utc::now()).await.unwrap();
        Harness { db, fanout }
    }

    async fn add_follower(db: &Database, id: &str, balance: f64, mode: SizingMode, k: f64, include: &str) {
        db.save_account(id, id, AccountRole::Follower).await.unwrap();
        db.record_heartbeat(id, balance, balance, 0.0, Utc::now()).await.unwrap();
        db.save_link("L1", id, mode, k, include, "", 0).await.unwrap();
    }

    async fn open_signal(db: &Database, ticket: i64, symbol: &str) -> ChangeSignal {
        let item = SnapshotPosition {
            ticket,
            symbol: symbol.to_string(),
            side: PositionSide::Buy,
            volume: 1.0,
            open_price: 1.1,
            stop_loss: Some(1.05),
            take_profit: None,
        };
        db.record_open("L1", &item).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_open_fans_out_per_link() {
        let h = make_harness().await;
        add_follower(&h.db, "F1", 5_000.0, SizingMode::FixedMultiplier, 2.0, "").await;
        add_follower(&h.db, "F2", 5_000.0, SizingMode::BalanceRatio, 1.0, "").await;
        add_follower(&h.db, "F3", 5_000.0, SizingMode::FixedMultiplier, 1.0, "GBPUSD").await;

        let signal = open_signal(&h.db, 100, "EURUSD").await;
        let report = h.fanout.process(&signal.id).await.unwrap();
        assert_eq!(report.generated, 2);

        let commands = h.db.get_commands_for_signal(&signal.id).await.unwrap();
        let f1 = commands.iter().find(|c| c.target_account_id == "F1").unwrap();
        assert_eq!(f1.command_type, CommandType::Buy);
        assert_eq!(f1.volume, Some(2.0));
        assert_eq!(f1.stop_loss, Some(1.05));
        assert_eq!(f1.leader_ticket_ref, Some(100));
        let f2 = commands.iter().find(|c| c.target_account_id == "F2").unwrap();
        assert_eq!(f2.volume, Some(0.5));

        let stored = h.db.get_signal(&signal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Processed);
        assert_eq!(stored.commands_generated, 2);
    }

    #[tokio::test]
    async fn test_reprocessing_generates_nothing() {
        let h = make_harness().await;
        add_follower(&h.db, "F1", 5_000.0, SizingMode::FixedMultiplier, 1.0, "").await;

        let signal = open_signal(&h.db, 100, "EURUSD").await;
        assert_eq!(h.fanout.process(&signal.id).await.unwrap().generated, 1);
        assert_eq!(h.fanout.process(&signal.id).await.unwrap().generated, 0);
        assert_eq!(h.db.get_commands_for_signal(&signal.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_volume_and_no_links_still_process() {
        let h = make_harness().await;

        let lonely = open_signal(&h.db, 1, "EURUSD").await;
        let report = h.fanout.process(&lonely.id).await.unwrap();
        assert_eq!(report.generated, 0);
        let stored = h.db.get_signal(&lonely.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Processed);

        add_follower(&h.db, "F1", 0.0, SizingMode::PercentOfBalance, 50.0, "").await;
        let zero_sized = open_signal(&h.db, 2, "EURUSD").await;
        let report = h.fanout.process(&zero_sized.id).await.unwrap();
        assert_eq!(report.generated, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_close_not_duplicated_while_live() {
        let h = make_harness().await;
        add_follower(&h.db, "F1", 5_000.0, SizingMode::FixedMultiplier, 1.0, "").await;

        let open = open_signal(&h.db, 100, "EURUSD").await;
        h.fanout.process(&open.id).await.unwrap();

        let close = h.db.record_close("L1", 100).await.unwrap().unwrap();
        let report = h.fanout.process(&close.id).await.unwrap();
        assert_eq!(report.generated, 1);

        let commands = h.db.get_commands_for_signal(&close.id).await.unwrap();
        assert_eq!(commands[0].command_type, CommandType::Close);
        assert_eq!(commands[0].status, CommandStatus::Pending);
        assert!(h.db.has_live_close_command("F1", 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_paused_link_is_skipped() {
        let h = make_harness().await;
        add_follower(&h.db, "F1", 5_000.0, SizingMode::FixedMultiplier, 1.0, "").await;
        h.db
            .set_follower_links_status("F1", crate::models::LinkStatus::Active, crate::models::LinkStatus::Paused)
            .await
            .unwrap();

        let signal = open_signal(&h.db, 100, "EURUSD").await;
        assert_eq!(h.fanout.process(&signal.id).await.unwrap().generated, 0);
    }

    #[tokio::test]
    async fn test_retry_picks_up_stale_pending() {
        let h = make_harness().await;
        add_follower(&h.db, "F1", 5_000.0, SizingMode::FixedMultiplier, 1.0, "").await;

        let signal = open_signal(&h.db, 100, "EURUSD").await;
        let retried = h
            .fanout
            .retry_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(retried, 1);
        assert_eq!(h.db.get_commands_for_signal(&signal.id).await.unwrap().len(), 1);

        let retried = h
            .fanout
            .retry_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(retried, 0);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_ttl() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let config = ReplicatorConfig {
            command_ttl_hours: 0,
            ..ReplicatorConfig::default()
        };
        let queue = Arc::new(CommandQueue::new(db.clone(), config.clone()));
        let fanout = CommandFanout::new(db.clone(), queue, config);
        db.save_account("L1", "leader", AccountRole::Leader).await.unwrap();

        let signal = open_signal(&db, 100, "EURUSD").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let retried = fanout.retry_stale(Utc::now()).await.unwrap();
        assert_eq!(retried, 0);

        let stored = db.get_signal(&signal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Failed);
        assert!(stored.error_message.is_some());
    }

    #[tokio::test]
    async fn test_stale_open_after_close_is_not_copied() {
        let h = make_harness().await;
        add_follower(&h.db, "F1", 5_000.0, SizingMode::FixedMultiplier, 1.0, "").await;
        let queue = CommandQueue::new(h.db.clone(), ReplicatorConfig::default());

        // Open fanout never ran; the Close went out and was dispatched
        let open = open_signal(&h.db, 100, "EURUSD").await;
        let close = h.db.record_close("L1", 100).await.unwrap().unwrap();
        h.fanout.process(&close.id).await.unwrap();
        let first = queue.pull("F1", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].command_type, CommandType::Close);

        h.fanout
            .retry_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert!(queue.pull("F1", 10).await.unwrap().is_empty());
        let stored = h.db.get_signal(&open.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Processed);
        assert_eq!(stored.commands_generated, 0);
    }

    #[tokio::test]
    async fn test_extreme_balance_skips_link() {
        let h = make_harness().await;
        h.db.record_heartbeat("L1", 0.001, 0.001, 0.0, Utc::now()).await.unwrap();
        add_follower(&h.db, "F1", 1e27, SizingMode::BalanceRatio, 1.0, "").await;

        let item = SnapshotPosition {
            ticket: 9,
            symbol: "EURUSD".to_string(),
            side: PositionSide::Buy,
            volume: 100.0,
            open_price: 1.1,
            stop_loss: None,
            take_profit: None,
        };
        let signal = h.db.record_open("L1", &item).await.unwrap().unwrap();

        let report = h.fanout.process(&signal.id).await.unwrap();
        assert_eq!(report.generated, 0);
        assert_eq!(report.skipped, 1);
    }
}
