//! Replicator: wires the pipeline together behind the transport.
//!
//! Handles:
//! - Heartbeat ingestion (acks, snapshot diff or ledger mirror, guard rules)
//! - Dispatch pulls and acknowledgments for follower terminals
//! - The periodic maintenance sweep (expiry, liveness, pending-signal retry)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{ReplicationError, ReplicationResult};
use crate::models::{AccountRole, Command, CommandAck, CommandStatus, Heartbeat};
use crate::notify::{Notifier, StatusEvent};
use crate::replication::{
    CommandFanout, CommandQueue, GuardEvent, LiveState, LiveStateCache, PositionLedger, ReplicatorConfig,
    RuleEngine, SignalGenerator, SnapshotTracker,
};

/// What one heartbeat did. Returned instead of an error so the terminal's
/// check-in always succeeds.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub account_id: String,
    pub accepted: bool,
    pub acks_applied: usize,
    pub signals_emitted: usize,
    pub commands_generated: usize,
    pub guard_tripped: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired: u64,
    pub went_offline: Vec<String>,
    pub signals_retried: usize,
}

pub struct Replicator {
    config: ReplicatorConfig,
    db: Database,
    queue: Arc<CommandQueue>,
    generator: SignalGenerator,
    fanout: CommandFanout,
    ledger: PositionLedger,
    rules: RuleEngine,
    live: LiveStateCache,
    notifier: Notifier,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Replicator {
    pub fn new(db: Database, config: ReplicatorConfig, notifier: Notifier) -> Self {
        let tracker = Arc::new(SnapshotTracker::new());
        let queue = Arc::new(CommandQueue::new(db.clone(), config.clone()));

        Self {
            generator: SignalGenerator::new(db.clone(), tracker.clone()),
            fanout: CommandFanout::new(db.clone(), queue.clone(), config.clone()),
            ledger: PositionLedger::new(db.clone(), tracker),
            rules: RuleEngine::new(db.clone(), queue.clone(), config.clone()),
            live: LiveStateCache::new(),
            queue,
            notifier,
            config,
            db,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    // ==================== Heartbeats ====================

    /// Process one terminal check-in. Never fails; problems are listed in the report.
    pub async fn ingest_heartbeat(&self, account_id: &str, heartbeat: Heartbeat) -> HeartbeatReport {
        let mut report = HeartbeatReport {
            account_id: account_id.to_string(),
            ..Default::default()
        };

        let account = match self.db.get_account(account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                let err = ReplicationError::NotFound(format!("account {account_id}"));
                warn!(account = %account_id, "Heartbeat from unregistered account");
                report.errors.push(err.to_string());
                return report;
            }
            Err(e) => {
                error!(account = %account_id, error = %e, "Account lookup failed");
                report.errors.push(ReplicationError::Storage(e).to_string());
                return report;
            }
        };
        report.accepted = true;
        report.errors.extend(heartbeat.rejected.iter().cloned());

        let now = Utc::now();
        if let Err(e) = self
            .db
            .record_heartbeat(account_id, heartbeat.balance, heartbeat.equity, heartbeat.margin, now)
            .await
        {
            report.errors.push(format!("heartbeat not stored: {e:#}"));
        }
        self.live.record(account_id, &heartbeat, now);

        for ack in &heartbeat.executed_command_acks {
            match self.acknowledge(account_id, ack).await {
                Ok(_) => report.acks_applied += 1,
                Err(e) if e.is_benign() => debug!(account = %account_id, error = %e, "Ack already applied"),
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        if account.is_leader() {
            self.replicate_snapshot(account_id, &heartbeat, &mut report).await;
        } else {
            match self
                .ledger
                .mirror_snapshot(account_id, &heartbeat.open_positions, &heartbeat.unreadable_tickets)
                .await
            {
                Ok(sync) => report.errors.extend(sync.errors),
                Err(e) => {
                    warn!(account = %account_id, error = %e, "Follower ledger mirror failed");
                    report.errors.push(format!("ledger mirror: {e:#}"));
                }
            }
        }

        match self
            .rules
            .evaluate_account(account_id, heartbeat.balance, heartbeat.equity)
            .await
        {
            Ok(Some(event)) => {
                report.guard_tripped = event.tripped;
                self.notify_guard(event);
            }
            Ok(None) => {}
            Err(e) => report.errors.push(format!("guard rules: {e:#}")),
        }

        debug!(
            account = %account_id,
            role = account.role.as_str(),
            positions = heartbeat.open_positions.len(),
            acks = report.acks_applied,
            signals = report.signals_emitted,
            errors = report.errors.len(),
            "Heartbeat processed"
        );

        report
    }

    async fn replicate_snapshot(&self, leader_id: &str, heartbeat: &Heartbeat, report: &mut HeartbeatReport) {
        // One heartbeat per leader at a time, from diff through fanout
        let mut seen = self.generator.lock_leader(leader_id).await;
        let diff = self
            .generator
            .diff(
                leader_id,
                &mut seen,
                &heartbeat.open_positions,
                &heartbeat.unreadable_tickets,
            )
            .await;
        report.signals_emitted = diff.signals.len();
        report.errors.extend(diff.errors);

        // Fire-and-continue: a failed fanout leaves the signal pending for the sweep
        for signal in &diff.signals {
            self.notifier.notify(StatusEvent::signal(signal));

            match self.fanout.process(&signal.id).await {
                Ok(fanned) => {
                    report.commands_generated += fanned.generated;
                    report.errors.extend(fanned.errors);
                }
                Err(e) => {
                    warn!(signal_id = %signal.id, error = %e, "Fanout failed, signal left pending");
                    report.errors.push(format!("fanout {}: {e:#}", signal.id));
                }
            }
        }

        drop(seen);
    }

    // ==================== Dispatch ====================

    /// Follower poll: hand out the next batch of commands.
    pub async fn pull(&self, account_id: &str, limit: Option<usize>) -> ReplicationResult<Vec<Command>> {
        if self.db.get_account(account_id).await?.is_none() {
            return Err(ReplicationError::NotFound(format!("account {account_id}")));
        }

        let limit = limit.unwrap_or(self.config.dispatch_batch_limit);
        Ok(self.queue.pull(account_id, limit).await?)
    }

    /// Apply one acknowledgment and its follow-up bookkeeping.
    pub async fn acknowledge(&self, account_id: &str, ack: &CommandAck) -> ReplicationResult<Command> {
        let command = self.queue.acknowledge(account_id, ack).await?;

        if command.status == CommandStatus::Executed {
            if let Some(signal_id) = &command.source_signal_id {
                if let Err(e) = self.db.increment_signal_executed(signal_id).await {
                    warn!(signal_id = %signal_id, error = %e, "Failed to count executed command");
                }
            }

            if let Err(e) = self.ledger.record_copied_open(&command).await {
                warn!(command_id = %command.id, error = %e, "Failed to record copied position");
            }
        } else {
            warn!(
                command_id = %command.id,
                account = %account_id,
                command_type = command.command_type.as_str(),
                error = ?command.error_message,
                "Follower reported command failure"
            );
        }

        Ok(command)
    }

    /// Latest known state: live cache first, durable store as fallback.
    pub async fn live_state(&self, account_id: &str) -> ReplicationResult<LiveState> {
        if let Some(state) = self.live.get(account_id) {
            return Ok(state);
        }

        let account = self
            .db
            .get_account(account_id)
            .await?
            .ok_or_else(|| ReplicationError::NotFound(format!("account {account_id}")))?;
        let open = self.db.count_open_positions(account_id).await?;

        Ok(LiveState::from_account(&account, open.max(0) as usize))
    }

    /// Operator reset of a tripped guard.
    pub async fn reset_guard(&self, account_id: &str) -> Result<Option<GuardEvent>> {
        let event = self.rules.reset(account_id).await?;
        if let Some(event) = &event {
            self.notify_guard(event.clone());
        }
        Ok(event)
    }

    fn notify_guard(&self, event: GuardEvent) {
        self.notifier.notify(StatusEvent::GuardChanged(event));
    }

    // ==================== Maintenance ====================

    /// One maintenance pass. Each step runs even if an earlier one failed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.queue.expire(now).await {
            Ok(expired) => report.expired = expired,
            Err(e) => error!(error = %e, "Command expiry failed"),
        }

        let cutoff = now - chrono::Duration::seconds(self.config.offline_after_secs);
        match self.db.mark_stale_accounts_offline(cutoff).await {
            Ok(offline) if !offline.is_empty() => {
                info!(accounts = ?offline, "Accounts went offline");
                self.live.mark_offline(&offline);
                self.notifier.notify(StatusEvent::AccountsOffline {
                    account_ids: offline.clone(),
                });
                report.went_offline = offline;
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Liveness check failed"),
        }

        let retry_cutoff = now - chrono::Duration::seconds(self.config.pending_signal_retry_secs);
        match self.fanout.retry_stale(retry_cutoff).await {
            Ok(retried) => report.signals_retried = retried,
            Err(e) => error!(error = %e, "Pending signal retry failed"),
        }

        report
    }

    /// Sweep loop; returns after ctrl-c or an external shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.config.sweep_interval_secs,
            offline_after_secs = self.config.offline_after_secs,
            notifier = self.notifier.is_enabled(),
            "Starting maintenance sweep loop"
        );

        let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            let report = self.sweep(Utc::now()).await;
            debug!(
                expired = report.expired,
                offline = report.went_offline.len(),
                retried = report.signals_retried,
                cached_accounts = self.live.len(),
                "Sweep complete"
            );
        }

        info!("Replicator stopped");
        Ok(())
    }
}

/// Register an account role in one call; used by the CLI and tests.
pub async fn register_account(db: &Database, id: &str, name: &str, role: AccountRole) -> Result<()> {
    db.save_account(id, name, role).await?;
    info!(account = %id, role = role.as_str(), "Account registered");
    Ok(())
}
