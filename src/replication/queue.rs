//! Per-follower command queue and its dispatch state machine.
//!
//! Pending → Sent happens only inside [`CommandQueue::pull`], one conditional
//! update per row, so a command reaches a follower at most once. Sent →
//! Executed/Failed happens only through [`CommandQueue::acknowledge`]. There is
//! no timeout-driven resend of a Sent command.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{ReplicationError, ReplicationResult};
use crate::models::{AckStatus, Command, CommandAck, CommandStatus, NewCommand};

use super::ReplicatorConfig;

/// Most recent enqueue per follower, used to spot a stale read.
#[derive(Debug, Clone)]
struct WriteHint {
    command_id: String,
    written_at: Instant,
}

pub struct CommandQueue {
    db: Database,
    config: ReplicatorConfig,
    recent_writes: DashMap<String, WriteHint>,
}

impl CommandQueue {
    pub fn new(db: Database, config: ReplicatorConfig) -> Self {
        Self {
            db,
            config,
            recent_writes: DashMap::new(),
        }
    }

    /// Persist a command. `None` means an identical command already exists.
    pub async fn enqueue(&self, cmd: &NewCommand) -> Result<Option<Command>> {
        let stored = self.db.insert_command(cmd).await?;

        match &stored {
            Some(command) => {
                self.recent_writes.insert(
                    command.target_account_id.clone(),
                    WriteHint {
                        command_id: command.id.clone(),
                        written_at: Instant::now(),
                    },
                );
                debug!(
                    command_id = %command.id,
                    target = %command.target_account_id,
                    command_type = command.command_type.as_str(),
                    priority = command.priority,
                    "Command enqueued"
                );
            }
            None => debug!(
                key = %cmd.idempotency_key,
                target = %cmd.target_account_id,
                "Command already queued for this key"
            ),
        }

        Ok(stored)
    }

    /// Hand up to `limit` pending commands to a follower and mark them Sent.
    pub async fn pull(&self, target_account_id: &str, limit: usize) -> Result<Vec<Command>> {
        let limit = limit.clamp(1, self.config.dispatch_batch_limit.max(1));
        let mut candidates = self.db.get_dispatchable_commands(target_account_id, Utc::now()).await?;

        if self.missed_recent_write(target_account_id, &candidates) {
            warn!(
                target = %target_account_id,
                delay_ms = self.config.read_retry_delay_ms,
                "Recent command not visible yet, retrying pull once"
            );
            tokio::time::sleep(self.config.read_retry_delay()).await;
            candidates = self.db.get_dispatchable_commands(target_account_id, Utc::now()).await?;
            // One retry only; the command ships on a later poll if still missing
            self.recent_writes.remove(target_account_id);
        }

        let batch = select_causal_batch(candidates, limit);

        let now = Utc::now();
        let mut sent = Vec::with_capacity(batch.len());
        for cmd in batch {
            // A concurrent pull may have claimed the row first
            if let Some(claimed) = self.db.mark_command_sent(&cmd.id, now).await? {
                sent.push(claimed);
            }
        }

        if let Some(hint) = self.recent_writes.get(target_account_id).map(|h| h.command_id.clone()) {
            if sent.iter().any(|c| c.id == hint) {
                self.recent_writes.remove(target_account_id);
            }
        }

        if !sent.is_empty() {
            info!(target = %target_account_id, count = sent.len(), "Commands dispatched");
        }

        Ok(sent)
    }

    /// Preview of the next pull without changing any state.
    pub async fn peek(&self, target_account_id: &str, limit: usize) -> Result<Vec<Command>> {
        let candidates = self.db.get_dispatchable_commands(target_account_id, Utc::now()).await?;
        Ok(select_causal_batch(candidates, limit))
    }

    /// Apply a follower's acknowledgment: Sent → Executed or Failed.
    pub async fn acknowledge(&self, target_account_id: &str, ack: &CommandAck) -> ReplicationResult<Command> {
        if ack.command_id.trim().is_empty() {
            return Err(ReplicationError::Validation("ack without commandId".to_string()));
        }

        let status = match ack.status {
            AckStatus::Success => CommandStatus::Executed,
            AckStatus::Failure => CommandStatus::Failed,
        };

        let completed = self
            .db
            .complete_command(
                &ack.command_id,
                target_account_id,
                status,
                ack.result_reference.as_deref(),
                ack.error.as_deref(),
                Utc::now(),
            )
            .await?;

        if let Some(command) = completed {
            info!(
                command_id = %command.id,
                target = %target_account_id,
                status = command.status.as_str(),
                result = ?command.result_reference,
                "Command acknowledged"
            );
            return Ok(command);
        }

        match self.db.get_command(&ack.command_id).await? {
            Some(cmd) if cmd.target_account_id == target_account_id => {
                if cmd.status.is_terminal() {
                    Err(ReplicationError::Duplicate(format!(
                        "command {} already {}",
                        cmd.id,
                        cmd.status.as_str()
                    )))
                } else {
                    Err(ReplicationError::Validation(format!(
                        "command {} is {}, only sent commands can be acknowledged",
                        cmd.id,
                        cmd.status.as_str()
                    )))
                }
            }
            _ => Err(ReplicationError::NotFound(format!(
                "command {} for account {}",
                ack.command_id, target_account_id
            ))),
        }
    }

    /// Expire never-dispatched commands past their TTL.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.db.expire_commands(now).await?;
        if expired > 0 {
            info!(count = expired, "Expired undelivered commands");
        }
        Ok(expired)
    }

    fn missed_recent_write(&self, target_account_id: &str, candidates: &[Command]) -> bool {
        let Some(hint) = self.recent_writes.get(target_account_id).map(|h| h.value().clone()) else {
            return false;
        };

        if hint.written_at.elapsed() > self.config.read_hint_window() {
            self.recent_writes.remove(target_account_id);
            return false;
        }

        !candidates.iter().any(|c| c.id == hint.command_id)
    }
}

/// Pick the batch in queue order, holding back a Close/Modify while the Open it
/// acts on is still pending and not ahead of it in this batch.
fn select_causal_batch(candidates: Vec<Command>, limit: usize) -> Vec<Command> {
    let ticket_key = |c: &Command| c.leader_ticket_ref.map(|t| (c.link_id.clone(), t));

    let pending_opens: HashSet<_> = candidates
        .iter()
        .filter(|c| c.command_type.is_open())
        .filter_map(ticket_key)
        .collect();

    let mut released = HashSet::new();
    let mut batch = Vec::new();

    for cmd in candidates {
        if batch.len() >= limit {
            break;
        }

        let key = ticket_key(&cmd);
        if cmd.command_type.needs_open_first() {
            if let Some(key) = &key {
                if pending_opens.contains(key) && !released.contains(key) {
                    debug!(command_id = %cmd.id, "Holding back until its Open is dispatched");
                    continue;
                }
            }
        }

        if cmd.command_type.is_open() {
            if let Some(key) = key {
                released.insert(key);
            }
        }
        batch.push(cmd);
    }

    batch
}
