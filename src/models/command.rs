//! Command model: a directive queued for a follower terminal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangeSignal, CopyLink, PositionSide};

/// Open commands start here and add up to 3 from the link priority.
pub const PRIORITY_OPEN_BASE: i64 = 2;
pub const PRIORITY_CLOSE: i64 = 6;
/// Highest replication priority: a late stop-loss change is exposure.
pub const PRIORITY_MODIFY: i64 = 7;

/// Guard commands sit above every replication command.
pub const PRIORITY_PAUSE_RESUME: i64 = 9;
pub const PRIORITY_CLOSE_ALL: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandType {
    Buy,
    Sell,
    Close,
    Modify,
    CloseAll,
    PauseCopy,
    ResumeCopy,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Buy => "BUY",
            CommandType::Sell => "SELL",
            CommandType::Close => "CLOSE",
            CommandType::Modify => "MODIFY",
            CommandType::CloseAll => "CLOSE_ALL",
            CommandType::PauseCopy => "PAUSE_COPY",
            CommandType::ResumeCopy => "RESUME_COPY",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CommandType::Buy | CommandType::Sell)
    }

    /// Commands that act on a position the follower must already hold.
    pub fn needs_open_first(&self) -> bool {
        matches!(self, CommandType::Close | CommandType::Modify)
    }
}

impl From<PositionSide> for CommandType {
    fn from(side: PositionSide) -> Self {
        match side {
            PositionSide::Buy => CommandType::Buy,
            PositionSide::Sell => CommandType::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Executed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            CommandStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Executed | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

/// Persisted command row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Insertion order, the FIFO tiebreak within one priority
    pub seq: i64,
    pub id: String,
    pub target_account_id: String,
    pub link_id: Option<String>,
    pub command_type: CommandType,
    pub symbol: Option<String>,
    pub volume: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub magic: Option<i64>,
    pub leader_ticket_ref: Option<i64>,
    pub priority: i64,
    pub status: CommandStatus,
    pub source_signal_id: Option<String>,
    pub idempotency_key: String,
    pub result_reference: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// A command about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub target_account_id: String,
    pub link_id: Option<String>,
    pub command_type: CommandType,
    pub symbol: Option<String>,
    pub volume: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub magic: Option<i64>,
    pub leader_ticket_ref: Option<i64>,
    pub priority: i64,
    pub source_signal_id: Option<String>,
    pub idempotency_key: String,
    pub ttl: Duration,
}

impl NewCommand {
    fn replication(signal: &ChangeSignal, link: &CopyLink, command_type: CommandType, ttl: Duration) -> Self {
        Self {
            target_account_id: link.follower_id.clone(),
            link_id: Some(link.id.clone()),
            command_type,
            symbol: Some(signal.symbol.clone()),
            volume: None,
            stop_loss: None,
            take_profit: None,
            magic: Some(link.magic_number()),
            leader_ticket_ref: Some(signal.ticket),
            priority: PRIORITY_CLOSE,
            source_signal_id: Some(signal.id.clone()),
            idempotency_key: signal.idempotency_key.clone(),
            ttl,
        }
    }

    /// Market order mirroring a leader Open.
    pub fn open(signal: &ChangeSignal, link: &CopyLink, volume: f64, ttl: Duration) -> Self {
        let mut cmd = Self::replication(signal, link, signal.side.into(), ttl);
        cmd.volume = Some(volume);
        cmd.stop_loss = Some(signal.stop_loss);
        cmd.take_profit = Some(signal.take_profit);
        cmd.priority = PRIORITY_OPEN_BASE + link.priority.clamp(0, 3);
        cmd
    }

    /// Close by leader ticket; the follower resolves its own position by marker.
    pub fn close(signal: &ChangeSignal, link: &CopyLink, ttl: Duration) -> Self {
        Self::replication(signal, link, CommandType::Close, ttl)
    }

    /// Always carries both levels, even if only one changed.
    pub fn modify(signal: &ChangeSignal, link: &CopyLink, ttl: Duration) -> Self {
        let mut cmd = Self::replication(signal, link, CommandType::Modify, ttl);
        cmd.stop_loss = Some(signal.stop_loss);
        cmd.take_profit = Some(signal.take_profit);
        cmd.priority = PRIORITY_MODIFY;
        cmd
    }

    /// Control command raised by a guard rule.
    pub fn guard(account_id: &str, command_type: CommandType, key: String, ttl: Duration) -> Self {
        let priority = match command_type {
            CommandType::CloseAll => PRIORITY_CLOSE_ALL,
            _ => PRIORITY_PAUSE_RESUME,
        };
        Self {
            target_account_id: account_id.to_string(),
            link_id: None,
            command_type,
            symbol: None,
            volume: None,
            stop_loss: None,
            take_profit: None,
            magic: None,
            leader_ticket_ref: None,
            priority,
            source_signal_id: None,
            idempotency_key: key,
            ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        use CommandStatus::*;

        assert!(Executed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Expired.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(!Sent.is_terminal());
    }

    #[test]
    fn test_priority_bands() {
        assert!(PRIORITY_MODIFY > PRIORITY_CLOSE);
        assert!(PRIORITY_CLOSE > PRIORITY_OPEN_BASE + 3);
        assert!(PRIORITY_MODIFY < PRIORITY_PAUSE_RESUME);
        assert!(PRIORITY_CLOSE_ALL <= 10);
    }

    #[test]
    fn test_command_type_wire_names() {
        assert_eq!(serde_json::to_string(&CommandType::CloseAll).unwrap(), "\"CLOSE_ALL\"");
        assert_eq!(CommandType::from(PositionSide::Sell), CommandType::Sell);
    }
}
