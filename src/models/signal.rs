//! ChangeSignal model: an inferred Open/Close/Modify event on a leader ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "lowercase")]
pub enum SignalEvent {
    Open,
    Close,
    Modify,
}

impl SignalEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEvent::Open => "OPEN",
            SignalEvent::Close => "CLOSE",
            SignalEvent::Modify => "MODIFY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Processed,
    Failed,
    Superseded,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Processed => "processed",
            SignalStatus::Failed => "failed",
            SignalStatus::Superseded => "superseded",
        }
    }
}

/// Key that makes signal and command creation idempotent.
///
/// Open and Close use epoch 0; Modify uses the ledger revision of the change.
pub fn idempotency_key(leader_id: &str, ticket: i64, event: SignalEvent, epoch: i64) -> String {
    format!("{}:{}:{}:{}", leader_id, ticket, event.as_str(), epoch)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSignal {
    pub id: String,
    pub leader_id: String,
    pub ticket: i64,
    pub event_type: SignalEvent,
    pub idempotency_key: String,

    /// Leader position state captured when the signal was emitted
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: f64,

    pub status: SignalStatus,
    pub commands_generated: i64,
    pub commands_executed: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ChangeSignal {
    pub fn is_pending(&self) -> bool {
        self.status == SignalStatus::Pending
    }
}
