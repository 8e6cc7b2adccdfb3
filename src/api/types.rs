//! Wire types for the terminal-facing HTTP endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Command, CommandStatus, CommandType};

/// Command as delivered to a follower terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandWire {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Absent only on account-level control commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_ticket_ref: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    pub priority: i64,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Command> for CommandWire {
    fn from(cmd: Command) -> Self {
        Self {
            id: cmd.id,
            command_type: cmd.command_type,
            symbol: cmd.symbol,
            volume: cmd.volume,
            stop_loss: cmd.stop_loss,
            take_profit: cmd.take_profit,
            leader_ticket_ref: cmd.leader_ticket_ref,
            magic: cmd.magic,
            priority: cmd.priority,
            status: cmd.status,
            created_at: cmd.created_at,
            expires_at: cmd.expires_at,
        }
    }
}

/// `?limit=N` on the dispatch pull.
#[derive(Debug, Default, Deserialize)]
pub struct PullQuery {
    pub limit: Option<usize>,
}

/// Reply to an acknowledgment.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReply {
    pub command_id: String,
    pub status: Option<CommandStatus>,
    /// The ack had already been applied; nothing changed
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}
