//! Heartbeat and acknowledgment payloads posted by trading terminals.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SnapshotPosition;
use crate::error::ReplicationError;

/// Periodic status-and-position report from a terminal.
///
/// List items are parsed one at a time: a malformed item is dropped and
/// reported in `rejected` while the rest of the heartbeat is kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawHeartbeat")]
pub struct Heartbeat {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub open_positions: Vec<SnapshotPosition>,
    pub executed_command_acks: Vec<CommandAck>,

    /// Positive tickets of position items that failed to parse. The position
    /// still exists on the terminal, so it must not read as a close.
    #[serde(skip)]
    pub unreadable_tickets: Vec<i64>,

    #[serde(skip)]
    pub rejected: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeartbeat {
    #[serde(default)]
    balance: f64,
    #[serde(default)]
    equity: f64,
    #[serde(default)]
    margin: f64,
    #[serde(default)]
    open_positions: Vec<Value>,
    #[serde(default)]
    executed_command_acks: Vec<Value>,
}

impl From<RawHeartbeat> for Heartbeat {
    fn from(raw: RawHeartbeat) -> Self {
        let mut heartbeat = Heartbeat {
            balance: raw.balance,
            equity: raw.equity,
            margin: raw.margin,
            ..Default::default()
        };

        for (idx, value) in raw.open_positions.into_iter().enumerate() {
            let ticket = value.get("ticket").and_then(Value::as_i64).filter(|t| *t > 0);
            match serde_json::from_value::<SnapshotPosition>(value) {
                Ok(item) => heartbeat.open_positions.push(item),
                Err(e) => {
                    heartbeat.unreadable_tickets.extend(ticket);
                    heartbeat
                        .rejected
                        .push(ReplicationError::Validation(format!("position item {idx}: {e}")).to_string());
                }
            }
        }

        for (idx, value) in raw.executed_command_acks.into_iter().enumerate() {
            match serde_json::from_value::<CommandAck>(value) {
                Ok(ack) => heartbeat.executed_command_acks.push(ack),
                Err(e) => heartbeat
                    .rejected
                    .push(ReplicationError::Validation(format!("ack item {idx}: {e}")).to_string()),
            }
        }

        heartbeat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    #[serde(alias = "executed", alias = "ok")]
    Success,
    #[serde(alias = "failed", alias = "error")]
    Failure,
}

/// Result of one executed (or rejected) command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub result_reference: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_defaults() {
        let hb: Heartbeat = serde_json::from_str(r#"{"balance":1000.0}"#).unwrap();
        assert_eq!(hb.balance, 1000.0);
        assert!(hb.open_positions.is_empty());
        assert!(hb.executed_command_acks.is_empty());
    }

    #[test]
    fn test_ack_status_aliases() {
        let ack: CommandAck =
            serde_json::from_str(r#"{"commandId":"c1","status":"executed","resultReference":"555"}"#)
                .unwrap();
        assert_eq!(ack.status, AckStatus::Success);
        assert_eq!(ack.result_reference.as_deref(), Some("555"));

        let ack: CommandAck =
            serde_json::from_str(r#"{"commandId":"c1","status":"failure","error":"no money"}"#).unwrap();
        assert_eq!(ack.status, AckStatus::Failure);
    }

    #[test]
    fn test_bad_items_are_dropped_not_fatal() {
        let hb: Heartbeat = serde_json::from_str(
            r#"{
                "balance": 500.0,
                "openPositions": [
                    {"ticket": 100, "symbol": "EURUSD", "side": "BUY", "volume": 1.0},
                    {"ticket": 101, "symbol": "EURUSD", "side": "BUY_LIMIT", "volume": 1.0},
                    {"ticket": "x", "symbol": "EURUSD"}
                ],
                "executedCommandAcks": [{"status": "success"}]
            }"#,
        )
        .unwrap();

        assert_eq!(hb.open_positions.len(), 1);
        assert_eq!(hb.open_positions[0].ticket, 100);
        assert_eq!(hb.unreadable_tickets, vec![101]);
        assert!(hb.executed_command_acks.is_empty());
        assert_eq!(hb.rejected.len(), 3);
        assert!(hb.rejected[0].starts_with("Validation error: position item 1"));
    }
}
