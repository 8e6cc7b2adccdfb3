//! Position model: one ticket on one account, as mirrored in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, ReplicationResult};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "lowercase")]
pub enum PositionSide {
    #[serde(alias = "buy")]
    Buy,
    #[serde(alias = "sell")]
    Sell,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Buy => "BUY",
            PositionSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Ledger row for a position.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: i64,
    pub account_id: String,
    pub ticket: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub open_price: f64,

    /// Normalized stop-loss (0 when unset)
    pub stop_loss: f64,

    /// Normalized take-profit (0 when unset)
    pub take_profit: f64,

    pub status: PositionStatus,

    /// Bumped on every detected stop-loss/take-profit change
    pub revision: i64,

    /// Leader ticket this follower position was copied from
    pub leader_ticket_ref: Option<i64>,

    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn stops(&self) -> StopLevels {
        StopLevels {
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }
}

/// One item of a heartbeat's position snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPosition {
    pub ticket: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    #[serde(default)]
    pub open_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

impl SnapshotPosition {
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.ticket <= 0 {
            return Err(ReplicationError::Validation(format!(
                "ticket must be positive, got {}",
                self.ticket
            )));
        }
        if self.symbol.trim().is_empty() {
            return Err(ReplicationError::Validation(format!(
                "ticket {} has an empty symbol",
                self.ticket
            )));
        }
        if !self.volume.is_finite() || self.volume <= 0.0 {
            return Err(ReplicationError::Validation(format!(
                "ticket {} has invalid volume {}",
                self.ticket, self.volume
            )));
        }
        Ok(())
    }

    pub fn stops(&self) -> StopLevels {
        StopLevels::normalized(self.stop_loss, self.take_profit)
    }
}

/// Collapse a raw price level: null, NaN and non-positive become 0,
/// anything else is rounded to 5 decimal places.
pub fn normalize_price(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => (v * 100_000.0).round() / 100_000.0,
        _ => 0.0,
    }
}

/// Normalized stop-loss / take-profit pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl StopLevels {
    pub fn normalized(stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        Self {
            stop_loss: normalize_price(stop_loss),
            take_profit: normalize_price(take_profit),
        }
    }

    /// Compare in integer points so float representation noise is ignored.
    pub fn differs_from(&self, other: &StopLevels) -> bool {
        to_points(self.stop_loss) != to_points(other.stop_loss)
            || to_points(self.take_profit) != to_points(other.take_profit)
    }
}

fn to_points(price: f64) -> i64 {
    (price * 100_000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn make_item(ticket: i64, volume: f64) -> SnapshotPosition {
        SnapshotPosition {
            ticket,
            symbol: "EURUSD".to_string(),
            side: PositionSide::Buy,
            volume,
            open_price: 1.1,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[test]
    fn test_normalize_price() {
        assert_eq!(normalize_price(None), 0.0);
        assert_eq!(normalize_price(Some(f64::NAN)), 0.0);
        assert_eq!(normalize_price(Some(-1.0)), 0.0);
        assert_eq!(normalize_price(Some(0.0)), 0.0);
        assert_eq!(normalize_price(Some(1.234567)), 1.23457);
        assert_eq!(normalize_price(Some(1.2)), 1.2);
    }

    #[test]
    fn test_stop_levels_ignore_float_noise() {
        let a = StopLevels::normalized(Some(1.2000000001), Some(1.3));
        let b = StopLevels::normalized(Some(1.2), Some(1.29999999));
        assert!(!a.differs_from(&b));

        let c = StopLevels::normalized(Some(1.2050), Some(1.3));
        assert!(a.differs_from(&c));
    }

    #[test]
    fn test_snapshot_validation() {
        assert_ok!(make_item(100, 1.0).validate());
        assert_err!(make_item(0, 1.0).validate());
        assert_err!(make_item(100, 0.0).validate());
        assert_err!(make_item(100, f64::NAN).validate());

        let mut blank = make_item(100, 1.0);
        blank.symbol = "  ".to_string();
        assert_err!(blank.validate());
    }

    #[test]
    fn test_snapshot_deserialize() {
        let item: SnapshotPosition = serde_json::from_str(
            r#"{"ticket":100,"symbol":"EURUSD","side":"buy","volume":1.0,"stopLoss":1.2}"#,
        )
        .unwrap();
        assert_eq!(item.side, PositionSide::Buy);
        assert_eq!(item.stop_loss, Some(1.2));
        assert_eq!(item.take_profit, None);
    }
}
