//! Trading account model: a terminal that reports heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What part an account plays in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccountRole {
    Leader,
    Follower,
    Standalone,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Leader => "leader",
            AccountRole::Follower => "follower",
            AccountRole::Standalone => "standalone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "leader" | "master" => Some(Self::Leader),
            "follower" | "slave" => Some(Self::Follower),
            "standalone" => Some(Self::Standalone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
        }
    }
}

/// Registered trading account.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TradingAccount {
    pub id: String,
    pub name: String,
    pub role: AccountRole,
    pub status: ConnectionStatus,

    /// Last reported balance, equity and margin
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,

    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TradingAccount {
    pub fn is_leader(&self) -> bool {
        self.role == AccountRole::Leader
    }

    pub fn is_online(&self) -> bool {
        self.status == ConnectionStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(AccountRole::parse("Leader"), Some(AccountRole::Leader));
        assert_eq!(AccountRole::parse("slave"), Some(AccountRole::Follower));
        assert_eq!(AccountRole::parse("observer"), None);
    }
}
