//! CopyLink model: one leader → follower replication relationship.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How follower volume is derived from leader volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SizingMode {
    /// `volume × k`
    FixedMultiplier,
    /// `volume × (followerBalance × k%) / leaderBalance`
    PercentOfBalance,
    /// `followerBalance / leaderBalance × volume × k`
    BalanceRatio,
}

impl SizingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizingMode::FixedMultiplier => "fixed_multiplier",
            SizingMode::PercentOfBalance => "percent_of_balance",
            SizingMode::BalanceRatio => "balance_ratio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fixed" | "fixed_multiplier" | "multiplier" => Some(Self::FixedMultiplier),
            "percent" | "percent_of_balance" => Some(Self::PercentOfBalance),
            "ratio" | "balance_ratio" => Some(Self::BalanceRatio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Paused,
    Disabled,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Paused => "paused",
            LinkStatus::Disabled => "disabled",
        }
    }
}

/// Configured replication relationship and its copy parameters.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CopyLink {
    pub id: String,
    pub leader_id: String,
    pub follower_id: String,
    pub sizing_mode: SizingMode,

    /// The `k` factor of the sizing mode
    pub multiplier: f64,

    /// Comma-separated symbols; empty means every symbol
    pub include_symbols: String,

    /// Comma-separated symbols never copied
    pub exclude_symbols: String,

    /// Relative link priority (0-3), raises Open command priority
    pub priority: i64,

    pub status: LinkStatus,
    pub created_at: DateTime<Utc>,
}

fn split_symbols(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl CopyLink {
    /// Apply the include/exclude filters. Exclusion wins over inclusion.
    pub fn accepts_symbol(&self, symbol: &str) -> bool {
        if split_symbols(&self.exclude_symbols).any(|s| s.eq_ignore_ascii_case(symbol)) {
            return false;
        }

        let mut includes = split_symbols(&self.include_symbols).peekable();
        if includes.peek().is_none() {
            return true;
        }
        includes.any(|s| s.eq_ignore_ascii_case(symbol))
    }

    /// Magic number the follower terminal stamps on copied orders.
    ///
    /// Derived from the link id so it is stable across restarts and hosts.
    pub fn magic_number(&self) -> i64 {
        magic_for_link(&self.id)
    }
}

pub(crate) fn magic_for_link(link_id: &str) -> i64 {
    let digest = Sha256::digest(link_id.as_bytes());
    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    // Terminals store magic as a signed 32-bit int
    i64::from(word & 0x7FFF_FFFF)
}
