//! Follower lot sizing: fixed multiplier, percent of balance, balance ratio.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::warn;

use crate::models::{CopyLink, SizingMode};

/// Balances the sizing modes need, as last reported by heartbeats.
#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub leader_volume: Decimal,
    pub leader_balance: Decimal,
    pub follower_balance: Decimal,
}

impl SizingInputs {
    pub fn from_f64(leader_volume: f64, leader_balance: f64, follower_balance: f64) -> Self {
        Self {
            leader_volume: Decimal::try_from(leader_volume).unwrap_or(Decimal::ZERO),
            leader_balance: Decimal::try_from(leader_balance).unwrap_or(Decimal::ZERO),
            follower_balance: Decimal::try_from(follower_balance).unwrap_or(Decimal::ZERO),
        }
    }
}

/// Calculator for follower order volume.
pub struct PositionSizer;

impl PositionSizer {
    /// Calculate the follower volume for copying a leader Open.
    ///
    /// Rounded to 2 decimals. Zero means the link must be skipped, which
    /// includes inputs too extreme to size without overflowing.
    pub fn calculate_volume(link: &CopyLink, inputs: SizingInputs) -> Decimal {
        let k = Decimal::try_from(link.multiplier).unwrap_or(Decimal::ZERO);

        let raw = match link.sizing_mode {
            SizingMode::FixedMultiplier => inputs.leader_volume.checked_mul(k),
            SizingMode::PercentOfBalance => Self::balance_scaled(inputs, k / dec!(100)),
            SizingMode::BalanceRatio => Self::balance_scaled(inputs, k),
        };

        let Some(raw) = raw else {
            warn!(
                link_id = %link.id,
                mode = link.sizing_mode.as_str(),
                leader_balance = %inputs.leader_balance,
                follower_balance = %inputs.follower_balance,
                "Sizing overflowed, link skipped"
            );
            return Decimal::ZERO;
        };

        let sized = raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        if sized <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        sized
    }

    /// `followerBalance / leaderBalance × volume × factor`, zero without a leader
    /// balance. `None` on overflow.
    fn balance_scaled(inputs: SizingInputs, factor: Decimal) -> Option<Decimal> {
        if inputs.leader_balance <= Decimal::ZERO || inputs.follower_balance <= Decimal::ZERO {
            return Some(Decimal::ZERO);
        }
        inputs
            .follower_balance
            .checked_div(inputs.leader_balance)?
            .checked_mul(inputs.leader_volume)?
            .checked_mul(factor)
    }

    pub fn to_lots(volume: Decimal) -> f64 {
        volume.to_f64().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinkStatus;
    use chrono::Utc;

    fn make_link(mode: SizingMode, multiplier: f64) -> CopyLink {
        CopyLink {
            id: "link".to_string(),
            leader_id: "L1".to_string(),
            follower_id: "F1".to_string(),
            sizing_mode: mode,
            multiplier,
            include_symbols: String::new(),
            exclude_symbols: String::new(),
            priority: 0,
            status: LinkStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn inputs(volume: Decimal, leader: Decimal, follower: Decimal) -> SizingInputs {
        SizingInputs {
            leader_volume: volume,
            leader_balance: leader,
            follower_balance: follower,
        }
    }

    #[test]
    fn test_fixed_multiplier() {
        let link = make_link(SizingMode::FixedMultiplier, 2.0);
        let size = PositionSizer::calculate_volume(&link, inputs(dec!(1.0), dec!(0), dec!(0)));
        assert_eq!(size, dec!(2.00));
    }

    #[test]
    fn test_balance_ratio() {
        let link = make_link(SizingMode::BalanceRatio, 1.0);

        // Follower half the leader's size
        let size = PositionSizer::calculate_volume(&link, inputs(dec!(1.0), dec!(10000), dec!(5000)));
        assert_eq!(size, dec!(0.50));

        // No leader balance reported yet
        let size = PositionSizer::calculate_volume(&link, inputs(dec!(1.0), dec!(0), dec!(5000)));
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn test_percent_of_balance() {
        let link = make_link(SizingMode::PercentOfBalance, 50.0);
        let size = PositionSizer::calculate_volume(&link, inputs(dec!(2.0), dec!(10000), dec!(10000)));
        assert_eq!(size, dec!(1.00));
    }

    #[test]
    fn test_rounds_to_two_decimals_and_skips_dust() {
        let link = make_link(SizingMode::FixedMultiplier, 0.333);
        let size = PositionSizer::calculate_volume(&link, inputs(dec!(1.0), dec!(0), dec!(0)));
        assert_eq!(size, dec!(0.33));

        let tiny = make_link(SizingMode::FixedMultiplier, 0.001);
        let size = PositionSizer::calculate_volume(&tiny, inputs(dec!(1.0), dec!(0), dec!(0)));
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn test_extreme_balances_size_to_zero() {
        let link = make_link(SizingMode::BalanceRatio, 1.0);
        let huge = Decimal::MAX / dec!(100);

        let size = PositionSizer::calculate_volume(&link, inputs(dec!(100), dec!(0.001), huge));
        assert_eq!(size, Decimal::ZERO);

        let fixed = make_link(SizingMode::FixedMultiplier, 1e6);
        let size = PositionSizer::calculate_volume(&fixed, inputs(Decimal::MAX, dec!(0), dec!(0)));
        assert_eq!(size, Decimal::ZERO);
    }
}
