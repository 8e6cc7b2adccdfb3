//! Account guard rules: equity stop, daily loss limit, max open trades.
//!
//! Evaluation is pure ([`GuardEvaluator::evaluate`]); [`RuleEngine`] applies the
//! decision by persisting the trip, pausing copy links, and queueing the
//! control commands in the reserved guard priority band.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{Database, GuardRule};
use crate::models::{CommandType, LinkStatus, NewCommand};

use super::{CommandQueue, ReplicatorConfig};

/// Which limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardBreach {
    EquityStop,
    DailyLoss,
    MaxOpenTrades,
}

impl GuardBreach {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardBreach::EquityStop => "equity_stop",
            GuardBreach::DailyLoss => "daily_loss",
            GuardBreach::MaxOpenTrades => "max_open_trades",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "equity_stop" => Some(Self::EquityStop),
            "daily_loss" => Some(Self::DailyLoss),
            "max_open_trades" => Some(Self::MaxOpenTrades),
            _ => None,
        }
    }

    /// Loss breaches flatten the account; a trade-count breach only pauses it.
    pub fn closes_positions(&self) -> bool {
        !matches!(self, GuardBreach::MaxOpenTrades)
    }
}

/// Account figures a guard is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct GuardInputs {
    pub balance: f64,
    pub equity: f64,
    pub open_trades: i64,
}

/// What the guard should do after one heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardDecision {
    /// New day baseline to store, if the UTC day changed
    pub roll_day: Option<(String, f64)>,
    pub action: GuardAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Hold,
    Trip(GuardBreach),
    Clear,
}

/// Emitted when a guard changes state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardEvent {
    pub account_id: String,
    pub breach: Option<GuardBreach>,
    pub tripped: bool,
    pub trip_epoch: i64,
    pub commands: Vec<String>,
}

pub struct GuardEvaluator;

impl GuardEvaluator {
    pub fn evaluate(rule: &GuardRule, inputs: GuardInputs, now: DateTime<Utc>) -> GuardDecision {
        let today = day_key(now.date_naive());
        let tripped = rule.tripped_reason.as_deref().and_then(GuardBreach::parse);

        let rolled = rule.day_start_date.as_deref() != Some(today.as_str());
        let roll_day = rolled.then(|| (today.clone(), inputs.balance));
        let baseline = if rolled { inputs.balance } else { rule.day_start_balance };

        let action = match tripped {
            // A new day lifts the daily loss stop
            Some(GuardBreach::DailyLoss) if rolled => GuardAction::Clear,
            Some(GuardBreach::MaxOpenTrades) => match rule.max_open_trades {
                Some(limit) if inputs.open_trades <= limit => GuardAction::Clear,
                None => GuardAction::Clear,
                _ => GuardAction::Hold,
            },
            Some(_) => GuardAction::Hold,
            None if rule.tripped_reason.is_some() => GuardAction::Hold,
            None => Self::check_limits(rule, inputs, baseline),
        };

        GuardDecision { roll_day, action }
    }

    fn check_limits(rule: &GuardRule, inputs: GuardInputs, baseline: f64) -> GuardAction {
        // No figures reported yet
        let reported = inputs.balance > 0.0 || inputs.equity > 0.0;

        if reported {
            if let Some(stop) = rule.equity_stop {
                if inputs.equity <= stop {
                    return GuardAction::Trip(GuardBreach::EquityStop);
                }
            }

            if let Some(limit) = rule.daily_loss_limit {
                if baseline > 0.0 && baseline - inputs.equity >= limit {
                    return GuardAction::Trip(GuardBreach::DailyLoss);
                }
            }
        }

        if let Some(limit) = rule.max_open_trades {
            if inputs.open_trades > limit {
                return GuardAction::Trip(GuardBreach::MaxOpenTrades);
            }
        }

        GuardAction::Hold
    }
}

fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Idempotency key of a guard command.
pub fn guard_key(account_id: &str, rule: &str, trip_epoch: i64, command_type: CommandType) -> String {
    format!("guard:{}:{}:{}:{}", account_id, rule, trip_epoch, command_type.as_str())
}

pub struct RuleEngine {
    db: Database,
    queue: std::sync::Arc<CommandQueue>,
    config: ReplicatorConfig,
}

impl RuleEngine {
    pub fn new(db: Database, queue: std::sync::Arc<CommandQueue>, config: ReplicatorConfig) -> Self {
        Self { db, queue, config }
    }

    /// Evaluate an account's guard after its heartbeat was recorded.
    pub async fn evaluate_account(
        &self,
        account_id: &str,
        balance: f64,
        equity: f64,
    ) -> anyhow::Result<Option<GuardEvent>> {
        let Some(rule) = self.db.get_guard_rule(account_id).await? else {
            return Ok(None);
        };

        let open_trades = self.db.count_open_positions(account_id).await?;
        let inputs = GuardInputs { balance, equity, open_trades };
        let decision = GuardEvaluator::evaluate(&rule, inputs, Utc::now());

        if let Some((day, baseline)) = &decision.roll_day {
            self.db.roll_guard_day(account_id, day, *baseline).await?;
            debug!(account = %account_id, day = %day, baseline, "Guard day rolled");
        }

        match decision.action {
            GuardAction::Hold => Ok(None),
            GuardAction::Trip(breach) => self.trip(account_id, breach, inputs).await,
            GuardAction::Clear => {
                info!(account = %account_id, "Guard condition cleared");
                self.clear(account_id).await
            }
        }
    }

    /// Operator reset: clear any trip and resume copying.
    pub async fn reset(&self, account_id: &str) -> anyhow::Result<Option<GuardEvent>> {
        self.clear(account_id).await
    }

    async fn trip(
        &self,
        account_id: &str,
        breach: GuardBreach,
        inputs: GuardInputs,
    ) -> anyhow::Result<Option<GuardEvent>> {
        let Some(epoch) = self.db.trip_guard(account_id, breach.as_str(), Utc::now()).await? else {
            return Ok(None);
        };

        warn!(
            account = %account_id,
            rule = breach.as_str(),
            equity = inputs.equity,
            open_trades = inputs.open_trades,
            epoch,
            "Guard tripped"
        );

        let mut commands = Vec::new();
        if breach.closes_positions() {
            commands.push(CommandType::CloseAll);
        }
        commands.push(CommandType::PauseCopy);

        let queued = self.enqueue(account_id, breach.as_str(), epoch, &commands).await?;
        let paused = self
            .db
            .set_follower_links_status(account_id, LinkStatus::Active, LinkStatus::Paused)
            .await?;
        info!(account = %account_id, links = paused, "Copy links paused by guard");

        Ok(Some(GuardEvent {
            account_id: account_id.to_string(),
            breach: Some(breach),
            tripped: true,
            trip_epoch: epoch,
            commands: queued,
        }))
    }

    async fn clear(&self, account_id: &str) -> anyhow::Result<Option<GuardEvent>> {
        let reason = self
            .db
            .get_guard_rule(account_id)
            .await?
            .and_then(|r| r.tripped_reason)
            .unwrap_or_else(|| "manual".to_string());

        let Some(epoch) = self.db.clear_guard(account_id).await? else {
            return Ok(None);
        };

        let queued = self
            .enqueue(account_id, &reason, epoch, &[CommandType::ResumeCopy])
            .await?;
        let resumed = self
            .db
            .set_follower_links_status(account_id, LinkStatus::Paused, LinkStatus::Active)
            .await?;
        info!(account = %account_id, rule = %reason, links = resumed, "Guard cleared, copying resumed");

        Ok(Some(GuardEvent {
            account_id: account_id.to_string(),
            breach: GuardBreach::parse(&reason),
            tripped: false,
            trip_epoch: epoch,
            commands: queued,
        }))
    }

    async fn enqueue(
        &self,
        account_id: &str,
        rule: &str,
        epoch: i64,
        commands: &[CommandType],
    ) -> anyhow::Result<Vec<String>> {
        let mut queued = Vec::new();
        for &command_type in commands {
            let key = guard_key(account_id, rule, epoch, command_type);
            let cmd = NewCommand::guard(account_id, command_type, key, self.config.command_ttl());
            if let Some(stored) = self.queue.enqueue(&cmd).await? {
                queued.push(stored.id);
            }
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountRole, CommandStatus, SizingMode};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn make_rule() -> GuardRule {
        GuardRule {
            account_id: "F1".to_string(),
            equity_stop: Some(800.0),
            daily_loss_limit: Some(150.0),
            max_open_trades: Some(3),
            day_start_balance: 1_000.0,
            day_start_date: Some("2026-03-02".to_string()),
            tripped_reason: None,
            trip_epoch: 0,
            tripped_at: None,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn inputs(balance: f64, equity: f64, open_trades: i64) -> GuardInputs {
        GuardInputs { balance, equity, open_trades }
    }

    #[test]
    fn test_limits() {
        let rule = make_rule();

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 990.0, 1), at(2, 12));
        assert_eq!(d.action, GuardAction::Hold);
        assert!(d.roll_day.is_none());

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 790.0, 1), at(2, 12));
        assert_eq!(d.action, GuardAction::Trip(GuardBreach::EquityStop));

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 850.0, 1), at(2, 12));
        assert_eq!(d.action, GuardAction::Trip(GuardBreach::DailyLoss));

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 1_000.0, 4), at(2, 12));
        assert_eq!(d.action, GuardAction::Trip(GuardBreach::MaxOpenTrades));
    }

    #[test]
    fn test_empty_heartbeat_does_not_trip() {
        let d = GuardEvaluator::evaluate(&make_rule(), inputs(0.0, 0.0, 0), at(2, 12));
        assert_eq!(d.action, GuardAction::Hold);
    }

    #[test]
    fn test_tripped_guard_is_silent() {
        let mut rule = make_rule();
        rule.tripped_reason = Some("equity_stop".to_string());
        rule.trip_epoch = 1;

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 500.0, 9), at(2, 12));
        assert_eq!(d.action, GuardAction::Hold);
    }

    #[test]
    fn test_day_rollover() {
        let mut rule = make_rule();
        rule.tripped_reason = Some("daily_loss".to_string());

        let d = GuardEvaluator::evaluate(&rule, inputs(900.0, 900.0, 0), at(3, 0));
        assert_eq!(d.roll_day, Some(("2026-03-03".to_string(), 900.0)));
        assert_eq!(d.action, GuardAction::Clear);

        // The new baseline applies immediately
        let rule = make_rule();
        let d = GuardEvaluator::evaluate(&rule, inputs(700.0, 850.0, 0), at(3, 1));
        assert_eq!(d.action, GuardAction::Hold);
    }

    #[test]
    fn test_max_open_trades_auto_clears() {
        let mut rule = make_rule();
        rule.tripped_reason = Some("max_open_trades".to_string());

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 1_000.0, 4), at(2, 12));
        assert_eq!(d.action, GuardAction::Hold);

        let d = GuardEvaluator::evaluate(&rule, inputs(1_000.0, 1_000.0, 3), at(2, 12));
        assert_eq!(d.action, GuardAction::Clear);
    }

    #[test]
    fn test_guard_key() {
        assert_eq!(
            guard_key("F1", "equity_stop", 2, CommandType::CloseAll),
            "guard:F1:equity_stop:2:CLOSE_ALL"
        );
    }

    async fn make_engine() -> (Database, Arc<CommandQueue>, RuleEngine) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let config = ReplicatorConfig::default();
        let queue = Arc::new(CommandQueue::new(db.clone(), config.clone()));
        let engine = RuleEngine::new(db.clone(), queue.clone(), config);

        db.save_account("L1", "leader", AccountRole::Leader).await.unwrap();
        db.save_account("F1", "follower", AccountRole::Follower).await.unwrap();
        db.save_link("L1", "F1", SizingMode::FixedMultiplier, 1.0, "", "", 0).await.unwrap();
        db.save_guard_rule("F1", Some(800.0), None, None).await.unwrap();
        (db, queue, engine)
    }

    #[tokio::test]
    async fn test_equity_stop_trips_once() {
        let (db, queue, engine) = make_engine().await;

        let event = engine.evaluate_account("F1", 1_000.0, 700.0).await.unwrap().unwrap();
        assert!(event.tripped);
        assert_eq!(event.breach, Some(GuardBreach::EquityStop));
        assert_eq!(event.commands.len(), 2);

        let commands = queue.peek("F1", 10).await.unwrap();
        assert_eq!(commands[0].command_type, CommandType::CloseAll);
        assert_eq!(commands[0].priority, 10);
        assert_eq!(commands[1].command_type, CommandType::PauseCopy);
        assert_eq!(commands[1].status, CommandStatus::Pending);

        assert!(db.get_active_links_for_leader("L1").await.unwrap().is_empty());

        // Still breached: nothing more
        assert!(engine.evaluate_account("F1", 1_000.0, 600.0).await.unwrap().is_none());
        assert_eq!(queue.peek("F1", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_resumes_links() {
        let (db, queue, engine) = make_engine().await;
        engine.evaluate_account("F1", 1_000.0, 700.0).await.unwrap();

        let event = engine.reset("F1").await.unwrap().unwrap();
        assert!(!event.tripped);
        assert_eq!(db.get_active_links_for_leader("L1").await.unwrap().len(), 1);

        let commands = queue.peek("F1", 10).await.unwrap();
        assert!(commands.iter().any(|c| c.command_type == CommandType::ResumeCopy));

        // Nothing to reset twice
        assert!(engine.reset("F1").await.unwrap().is_none());
    }
}
