//! Durable store for the replication pipeline.
//!
//! Holds everything the pipeline must survive a restart with:
//! - Trading accounts and their last reported balances
//! - Copy links (leader → follower relationships)
//! - The position ledger mirroring every terminal's tickets
//! - Change signals and the follower command queue
//! - Guard rules and their trip state

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    AccountRole, ChangeSignal, Command, CommandStatus, CopyLink, LinkStatus, NewCommand,
    Position, PositionSide, SignalEvent, SignalStatus, SizingMode, SnapshotPosition, StopLevels,
    TradingAccount,
};

/// Database connection pool with full state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Guard rule configuration and trip state for one account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GuardRule {
    pub account_id: String,
    pub equity_stop: Option<f64>,
    pub daily_loss_limit: Option<f64>,
    pub max_open_trades: Option<i64>,
    pub day_start_balance: f64,
    pub day_start_date: Option<String>,
    pub tripped_reason: Option<String>,
    pub trip_epoch: i64,
    pub tripped_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `:memory:` is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'offline',
                balance REAL NOT NULL DEFAULT 0,
                equity REAL NOT NULL DEFAULT 0,
                margin REAL NOT NULL DEFAULT 0,
                last_heartbeat_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_links (
                id TEXT PRIMARY KEY,
                leader_id TEXT NOT NULL,
                follower_id TEXT NOT NULL,
                sizing_mode TEXT NOT NULL,
                multiplier REAL NOT NULL DEFAULT 1.0,
                include_symbols TEXT NOT NULL DEFAULT '',
                exclude_symbols TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                UNIQUE(leader_id, follower_id),
                FOREIGN KEY (leader_id) REFERENCES accounts(id),
                FOREIGN KEY (follower_id) REFERENCES accounts(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Position ledger
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                ticket INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume REAL NOT NULL,
                open_price REAL NOT NULL DEFAULT 0,
                stop_loss REAL NOT NULL DEFAULT 0,
                take_profit REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'open',
                revision INTEGER NOT NULL DEFAULT 0,
                leader_ticket_ref INTEGER,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(account_id, ticket)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_signals (
                id TEXT PRIMARY KEY,
                leader_id TEXT NOT NULL,
                ticket INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume REAL NOT NULL,
                stop_loss REAL NOT NULL DEFAULT 0,
                take_profit REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                commands_generated INTEGER NOT NULL DEFAULT 0,
                commands_executed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                processed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Follower command queue
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                target_account_id TEXT NOT NULL,
                link_id TEXT,
                command_type TEXT NOT NULL,
                symbol TEXT,
                volume REAL,
                stop_loss REAL,
                take_profit REAL,
                magic INTEGER,
                leader_ticket_ref INTEGER,
                priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 10),
                status TEXT NOT NULL DEFAULT 'pending',
                source_signal_id TEXT,
                idempotency_key TEXT NOT NULL,
                result_reference TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                sent_at TEXT,
                completed_at TEXT,
                expires_at TEXT NOT NULL,
                UNIQUE(idempotency_key, target_account_id),
                FOREIGN KEY (source_signal_id) REFERENCES change_signals(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guard_rules (
                account_id TEXT PRIMARY KEY,
                equity_stop REAL,
                daily_loss_limit REAL,
                max_open_trades INTEGER,
                day_start_balance REAL NOT NULL DEFAULT 0,
                day_start_date TEXT,
                tripped_reason TEXT,
                trip_epoch INTEGER NOT NULL DEFAULT 0,
                tripped_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_account_status ON positions(account_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_ticket ON change_signals(leader_id, ticket, event_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_status ON change_signals(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_commands_queue ON commands(target_account_id, status, priority)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_commands_signal ON commands(source_signal_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_leader ON copy_links(leader_id, status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Accounts ====================

    /// Register an account or update its name and role.
    pub async fn save_account(&self, id: &str, name: &str, role: AccountRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, name, role, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(NULLIF(excluded.name, ''), accounts.name),
                role = excluded.role
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(role)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<TradingAccount>> {
        sqlx::query_as::<_, TradingAccount>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account")
    }

    pub async fn list_accounts(&self) -> Result<Vec<TradingAccount>> {
        sqlx::query_as::<_, TradingAccount>("SELECT * FROM accounts ORDER BY role, id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch accounts")
    }

    /// Store balances from a heartbeat and mark the account online.
    pub async fn record_heartbeat(
        &self,
        id: &str,
        balance: f64,
        equity: f64,
        margin: f64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                balance = ?,
                equity = ?,
                margin = ?,
                status = 'online',
                last_heartbeat_at = ?
            WHERE id = ?
            "#,
        )
        .bind(balance)
        .bind(equity)
        .bind(margin)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip online accounts that have been silent since `cutoff` to offline.
    pub async fn mark_stale_accounts_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE accounts SET status = 'offline'
            WHERE status = 'online'
              AND (last_heartbeat_at IS NULL OR julianday(last_heartbeat_at) < julianday(?))
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ==================== Copy Links ====================

    /// Create or reconfigure the link between a leader and a follower.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_link(
        &self,
        leader_id: &str,
        follower_id: &str,
        sizing_mode: SizingMode,
        multiplier: f64,
        include_symbols: &str,
        exclude_symbols: &str,
        priority: i64,
    ) -> Result<CopyLink> {
        sqlx::query_as::<_, CopyLink>(
            r#"
            INSERT INTO copy_links (
                id, leader_id, follower_id, sizing_mode, multiplier,
                include_symbols, exclude_symbols, priority, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
            ON CONFLICT(leader_id, follower_id) DO UPDATE SET
                sizing_mode = excluded.sizing_mode,
                multiplier = excluded.multiplier,
                include_symbols = excluded.include_symbols,
                exclude_symbols = excluded.exclude_symbols,
                priority = excluded.priority
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(leader_id)
        .bind(follower_id)
        .bind(sizing_mode)
        .bind(multiplier)
        .bind(include_symbols)
        .bind(exclude_symbols)
        .bind(priority)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to save copy link")
    }

    /// Active links for a leader, highest link priority first.
    pub async fn get_active_links_for_leader(&self, leader_id: &str) -> Result<Vec<CopyLink>> {
        sqlx::query_as::<_, CopyLink>(
            "SELECT * FROM copy_links WHERE leader_id = ? AND status = 'active' ORDER BY priority DESC, created_at",
        )
        .bind(leader_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch copy links")
    }

    pub async fn list_links(&self) -> Result<Vec<CopyLink>> {
        sqlx::query_as::<_, CopyLink>("SELECT * FROM copy_links ORDER BY leader_id, priority DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch copy links")
    }

    pub async fn set_link_status(&self, link_id: &str, status: LinkStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE copy_links SET status = ? WHERE id = ?")
            .bind(status)
            .bind(link_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move every `from` link feeding a follower to `to`. Disabled links are never touched.
    pub async fn set_follower_links_status(
        &self,
        follower_id: &str,
        from: LinkStatus,
        to: LinkStatus,
    ) -> Result<u64> {
        let result = sqlx::query("UPDATE copy_links SET status = ? WHERE follower_id = ? AND status = ?")
            .bind(to)
            .bind(follower_id)
            .bind(from)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ==================== Position Ledger ====================

    #[cfg(test)]
    pub async fn get_open_tickets(&self, account_id: &str) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT ticket FROM positions WHERE account_id = ? AND status = 'open'")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    pub async fn get_open_positions(&self, account_id: &str) -> Result<Vec<Position>> {
        sqlx::query_as::<_, Position>(
            "SELECT * FROM positions WHERE account_id = ? AND status = 'open' ORDER BY ticket",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")
    }

    /// Ledger row for a ticket in any status.
    pub async fn get_position(&self, account_id: &str, ticket: i64) -> Result<Option<Position>> {
        sqlx::query_as::<_, Position>("SELECT * FROM positions WHERE account_id = ? AND ticket = ?")
            .bind(account_id)
            .bind(ticket)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch position")
    }

    /// Record a first sighting. Returns false if the ticket is already known.
    pub async fn insert_position(
        &self,
        account_id: &str,
        item: &SnapshotPosition,
        leader_ticket_ref: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let stops = item.stops();
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                account_id, ticket, symbol, side, volume, open_price,
                stop_loss, take_profit, status, leader_ticket_ref, opened_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, ?)
            ON CONFLICT(account_id, ticket) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(item.ticket)
        .bind(&item.symbol)
        .bind(item.side)
        .bind(item.volume)
        .bind(item.open_price)
        .bind(stops.stop_loss)
        .bind(stops.take_profit)
        .bind(leader_ticket_ref)
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip an open row to closed. Returns the row only for the caller that flipped it.
    pub async fn close_position(
        &self,
        account_id: &str,
        ticket: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Position>> {
        sqlx::query_as::<_, Position>(
            r#"
            UPDATE positions SET status = 'closed', closed_at = ?, updated_at = ?
            WHERE account_id = ? AND ticket = ? AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(account_id)
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to close position")
    }

    pub async fn update_position_volume(
        &self,
        account_id: &str,
        ticket: i64,
        volume: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET volume = ?, updated_at = ? WHERE account_id = ? AND ticket = ? AND status = 'open'",
        )
        .bind(volume)
        .bind(at)
        .bind(account_id)
        .bind(ticket)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store new stop levels and bump the revision. Returns the new revision.
    pub async fn apply_stop_change(
        &self,
        account_id: &str,
        ticket: i64,
        stops: StopLevels,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE positions SET
                stop_loss = ?,
                take_profit = ?,
                revision = revision + 1,
                updated_at = ?
            WHERE account_id = ? AND ticket = ? AND status = 'open'
            RETURNING revision
            "#,
        )
        .bind(stops.stop_loss)
        .bind(stops.take_profit)
        .bind(at)
        .bind(account_id)
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(r,)| r))
    }

    /// Tag an already-mirrored follower position with the leader ticket it copies.
    pub async fn set_leader_ticket_ref(&self, account_id: &str, ticket: i64, leader_ticket_ref: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE positions SET leader_ticket_ref = ? WHERE account_id = ? AND ticket = ? AND leader_ticket_ref IS NULL",
        )
        .bind(leader_ticket_ref)
        .bind(account_id)
        .bind(ticket)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_open_positions(&self, account_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM positions WHERE account_id = ? AND status = 'open'")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // ==================== Change Signals ====================

    /// First sighting of a leader ticket: ledger row plus Open signal, atomically.
    ///
    /// Returns `None` when the ledger already knows the ticket (in any status) or
    /// an Open signal or command already exists under its key.
    pub async fn record_open(&self, leader_id: &str, item: &SnapshotPosition) -> Result<Option<ChangeSignal>> {
        let now = Utc::now();
        let stops = item.stops();
        let key = crate::models::idempotency_key(leader_id, item.ticket, SignalEvent::Open, 0);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO positions (
                account_id, ticket, symbol, side, volume, open_price,
                stop_loss, take_profit, status, opened_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?)
            ON CONFLICT(account_id, ticket) DO NOTHING
            "#,
        )
        .bind(leader_id)
        .bind(item.ticket)
        .bind(&item.symbol)
        .bind(item.side)
        .bind(item.volume)
        .bind(item.open_price)
        .bind(stops.stop_loss)
        .bind(stops.take_profit)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM change_signals
            WHERE leader_id = ? AND ticket = ? AND event_type = 'open' AND status != 'superseded'
            UNION ALL
            SELECT 1 FROM commands WHERE idempotency_key = ?
            LIMIT 1
            "#,
        )
        .bind(leader_id)
        .bind(item.ticket)
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            // Keep the ledger row: the trade is real, it just was announced before
            tx.commit().await?;
            return Ok(None);
        }

        let signal = Self::insert_signal_in(
            &mut tx,
            leader_id,
            item.ticket,
            SignalEvent::Open,
            key,
            &item.symbol,
            item.side,
            item.volume,
            stops,
        )
        .await?;

        tx.commit().await?;
        Ok(signal)
    }

    /// Disappearance of a leader ticket: flip the ledger row and emit Close, atomically.
    ///
    /// Returns `None` only when the ledger row is not open.
    pub async fn record_close(&self, leader_id: &str, ticket: i64) -> Result<Option<ChangeSignal>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query_as::<_, Position>(
            r#"
            UPDATE positions SET status = 'closed', closed_at = ?, updated_at = ?
            WHERE account_id = ? AND ticket = ? AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(leader_id)
        .bind(ticket)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(position) = closed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let key = crate::models::idempotency_key(leader_id, ticket, SignalEvent::Close, 0);
        let signal = Self::insert_signal_in(
            &mut tx,
            leader_id,
            ticket,
            SignalEvent::Close,
            key,
            &position.symbol,
            position.side,
            position.volume,
            position.stops(),
        )
        .await?;

        tx.commit().await?;
        Ok(signal)
    }

    /// Stop-level change on an open leader ticket: bump the ledger revision, emit
    /// Modify under that revision, and supersede older Modify signals, atomically.
    pub async fn record_modify(
        &self,
        leader_id: &str,
        ticket: i64,
        stops: StopLevels,
    ) -> Result<Option<ChangeSignal>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Position>(
            r#"
            UPDATE positions SET
                stop_loss = ?,
                take_profit = ?,
                revision = revision + 1,
                updated_at = ?
            WHERE account_id = ? AND ticket = ? AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(stops.stop_loss)
        .bind(stops.take_profit)
        .bind(now)
        .bind(leader_id)
        .bind(ticket)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(position) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        let key = crate::models::idempotency_key(leader_id, ticket, SignalEvent::Modify, position.revision);
        let signal = Self::insert_signal_in(
            &mut tx,
            leader_id,
            ticket,
            SignalEvent::Modify,
            key,
            &position.symbol,
            position.side,
            position.volume,
            stops,
        )
        .await?;

        if let Some(newer) = &signal {
            sqlx::query(
                r#"
                UPDATE change_signals SET status = 'superseded'
                WHERE leader_id = ? AND ticket = ? AND event_type = 'modify'
                  AND status != 'superseded' AND id != ?
                "#,
            )
            .bind(leader_id)
            .bind(ticket)
            .bind(&newer.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(signal)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_signal_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        leader_id: &str,
        ticket: i64,
        event: SignalEvent,
        key: String,
        symbol: &str,
        side: PositionSide,
        volume: f64,
        stops: StopLevels,
    ) -> Result<Option<ChangeSignal>> {
        let signal = sqlx::query_as::<_, ChangeSignal>(
            r#"
            INSERT INTO change_signals (
                id, leader_id, ticket, event_type, idempotency_key,
                symbol, side, volume, stop_loss, take_profit, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(leader_id)
        .bind(ticket)
        .bind(event)
        .bind(key)
        .bind(symbol)
        .bind(side)
        .bind(volume)
        .bind(stops.stop_loss)
        .bind(stops.take_profit)
        .bind(Utc::now())
        .fetch_optional(&mut **tx)
        .await?;

        Ok(signal)
    }

    pub async fn get_signal(&self, id: &str) -> Result<Option<ChangeSignal>> {
        sqlx::query_as::<_, ChangeSignal>("SELECT * FROM change_signals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch change signal")
    }

    /// Whether a signal was ever recorded under this idempotency key.
    pub async fn has_signal_for_key(&self, key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM change_signals WHERE idempotency_key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    #[cfg(test)]
    pub async fn get_signals_for_ticket(&self, leader_id: &str, ticket: i64) -> Result<Vec<ChangeSignal>> {
        sqlx::query_as::<_, ChangeSignal>(
            "SELECT * FROM change_signals WHERE leader_id = ? AND ticket = ? ORDER BY created_at",
        )
        .bind(leader_id)
        .bind(ticket)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch change signals")
    }

    /// Close out a pending signal. Superseded signals keep their status.
    pub async fn mark_signal_processed(&self, id: &str, commands_generated: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE change_signals SET
                status = CASE WHEN status = 'pending' THEN 'processed' ELSE status END,
                commands_generated = commands_generated + ?,
                processed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(commands_generated)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_signal_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE change_signals SET status = 'failed', error_message = ?, processed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_signal_error(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE change_signals SET error_message = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn increment_signal_executed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE change_signals SET commands_executed = commands_executed + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Signals still pending since before `cutoff`.
    pub async fn get_stale_pending_signals(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChangeSignal>> {
        sqlx::query_as::<_, ChangeSignal>(
            r#"
            SELECT * FROM change_signals
            WHERE status = 'pending' AND julianday(created_at) < julianday(?)
            ORDER BY created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending signals")
    }

    pub async fn signal_counts(&self) -> Result<Vec<(SignalStatus, i64)>> {
        sqlx::query_as("SELECT status, COUNT(*) FROM change_signals GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await
            .context("Failed to count change signals")
    }

    // ==================== Commands ====================

    /// Enqueue a command. `None` means one already exists for this key and target.
    pub async fn insert_command(&self, cmd: &NewCommand) -> Result<Option<Command>> {
        let now = Utc::now();

        sqlx::query_as::<_, Command>(
            r#"
            INSERT INTO commands (
                id, target_account_id, link_id, command_type, symbol, volume,
                stop_loss, take_profit, magic, leader_ticket_ref, priority, status,
                source_signal_id, idempotency_key, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            ON CONFLICT(idempotency_key, target_account_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&cmd.target_account_id)
        .bind(&cmd.link_id)
        .bind(cmd.command_type)
        .bind(&cmd.symbol)
        .bind(cmd.volume)
        .bind(cmd.stop_loss)
        .bind(cmd.take_profit)
        .bind(cmd.magic)
        .bind(cmd.leader_ticket_ref)
        .bind(cmd.priority)
        .bind(&cmd.source_signal_id)
        .bind(&cmd.idempotency_key)
        .bind(now)
        .bind(now + cmd.ttl)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert command")
    }

    pub async fn get_command(&self, id: &str) -> Result<Option<Command>> {
        sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch command")
    }

    #[cfg(test)]
    pub async fn get_commands_for_signal(&self, signal_id: &str) -> Result<Vec<Command>> {
        sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE source_signal_id = ? ORDER BY seq")
            .bind(signal_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch commands")
    }

    /// Whether any command was generated under this idempotency key.
    pub async fn has_commands_for_key(&self, key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM commands WHERE idempotency_key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// Whether a Close for this leader ticket is already queued or in flight.
    pub async fn has_live_close_command(&self, target_account_id: &str, leader_ticket_ref: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM commands
            WHERE target_account_id = ? AND leader_ticket_ref = ?
              AND command_type = 'close' AND status IN ('pending', 'sent')
            LIMIT 1
            "#,
        )
        .bind(target_account_id)
        .bind(leader_ticket_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Dispatchable commands for a follower in priority-then-FIFO order.
    ///
    /// Excludes expired rows and Modify commands whose signal was superseded.
    pub async fn get_dispatchable_commands(
        &self,
        target_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Command>> {
        sqlx::query_as::<_, Command>(
            r#"
            SELECT c.* FROM commands c
            LEFT JOIN change_signals s ON s.id = c.source_signal_id
            WHERE c.target_account_id = ?
              AND c.status = 'pending'
              AND julianday(c.expires_at) > julianday(?)
              AND NOT (c.command_type = 'modify' AND COALESCE(s.status, '') = 'superseded')
            ORDER BY c.priority DESC, c.seq ASC
            "#,
        )
        .bind(target_account_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending commands")
    }

    /// Pending → Sent. Returns the row only if this call made the transition.
    pub async fn mark_command_sent(&self, id: &str, at: DateTime<Utc>) -> Result<Option<Command>> {
        sqlx::query_as::<_, Command>(
            "UPDATE commands SET status = 'sent', sent_at = ? WHERE id = ? AND status = 'pending' RETURNING *",
        )
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark command sent")
    }

    /// Sent → Executed/Failed. Returns the row only if this call made the transition.
    pub async fn complete_command(
        &self,
        id: &str,
        target_account_id: &str,
        status: CommandStatus,
        result_reference: Option<&str>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Command>> {
        sqlx::query_as::<_, Command>(
            r#"
            UPDATE commands SET
                status = ?,
                result_reference = ?,
                error_message = ?,
                completed_at = ?
            WHERE id = ? AND target_account_id = ? AND status = 'sent'
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(result_reference)
        .bind(error)
        .bind(at)
        .bind(id)
        .bind(target_account_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to complete command")
    }

    /// Pending → Expired for rows past their TTL. Sent rows are never touched.
    pub async fn expire_commands(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE commands SET status = 'expired', completed_at = ?
            WHERE status = 'pending' AND julianday(expires_at) <= julianday(?)
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn command_counts(&self) -> Result<Vec<(CommandStatus, i64)>> {
        sqlx::query_as("SELECT status, COUNT(*) FROM commands GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await
            .context("Failed to count commands")
    }

    // ==================== Guard Rules ====================

    pub async fn save_guard_rule(
        &self,
        account_id: &str,
        equity_stop: Option<f64>,
        daily_loss_limit: Option<f64>,
        max_open_trades: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO guard_rules (account_id, equity_stop, daily_loss_limit, max_open_trades)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                equity_stop = excluded.equity_stop,
                daily_loss_limit = excluded.daily_loss_limit,
                max_open_trades = excluded.max_open_trades
            "#,
        )
        .bind(account_id)
        .bind(equity_stop)
        .bind(daily_loss_limit)
        .bind(max_open_trades)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_guard_rule(&self, account_id: &str) -> Result<Option<GuardRule>> {
        sqlx::query_as::<_, GuardRule>("SELECT * FROM guard_rules WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch guard rule")
    }

    /// Start a new trading day with the given baseline balance.
    pub async fn roll_guard_day(&self, account_id: &str, date: &str, balance: f64) -> Result<()> {
        sqlx::query("UPDATE guard_rules SET day_start_date = ?, day_start_balance = ? WHERE account_id = ?")
            .bind(date)
            .bind(balance)
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Trip an untripped guard. Returns the new trip epoch, or `None` if already tripped.
    pub async fn trip_guard(&self, account_id: &str, reason: &str, at: DateTime<Utc>) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE guard_rules SET
                tripped_reason = ?,
                trip_epoch = trip_epoch + 1,
                tripped_at = ?
            WHERE account_id = ? AND tripped_reason IS NULL
            RETURNING trip_epoch
            "#,
        )
        .bind(reason)
        .bind(at)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(e,)| e))
    }

    /// Clear a tripped guard. Returns the cleared trip epoch, or `None` if it was not tripped.
    pub async fn clear_guard(&self, account_id: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE guard_rules SET tripped_reason = NULL, tripped_at = NULL
            WHERE account_id = ? AND tripped_reason IS NOT NULL
            RETURNING trip_epoch
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(e,)| e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandType, PositionStatus};
    use chrono::Duration;

    async fn make_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn make_item(ticket: i64) -> SnapshotPosition {
        SnapshotPosition {
            ticket,
            symbol: "EURUSD".to_string(),
            side: PositionSide::Buy,
            volume: 1.0,
            open_price: 1.1,
            stop_loss: Some(1.05),
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_position_closes_exactly_once() {
        let db = make_db().await;
        let now = Utc::now();

        assert!(db.insert_position("L1", &make_item(100), None, now).await.unwrap());
        assert!(!db.insert_position("L1", &make_item(100), None, now).await.unwrap());

        let closed = db.close_position("L1", 100, now).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.closed_at.is_some());

        assert!(db.close_position("L1", 100, now).await.unwrap().is_none());
        assert!(db.get_open_tickets("L1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_change_bumps_revision() {
        let db = make_db().await;
        let now = Utc::now();
        db.insert_position("L1", &make_item(7), None, now).await.unwrap();

        let stops = StopLevels::normalized(Some(1.06), Some(1.2));
        assert_eq!(db.apply_stop_change("L1", 7, stops, now).await.unwrap(), Some(1));
        assert_eq!(db.apply_stop_change("L1", 7, stops, now).await.unwrap(), Some(2));

        let pos = db.get_position("L1", 7).await.unwrap().unwrap();
        assert_eq!(pos.stop_loss, 1.06);
        assert_eq!(pos.take_profit, 1.2);
    }

    #[tokio::test]
    async fn test_open_is_announced_once() {
        let db = make_db().await;

        let first = db.record_open("L1", &make_item(100)).await.unwrap().unwrap();
        assert_eq!(first.idempotency_key, "L1:100:OPEN:0");
        assert!(db.record_open("L1", &make_item(100)).await.unwrap().is_none());

        // A closed ticket never reopens under the same key
        let close = db.record_close("L1", 100).await.unwrap().unwrap();
        assert_eq!(close.idempotency_key, "L1:100:CLOSE:0");
        assert!(db.record_close("L1", 100).await.unwrap().is_none());
        assert!(db.record_open("L1", &make_item(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_modify_supersedes_older() {
        let db = make_db().await;
        db.record_open("L1", &make_item(7)).await.unwrap();

        let first = db
            .record_modify("L1", 7, StopLevels::normalized(Some(1.06), None))
            .await
            .unwrap()
            .unwrap();
        let second = db
            .record_modify("L1", 7, StopLevels::normalized(Some(1.07), None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.idempotency_key, "L1:7:MODIFY:2");

        let first = db.get_signal(&first.id).await.unwrap().unwrap();
        assert_eq!(first.status, SignalStatus::Superseded);
        assert_eq!(db.get_signal(&second.id).await.unwrap().unwrap().status, SignalStatus::Pending);

        // No Modify for a closed ticket
        db.record_close("L1", 7).await.unwrap();
        assert!(db
            .record_modify("L1", 7, StopLevels::normalized(Some(1.08), None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_command_lifecycle() {
        let db = make_db().await;
        let cmd = NewCommand::guard("F1", CommandType::PauseCopy, "guard:F1:test:1".to_string(), Duration::hours(24));

        let stored = db.insert_command(&cmd).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Pending);
        assert!(db.insert_command(&cmd).await.unwrap().is_none());

        // Acks are only accepted for sent commands
        let early = db
            .complete_command(&stored.id, "F1", CommandStatus::Executed, None, None, Utc::now())
            .await
            .unwrap();
        assert!(early.is_none());

        assert!(db.mark_command_sent(&stored.id, Utc::now()).await.unwrap().is_some());
        assert!(db.mark_command_sent(&stored.id, Utc::now()).await.unwrap().is_none());

        let wrong_account = db
            .complete_command(&stored.id, "F2", CommandStatus::Executed, None, None, Utc::now())
            .await
            .unwrap();
        assert!(wrong_account.is_none());

        let done = db
            .complete_command(&stored.id, "F1", CommandStatus::Executed, Some("555"), None, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, CommandStatus::Executed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_expiry_only_touches_pending() {
        let db = make_db().await;
        let ttl = Duration::seconds(1);

        let pending = db
            .insert_command(&NewCommand::guard("F1", CommandType::PauseCopy, "k1".to_string(), ttl))
            .await
            .unwrap()
            .unwrap();
        let sent = db
            .insert_command(&NewCommand::guard("F1", CommandType::CloseAll, "k2".to_string(), ttl))
            .await
            .unwrap()
            .unwrap();
        db.mark_command_sent(&sent.id, Utc::now()).await.unwrap();

        let expired = db.expire_commands(Utc::now() + Duration::seconds(5)).await.unwrap();
        assert_eq!(expired, 1);

        let pending = db.get_command(&pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, CommandStatus::Expired);
        let sent = db.get_command(&sent.id).await.unwrap().unwrap();
        assert_eq!(sent.status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn test_stale_accounts_go_offline() {
        let db = make_db().await;
        db.save_account("L1", "leader", AccountRole::Leader).await.unwrap();
        db.save_account("F1", "follower", AccountRole::Follower).await.unwrap();

        let now = Utc::now();
        db.record_heartbeat("L1", 1000.0, 1000.0, 0.0, now - Duration::minutes(10)).await.unwrap();
        db.record_heartbeat("F1", 500.0, 500.0, 0.0, now).await.unwrap();

        let offline = db.mark_stale_accounts_offline(now - Duration::seconds(90)).await.unwrap();
        assert_eq!(offline, vec!["L1".to_string()]);
    }
}
