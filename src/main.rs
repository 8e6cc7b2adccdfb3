//! Trade replication service
//!
//! Watches leader terminals through their heartbeats and turns every position
//! change into idempotent commands that follower terminals pull and acknowledge.

mod api;
mod db;
mod error;
mod models;
mod notify;
mod replication;
mod service;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::db::Database;
use crate::models::{AccountRole, LinkStatus, SizingMode};
use crate::notify::Notifier;
use crate::replication::ReplicatorConfig;
use crate::service::{register_account, Replicator};

/// Leader → follower trade replication CLI.
#[derive(Parser)]
#[command(name = "tradecopy")]
#[command(about = "Replicate leader trading accounts onto follower terminals", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "TRADECOPY_DATABASE", default_value = "sqlite:./tradecopy.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Pipeline tunables, each with an environment fallback.
#[derive(Args)]
struct Settings {
    /// Hours a never-dispatched command stays eligible
    #[arg(long, global = true, env = "TRADECOPY_COMMAND_TTL_HOURS", default_value = "24")]
    command_ttl_hours: i64,

    /// Maximum commands per dispatch pull
    #[arg(long, global = true, env = "TRADECOPY_BATCH_LIMIT", default_value = "50")]
    batch_limit: usize,

    /// Delay before the read-after-write retry (ms)
    #[arg(long, global = true, env = "TRADECOPY_READ_RETRY_MS", default_value = "250")]
    read_retry_ms: u64,

    /// Window after an enqueue in which an empty pull is retried (ms)
    #[arg(long, global = true, env = "TRADECOPY_READ_HINT_MS", default_value = "2000")]
    read_hint_ms: u64,

    /// Maintenance sweep interval in seconds
    #[arg(long, global = true, env = "TRADECOPY_SWEEP_SECS", default_value = "30")]
    sweep_secs: u64,

    /// Heartbeat silence before an account is marked offline (seconds)
    #[arg(long, global = true, env = "TRADECOPY_OFFLINE_SECS", default_value = "90")]
    offline_secs: i64,

    /// Age at which a pending signal is fanned out again (seconds)
    #[arg(long, global = true, env = "TRADECOPY_SIGNAL_RETRY_SECS", default_value = "30")]
    signal_retry_secs: i64,

    /// HTTP listen address
    #[arg(long, global = true, env = "TRADECOPY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Webhook for status events
    #[arg(long, global = true, env = "TRADECOPY_NOTIFY_URL")]
    notify_url: Option<String>,
}

impl From<Settings> for ReplicatorConfig {
    fn from(s: Settings) -> Self {
        Self {
            command_ttl_hours: s.command_ttl_hours,
            dispatch_batch_limit: s.batch_limit,
            read_retry_delay_ms: s.read_retry_ms,
            read_hint_window_ms: s.read_hint_ms,
            sweep_interval_secs: s.sweep_secs,
            offline_after_secs: s.offline_secs,
            pending_signal_retry_secs: s.signal_retry_secs,
            listen_addr: s.listen,
            notify_url: s.notify_url.filter(|u| !u.trim().is_empty()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the terminal endpoint and the maintenance sweep
    Serve,

    /// Manage trading accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Manage leader → follower copy links
    Link {
        #[command(subcommand)]
        action: LinkAction,
    },

    /// Manage per-account guard rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Show a follower's pending commands in dispatch order
    Queue {
        /// Follower account ID
        follower: String,

        /// Maximum commands to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show signal and command counts
    Status,

    /// Run one maintenance sweep
    Sweep,

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Register or rename an account
    Add {
        /// Account ID as reported by the terminal
        id: String,

        /// Role (leader, follower, standalone)
        #[arg(short, long, default_value = "follower")]
        role: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List all accounts
    List,
}

#[derive(Subcommand)]
enum LinkAction {
    /// Create or reconfigure a link
    Add {
        leader: String,
        follower: String,

        /// Sizing mode (fixed_multiplier, percent_of_balance, balance_ratio)
        #[arg(short, long, default_value = "fixed_multiplier")]
        mode: String,

        /// Sizing factor
        #[arg(short, long, default_value = "1.0")]
        factor: f64,

        /// Comma-separated symbols to copy; empty copies all
        #[arg(long, default_value = "")]
        include: String,

        /// Comma-separated symbols never copied
        #[arg(long, default_value = "")]
        exclude: String,

        /// Link priority (0-3)
        #[arg(short, long, default_value = "0")]
        priority: i64,
    },

    /// List all links
    List,

    /// Stop copying on a link
    Pause { link_id: String },

    /// Resume copying on a paused link
    Resume { link_id: String },

    /// Disable a link permanently
    Disable { link_id: String },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Set guard thresholds for an account
    Set {
        account: String,

        /// Equity floor that closes everything
        #[arg(long)]
        equity_stop: Option<f64>,

        /// Maximum loss since the start of the day
        #[arg(long)]
        daily_loss: Option<f64>,

        /// Maximum simultaneously open trades
        #[arg(long)]
        max_open: Option<i64>,
    },

    /// Show guard state for an account
    Show { account: String },

    /// Clear a tripped guard and resume copying
    Reset { account: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config: ReplicatorConfig = cli.settings.into();

    // Initialize database
    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Serve => {
            let addr: SocketAddr = config
                .listen_addr
                .parse()
                .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

            let notifier = Notifier::new(config.notify_url.clone())?;
            let replicator = Arc::new(Replicator::new(db, config, notifier));

            let server = tokio::spawn(api::serve(replicator.clone(), addr));
            replicator.run().await?;
            server.abort();
        }

        Commands::Account { action } => match action {
            AccountAction::Add { id, role, name } => {
                let role = AccountRole::parse(&role).ok_or_else(|| anyhow!("Unknown role: {role}"))?;
                let name = name.unwrap_or_else(|| id.clone());
                register_account(&db, &id, &name, role).await?;
                println!("Account {} registered as {}", id, role.as_str());
            }
            AccountAction::List => {
                let accounts = db.list_accounts().await?;
                if accounts.is_empty() {
                    println!("No accounts. Use 'tradecopy account add <ID>' to register one.");
                    return Ok(());
                }

                println!(
                    "\n{:<20} {:<20} {:<11} {:<8} {:>12} {:>12}  {}",
                    "ID", "Name", "Role", "Status", "Balance", "Equity", "Last Heartbeat"
                );
                println!("{}", "-".repeat(108));
                for a in accounts {
                    println!(
                        "{:<20} {:<20} {:<11} {:<8} {:>12.2} {:>12.2}  {}",
                        truncate(&a.id, 20),
                        truncate(&a.name, 20),
                        a.role.as_str(),
                        a.status.as_str(),
                        a.balance,
                        a.equity,
                        a.last_heartbeat_at
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "never".to_string())
                    );
                }
            }
        },

        Commands::Link { action } => match action {
            LinkAction::Add {
                leader,
                follower,
                mode,
                factor,
                include,
                exclude,
                priority,
            } => {
                let mode = SizingMode::parse(&mode).ok_or_else(|| anyhow!("Unknown sizing mode: {mode}"))?;
                for id in [&leader, &follower] {
                    if db.get_account(id).await?.is_none() {
                        return Err(anyhow!("Account {id} is not registered"));
                    }
                }

                let link = db
                    .save_link(&leader, &follower, mode, factor, &include, &exclude, priority.clamp(0, 3))
                    .await?;
                info!(link = %link.id, leader = %leader, follower = %follower, "Copy link saved");
                println!("Link {} saved: {} -> {} ({} x{})", link.id, leader, follower, mode.as_str(), factor);
            }
            LinkAction::List => {
                let links = db.list_links().await?;
                if links.is_empty() {
                    println!("No copy links configured.");
                    return Ok(());
                }

                println!(
                    "\n{:<36} {:<16} {:<16} {:<18} {:>8} {:>4} {:<9}",
                    "ID", "Leader", "Follower", "Sizing", "Factor", "Pri", "Status"
                );
                println!("{}", "-".repeat(113));
                for l in links {
                    println!(
                        "{:<36} {:<16} {:<16} {:<18} {:>8.2} {:>4} {:<9}",
                        l.id,
                        truncate(&l.leader_id, 16),
                        truncate(&l.follower_id, 16),
                        l.sizing_mode.as_str(),
                        l.multiplier,
                        l.priority,
                        l.status.as_str()
                    );
                }
            }
            LinkAction::Pause { link_id } => set_link_status(&db, &link_id, LinkStatus::Paused).await?,
            LinkAction::Resume { link_id } => set_link_status(&db, &link_id, LinkStatus::Active).await?,
            LinkAction::Disable { link_id } => set_link_status(&db, &link_id, LinkStatus::Disabled).await?,
        },

        Commands::Rules { action } => match action {
            RulesAction::Set {
                account,
                equity_stop,
                daily_loss,
                max_open,
            } => {
                if db.get_account(&account).await?.is_none() {
                    return Err(anyhow!("Account {account} is not registered"));
                }
                db.save_guard_rule(&account, equity_stop, daily_loss, max_open).await?;
                println!("Guard rules saved for {}", account);
            }
            RulesAction::Show { account } => {
                let Some(rule) = db.get_guard_rule(&account).await? else {
                    println!("No guard rules for {}", account);
                    return Ok(());
                };

                println!("\n=== Guard Rules: {} ===\n", account);
                println!("Equity stop:       {}", fmt_limit(rule.equity_stop));
                println!("Daily loss limit:  {}", fmt_limit(rule.daily_loss_limit));
                println!(
                    "Max open trades:   {}",
                    rule.max_open_trades.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
                );
                println!(
                    "Day start:         {} ({:.2})",
                    rule.day_start_date.as_deref().unwrap_or("-"),
                    rule.day_start_balance
                );
                match (&rule.tripped_reason, rule.tripped_at) {
                    (Some(reason), Some(at)) => {
                        println!("State:             TRIPPED ({}) at {}", reason, at.format("%Y-%m-%d %H:%M:%S"))
                    }
                    _ => println!("State:             armed"),
                }
                println!("Trip epoch:        {}", rule.trip_epoch);
            }
            RulesAction::Reset { account } => {
                let replicator = Replicator::new(db, config, Notifier::disabled());
                match replicator.reset_guard(&account).await? {
                    Some(event) => println!(
                        "Guard cleared for {} ({} resume command(s) queued)",
                        account,
                        event.commands.len()
                    ),
                    None => println!("No tripped guard for {}", account),
                }
            }
        },

        Commands::Queue { follower, limit } => {
            let replicator = Replicator::new(db, config, Notifier::disabled());
            let commands = replicator.queue().peek(&follower, limit).await?;
            if commands.is_empty() {
                println!("No pending commands for {}", follower);
                return Ok(());
            }

            println!(
                "\n{:<36} {:<15} {:<10} {:>8} {:>10} {:>4} {:<8}",
                "ID", "Type", "Symbol", "Volume", "Ticket", "Pri", "Status"
            );
            println!("{}", "-".repeat(97));
            for c in commands {
                println!(
                    "{:<36} {:<15} {:<10} {:>8} {:>10} {:>4} {:<8}",
                    c.id,
                    c.command_type.as_str(),
                    truncate(c.symbol.as_deref().unwrap_or("-"), 10),
                    c.volume.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string()),
                    c.leader_ticket_ref.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
                    c.priority,
                    c.status.as_str()
                );
            }
        }

        Commands::Status => {
            println!("\n=== Replication Status ===\n");

            println!("Signals:");
            for (status, count) in db.signal_counts().await? {
                println!("  {:<12} {}", status.as_str(), count);
            }

            println!("\nCommands:");
            for (status, count) in db.command_counts().await? {
                println!("  {:<12} {}", status.as_str(), count);
            }

            let accounts = db.list_accounts().await?;
            let online = accounts.iter().filter(|a| a.is_online()).count();
            println!("\nAccounts: {} ({} online)", accounts.len(), online);
        }

        Commands::Sweep => {
            let replicator = Replicator::new(db, config, Notifier::disabled());
            let report = replicator.sweep(chrono::Utc::now()).await;
            println!("Expired commands:   {}", report.expired);
            println!("Went offline:       {}", report.went_offline.join(", "));
            println!("Signals retried:    {}", report.signals_retried);
        }

        Commands::Config => {
            println!("\n=== Replicator Configuration ===\n");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn set_link_status(db: &Database, link_id: &str, status: LinkStatus) -> Result<()> {
    if db.set_link_status(link_id, status).await? {
        info!(link = %link_id, status = status.as_str(), "Link status changed");
        println!("Link {} is now {}", link_id, status.as_str());
        Ok(())
    } else {
        Err(anyhow!("No link with ID {link_id}"))
    }
}

fn fmt_limit(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
