//! Data models for accounts, copy links, positions, change signals, and commands.

mod account;
mod command;
mod heartbeat;
mod link;
mod position;
mod signal;

pub use account::{AccountRole, ConnectionStatus, TradingAccount};
pub use command::{Command, CommandStatus, CommandType, NewCommand};
#[cfg(test)]
pub use command::{PRIORITY_CLOSE, PRIORITY_MODIFY, PRIORITY_OPEN_BASE};
pub use heartbeat::{AckStatus, CommandAck, Heartbeat};
pub use link::{CopyLink, LinkStatus, SizingMode};
pub use position::{Position, PositionSide, PositionStatus, SnapshotPosition, StopLevels};
pub use signal::{idempotency_key, ChangeSignal, SignalEvent, SignalStatus};
