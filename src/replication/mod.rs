//! Replication pipeline: snapshot diffing, fanout, queueing, and guards.

mod config;
mod fanout;
mod ledger;
mod live;
mod position_sizer;
mod queue;
mod rules;
mod signal_generator;
mod snapshot;

pub use config::ReplicatorConfig;
pub use fanout::CommandFanout;
pub use ledger::PositionLedger;
pub use live::{LiveState, LiveStateCache};
pub use position_sizer::{PositionSizer, SizingInputs};
pub use queue::CommandQueue;
pub use rules::{GuardEvent, RuleEngine};
pub use signal_generator::SignalGenerator;
pub use snapshot::SnapshotTracker;
