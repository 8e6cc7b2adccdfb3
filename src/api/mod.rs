//! HTTP surface for trading terminals.

mod server;
mod types;

pub use server::serve;
