//! Error taxonomy for the replication pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A secondary component (cache, notifier) is unavailable.
    #[error("Transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// A malformed snapshot item, ack, or command payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The work was already done; callers treat this as a no-op.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The durable store failed; wraps the store's context chain.
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Degrade and continue.
    Degraded,
    /// Reject the single item, continue the batch.
    Rejected,
    /// Not a failure.
    Benign,
    /// Skip and log.
    Missing,
    Fatal,
}

impl ReplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientInfra(_) => ErrorKind::Degraded,
            Self::Validation(_) => ErrorKind::Rejected,
            Self::Duplicate(_) => ErrorKind::Benign,
            Self::NotFound(_) => ErrorKind::Missing,
            Self::Storage(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_benign(&self) -> bool {
        matches!(self.kind(), ErrorKind::Benign)
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;
