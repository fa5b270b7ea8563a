//! Error types for the memory engine
//!
//! One crate-wide error enum mirrors the engine's propagation policy:
//! read paths surface missing entities as `None`/empty rather than errors,
//! maintenance handlers convert every failure into a recorded outcome, and
//! retrieval degrades instead of failing when a collaborator is unavailable.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngramError>;

/// Errors produced by the memory engine
#[derive(Debug, Error)]
pub enum EngramError {
    /// Caller-supplied input is malformed: dimension mismatch, negative k,
    /// empty seed set, unknown task name. Always surfaced to the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Entity missing on a write/delete path. Read paths return `None`
    /// instead of constructing this variant.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Persisted state could not be interpreted. Recovered locally where
    /// safe (state reset, row skipped); escalated only when recovery would
    /// lose user data.
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// A collaborator (embedder, keyword index) failed to load or respond.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Disk or lock-level failure that callers may retry.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Database-level failure. Storage mutations fail fast and roll back
    /// their enclosing transaction.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization of a stored blob (vector clock, turn indices, state
    /// file) failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token budget exhausted before any chunk fit. Retrieval reports this
    /// as an empty result, not an error; the variant exists for callers
    /// that want to distinguish the case.
    #[error("token budget exhausted")]
    BudgetExhausted,

    /// Operation cancelled or timed out at the caller boundary.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl EngramError {
    /// Invalid-argument constructor used at validation sites
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Not-found constructor for write/delete paths
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a caller may reasonably retry the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_)) || matches!(self, Self::Database(sqlx::Error::PoolTimedOut))
    }
}
