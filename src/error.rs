//! Unified error handling for viewsyncd.
//!
//! This module provides the error hierarchy for the CVR engine, with
//! automatic conversions from storage errors and metric labeling.

use thiserror::Error;

// ============================================================================
// CVR Engine Errors
// ============================================================================

/// Errors that can occur while loading, reconciling, or flushing a CVR.
#[derive(Debug, Error)]
pub enum CvrError {
    /// The persisted CVR version no longer matches the updater's base
    /// version. Fatal to the in-progress sync round, not to the process:
    /// the caller must discard the draft and restart from a fresh load.
    #[error("concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: String, actual: String },

    /// Another process's ownership lease has superseded this one. The
    /// caller must abandon the round, typically redirecting the client.
    #[error("ownership lost to {owner} (granted at {granted_at})")]
    Ownership { owner: String, granted_at: i64 },

    /// A client's declared schema conflicts with the group's established
    /// schema. Terminates that client's connection.
    #[error("invalid connection request: {0}")]
    InvalidConnectionRequest(String),

    /// A persisted record failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CvrError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::Ownership { .. } => "ownership_lost",
            Self::InvalidConnectionRequest(_) => "invalid_connection_request",
            Self::Corrupt(_) => "corrupt_record",
            Self::Db(_) => "db_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller should restart the sync round from a fresh
    /// `load()`. Both flush-arbitration failures are recoverable this way;
    /// the rest are not.
    #[inline]
    pub fn round_restartable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::Ownership { .. }
        )
    }
}

impl From<tokio::task::JoinError> for CvrError {
    fn from(err: tokio::task::JoinError) -> Self {
        CvrError::Internal(format!("row lookup task failed: {err}"))
    }
}

/// Result type for CVR operations.
pub type CvrResult<T> = Result<T, CvrError>;
