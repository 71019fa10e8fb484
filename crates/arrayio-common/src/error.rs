//! Error types for ArrayIO
//!
//! Every rejected operation leaves the object store untouched; the variant
//! tells the caller whether retrying later can help.

use crate::types::RaidGroupId;
use thiserror::Error;

/// Common result type for ArrayIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ArrayIO
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("no eligible spare: {0}")]
    NoCandidate(String),

    #[error("raid group {raid_group} unstable: {reason}")]
    RaidGroupUnstable {
        raid_group: RaidGroupId,
        reason: String,
    },

    #[error("busy: {0}")]
    Busy(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("database rebuild required: {0}")]
    NeedsDatabaseRebuild(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error for any displayable object reference
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a raid group unstable error
    pub fn unstable(raid_group: RaidGroupId, reason: impl Into<String>) -> Self {
        Self::RaidGroupUnstable {
            raid_group,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy(_) | Self::RaidGroupUnstable { .. } | Self::Persistence(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
