//! Error types for the fleet-store crate.

use thiserror::Error;

use crate::store::LeaseId;

/// Errors returned by a coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request deadline elapsed before the store answered.
    #[error("store request timed out: {0}")]
    Timeout(String),

    /// The store lost its quorum leader.
    #[error("store has no leader")]
    NoLeader,

    /// The lease does not exist or has already expired.
    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    /// A watch stream was closed by the store.
    #[error("watch closed for prefix {prefix}")]
    WatchClosed {
        /// The watched prefix.
        prefix: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true for errors that mean this process can no longer prove
    /// liveness or ownership against the store.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::Timeout(_)
                | Self::NoLeader
                | Self::LeaseNotFound(_)
                | Self::WatchClosed { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
