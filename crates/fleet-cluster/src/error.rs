//! Error types for the fleet-cluster crate.

use fleet_store::StoreError;
use thiserror::Error;

use crate::state::ClusterState;

/// Errors that can occur in membership operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A member with the same id is already registered.
    #[error("member {id} is already registered")]
    DuplicateMember {
        /// The conflicting member id.
        id: String,
    },

    /// The operation is not allowed in the current cluster state.
    #[error("invalid cluster state: {state} (expected {expected})")]
    InvalidState {
        /// The current state.
        state: ClusterState,
        /// The state the operation requires.
        expected: ClusterState,
    },

    /// The coordination store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A member record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for membership operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
