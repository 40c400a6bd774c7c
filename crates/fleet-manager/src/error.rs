//! Error types for the fleet-manager crate.

use fleet_store::StoreError;
use thiserror::Error;

use crate::manager::ManagerState;

/// Errors that can occur in a worker manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The coordination store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A snapshot could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation is not allowed in the current state.
    #[error("manager is {state:?}, expected {expected:?}")]
    InvalidState {
        /// Current state.
        state: ManagerState,
        /// Required state.
        expected: ManagerState,
    },
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl ManagerError {
    /// Returns true if the error should end the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_connectivity(),
            Self::Serialization(_) | Self::InvalidState { .. } => false,
        }
    }
}

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;
