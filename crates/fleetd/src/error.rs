//! Error types for the fleet daemon.

use fleet_cluster::ClusterError;
use fleet_manager::ManagerError;
use fleet_store::StoreError;
use fleet_worker::WorkerError;
use thiserror::Error;

/// Errors that can occur while starting or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A seed entry was rejected.
    #[error("invalid seed entry '{key}': {reason}")]
    Seed {
        /// Store key the entry would have been written to.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Membership error.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Manager error.
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// Worker construction error.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
