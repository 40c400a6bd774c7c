//! The coordination store contract.
//!
//! Everything the control plane persists goes through [`CoordinationStore`]:
//! work-item definitions, leased membership records and checkpointed worker
//! state. Implementations must deliver watch events for a prefix in the order
//! the mutations were applied.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identifier of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key path.
    pub key: String,
    /// Raw value bytes (JSON for every key the control plane writes).
    pub value: Vec<u8>,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
    /// Store revision at which the key was created.
    pub create_revision: i64,
    /// Store revision of the last modification.
    pub mod_revision: i64,
}

/// A change observed on a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or replaced.
    Put {
        /// The new key-value.
        kv: KeyValue,
        /// The previous value when this put replaced an existing key.
        prev: Option<KeyValue>,
    },
    /// A key was deleted, explicitly or by lease expiry.
    Delete {
        /// The deleted key.
        key: String,
        /// The value held before deletion.
        prev: Option<KeyValue>,
    },
}

impl WatchEvent {
    /// Returns the key this event refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { kv, .. } => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    /// Returns true if this event created a new key.
    #[must_use]
    pub const fn is_create(&self) -> bool {
        matches!(self, Self::Put { prev: None, .. })
    }
}

/// Ordered stream of watch events. An `Err` item terminates the stream.
pub type WatchStream = mpsc::UnboundedReceiver<Result<WatchEvent>>;

/// Durable, watchable key-value store with lease-based expiry.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Reads a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Lists every key under `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Writes a key without a lease, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Replaces the value of an existing key, keeping it unleased.
    ///
    /// Returns false without writing if the key does not exist, so a
    /// checkpoint never resurrects a deleted item.
    async fn update(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Writes a key attached to `lease`; the key is removed when the lease expires.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()>;

    /// Deletes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Grants a lease that expires `ttl` after the last keep-alive.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refreshes a lease once.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes a lease and deletes every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Watches every key under `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}
