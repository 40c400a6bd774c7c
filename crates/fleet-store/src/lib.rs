//! Coordination store contract for the fleet control plane.
//!
//! `fleet-store` defines the [`CoordinationStore`] trait every other crate
//! talks to, the [`keys`] layout, and [`MemStore`], an in-process
//! implementation with revisions, ordered prefix watches and lease expiry.
//! With the `etcd` feature, `EtcdStore` implements the same contract
//! against an etcd cluster.
//!
//! # Example
//!
//! ```rust
//! use fleet_store::{CoordinationStore, MemStore, keys};
//!
//! # tokio_test::block_on(async {
//! let store = MemStore::new();
//! store.put(&keys::scaler_key("aws", "web"), b"{}".to_vec()).await?;
//!
//! let items = store.get_prefix(keys::SCALERS_PREFIX).await?;
//! assert_eq!(items.len(), 1);
//! # Ok::<(), fleet_store::StoreError>(())
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod keys;
pub mod memory;
pub mod store;

use tokio::sync::mpsc;

pub use error::{Result, StoreError};
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::MemStore;
pub use store::{CoordinationStore, KeyValue, LeaseId, WatchEvent, WatchStream};

/// Sending half of the process-level channel for fatal store errors.
///
/// Keep-alive and watch loops report here instead of retrying in place; the
/// daemon shuts down on the first message.
pub type FatalSink = mpsc::UnboundedSender<StoreError>;

/// Receiving half of the fatal error channel.
pub type FatalStream = mpsc::UnboundedReceiver<StoreError>;

/// Creates a fatal error channel.
#[must_use]
pub fn fatal_channel() -> (FatalSink, FatalStream) {
    mpsc::unbounded_channel()
}
