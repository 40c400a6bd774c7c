//! Cluster membership and key ownership for the fleet control plane.
//!
//! Every process registers itself as a leased [`Member`] in the coordination
//! store and follows the other members through a watch. Ownership of a
//! work-item key is decided by a [`ConsistentRing`] over the live member ids,
//! so each key has exactly one owner once all members agree on the member set.
//!
//! # Example
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//!
//! use fleet_cluster::{Membership, MembershipConfig, OwnershipOracle};
//! use fleet_store::{MemStore, fatal_channel};
//!
//! # tokio_test::block_on(async {
//! let (fatal_tx, _fatal_rx) = fatal_channel();
//! let config = MembershipConfig::new("node-a", IpAddr::V4(Ipv4Addr::LOCALHOST));
//! let membership = Membership::new(Arc::new(MemStore::new()), config, fatal_tx);
//!
//! membership.join().await?;
//! assert!(membership.local_is_worker("/scalers/aws/web").is_owner);
//! membership.leave().await?;
//! # Ok::<(), fleet_cluster::ClusterError>(())
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod member;
pub mod membership;
pub mod ring;
pub mod state;

pub use error::{ClusterError, Result};
pub use member::{Member, member_id};
pub use membership::{
    DEFAULT_LEASE_TTL, Membership, MembershipConfig, Ownership, OwnershipOracle,
};
pub use ring::{ConsistentRing, DEFAULT_VIRTUAL_NODES, HashRing};
pub use state::ClusterState;
