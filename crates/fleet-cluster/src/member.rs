//! Member identity.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One process participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable identifier derived from `name` and `address`.
    pub id: String,
    /// Human-readable member name.
    pub name: String,
    /// Address the member is bound to.
    pub address: IpAddr,
}

impl Member {
    /// Creates a member, deriving its id from `name` and `address`.
    #[must_use]
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        let name = name.into();
        Self {
            id: member_id(&name, address),
            name,
            address,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.address, self.id)
    }
}

/// Computes the deterministic member id for `name` and `address`.
#[must_use]
pub fn member_id(name: &str, address: IpAddr) -> String {
    let digest = Sha256::digest(format!("{name}@{address}").as_bytes());
    hex::encode(&digest[..8])
}
