//! Consistent-hash ring.
//!
//! Each member is placed on a 64-bit ring at a bounded number of virtual
//! points. A key belongs to the member owning the first point at or after the
//! key's hash, wrapping at the end of the ring. Adding or removing one member
//! only moves the keys whose successor point changes.
//!
//! Two members hashing to the same point share it; the smallest id owns it,
//! so every member computes the same owner whatever order it saw joins in.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

/// Virtual points per member unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Minimal ring interface used by the membership service.
pub trait HashRing: Send + Sync {
    /// Adds a member id. Adding an id twice is a no-op.
    fn add(&mut self, id: &str);

    /// Removes a member id. Removing an unknown id is a no-op.
    fn remove(&mut self, id: &str);

    /// Returns the id owning `key`, or `None` if the ring is empty.
    fn get(&self, key: &str) -> Option<&str>;
}

/// Ring with `virtual_nodes` points per member, hashed with SHA-256.
#[derive(Debug, Clone)]
pub struct ConsistentRing {
    virtual_nodes: usize,
    points: BTreeMap<u64, BTreeSet<String>>,
    nodes: BTreeSet<String>,
}

impl ConsistentRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            points: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Returns the member ids on the ring.
    #[must_use]
    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    /// Returns true if `id` is on the ring.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when the ring has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn point(id: &str, replica: usize) -> u64 {
        hash64(format!("{id}#{replica}").as_bytes())
    }

    fn place(&mut self, point: u64, id: &str) {
        self.points.entry(point).or_default().insert(id.to_string());
    }

    fn unplace(&mut self, point: u64, id: &str) {
        if let Some(claimants) = self.points.get_mut(&point) {
            claimants.remove(id);
            if claimants.is_empty() {
                self.points.remove(&point);
            }
        }
    }
}

impl Default for ConsistentRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing for ConsistentRing {
    fn add(&mut self, id: &str) {
        if !self.nodes.insert(id.to_string()) {
            return;
        }
        for replica in 0..self.virtual_nodes {
            self.place(Self::point(id, replica), id);
        }
    }

    fn remove(&mut self, id: &str) {
        if !self.nodes.remove(id) {
            return;
        }
        for replica in 0..self.virtual_nodes {
            self.unplace(Self::point(id, replica), id);
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        let hash = hash64(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .and_then(|(_, claimants)| claimants.first())
            .map(String::as_str)
    }
}

fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring_of(ids: &[&str]) -> ConsistentRing {
        let mut ring = ConsistentRing::default();
        for id in ids {
            ring.add(id);
        }
        ring
    }

    mod basic_tests {
        use super::*;

        #[test]
        fn test_empty_ring_has_no_owner() {
            let ring = ConsistentRing::default();
            assert!(ring.get("/scalers/aws/a").is_none());
            assert!(ring.is_empty());
        }

        #[test]
        fn test_single_member_owns_everything() {
            let ring = ring_of(&["m1"]);
            for i in 0..100 {
                assert_eq!(ring.get(&format!("/scalers/aws/{i}")), Some("m1"));
            }
        }

        #[test]
        fn test_add_is_idempotent() {
            let mut ring = ring_of(&["m1", "m2"]);
            let before = ring.points.len();
            ring.add("m1");
            assert_eq!(ring.points.len(), before);
            assert_eq!(ring.len(), 2);
        }

        #[test]
        fn test_remove_drops_all_points() {
            let mut ring = ring_of(&["m1", "m2"]);
            ring.remove("m2");
            assert!(!ring.contains("m2"));
            assert!(ring.points.values().flatten().all(|id| id == "m1"));
            ring.remove("unknown");
            assert_eq!(ring.len(), 1);
        }

        #[test]
        fn test_keys_spread_across_members() {
            let ring = ring_of(&["m1", "m2", "m3"]);
            let mut counts = std::collections::HashMap::new();
            for i in 0..3000 {
                let owner = ring.get(&format!("/scalers/p/{i}")).unwrap().to_string();
                *counts.entry(owner).or_insert(0) += 1;
            }
            assert_eq!(counts.len(), 3);
            assert!(counts.values().all(|&c| c > 500));
        }
    }

    mod collision_tests {
        use super::*;

        const SHARED: u64 = 42;

        fn collided(first: &str, second: &str) -> ConsistentRing {
            let mut ring = ConsistentRing::new(1);
            ring.nodes.insert(first.to_string());
            ring.place(SHARED, first);
            ring.nodes.insert(second.to_string());
            ring.place(SHARED, second);
            ring
        }

        #[test]
        fn test_shared_point_goes_to_smallest_id_in_any_order() {
            let forward = collided("m1", "m2");
            let backward = collided("m2", "m1");

            for key in ["/scalers/p/a", "/healers/p", "/schedulers/p/b"] {
                assert_eq!(forward.get(key), Some("m1"));
                assert_eq!(backward.get(key), Some("m1"));
            }
        }

        #[test]
        fn test_removing_smallest_claimant_keeps_the_other() {
            let mut ring = collided("m2", "m1");
            ring.nodes.remove("m1");
            ring.unplace(SHARED, "m1");

            assert_eq!(ring.get("/scalers/p/a"), Some("m2"));
            assert_eq!(ring.points.len(), 1);

            ring.unplace(SHARED, "m2");
            assert!(ring.points.is_empty());
        }
    }

    proptest! {
        #[test]
        fn test_every_key_has_exactly_one_live_owner(
            ids in proptest::collection::btree_set("[a-f0-9]{16}", 1..8),
            key in "/[a-z]{1,8}/[a-z]{1,8}/[a-z0-9]{1,12}",
        ) {
            let mut ring = ConsistentRing::default();
            for id in &ids {
                ring.add(id);
            }
            let owner = ring.get(&key).map(str::to_string);
            prop_assert!(owner.is_some());
            let owner = owner.unwrap();
            prop_assert_eq!(ids.iter().filter(|id| **id == owner).count(), 1);
        }

        #[test]
        fn test_join_order_does_not_change_owners(
            ids in proptest::collection::vec("[a-f0-9]{4}", 1..8),
            keys in proptest::collection::vec("[a-z0-9/]{4,24}", 1..32),
        ) {
            let mut forward = ConsistentRing::new(8);
            for id in &ids {
                forward.add(id);
            }
            let mut backward = ConsistentRing::new(8);
            for id in ids.iter().rev() {
                backward.add(id);
            }
            for key in &keys {
                prop_assert_eq!(forward.get(key), backward.get(key));
            }
        }

        #[test]
        fn test_adding_a_member_only_moves_keys_to_it(
            ids in proptest::collection::btree_set("[a-f0-9]{16}", 1..6),
            newcomer in "[g-z]{16}",
            keys in proptest::collection::vec("[a-z0-9/]{4,24}", 1..64),
        ) {
            let mut ring = ConsistentRing::default();
            for id in &ids {
                ring.add(id);
            }
            let before: Vec<String> = keys.iter().map(|k| ring.get(k).unwrap().to_string()).collect();
            ring.add(&newcomer);
            for (key, old) in keys.iter().zip(before) {
                let new = ring.get(key).unwrap();
                prop_assert!(new == old || new == newcomer);
            }
        }

        #[test]
        fn test_removing_a_member_only_moves_its_keys(
            ids in proptest::collection::btree_set("[a-f0-9]{16}", 2..6),
            keys in proptest::collection::vec("[a-z0-9/]{4,24}", 1..64),
        ) {
            let mut ring = ConsistentRing::default();
            for id in &ids {
                ring.add(id);
            }
            let victim = ids.iter().next().unwrap().clone();
            let before: Vec<String> = keys.iter().map(|k| ring.get(k).unwrap().to_string()).collect();
            ring.remove(&victim);
            for (key, old) in keys.iter().zip(before) {
                if old != victim {
                    prop_assert_eq!(ring.get(key).unwrap(), old.as_str());
                }
            }
        }
    }
}
