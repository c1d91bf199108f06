//! Consistent Hash Ring for Shard Selection
//!
//! Every shard owns `virtual_nodes` points on a 64-bit circle. A key belongs
//! to the first point at or after its own hash, wrapping past the top. Adding
//! or removing a shard only moves the keys on the arcs its points cover.
//!
//! Points are hashed as `blake3(name + "#" + i)`, truncated to the first 8
//! bytes read little endian, so the layout is identical across processes
//! and platforms for the same shard set.

use blake3::Hasher;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use shardgate_core::config::DEFAULT_VIRTUAL_NODES;

use crate::error::RouterError;
use crate::types::{RingPoint, ShardName};

#[derive(Debug, Default)]
struct RingState {
    /// (hash, insertion sequence) -> owner; the sequence orders hash ties
    points: BTreeMap<(u64, u64), ShardName>,
    members: BTreeSet<ShardName>,
    next_seq: u64,
}

/// Consistent hash ring mapping keys to shard names
#[derive(Debug)]
pub struct HashRing {
    /// Number of virtual nodes per shard for better distribution
    virtual_nodes: u32,
    state: RwLock<RingState>,
}

impl HashRing {
    /// Create an empty ring with the default virtual node count
    pub fn new() -> Self {
        Self::with_virtual_nodes(DEFAULT_VIRTUAL_NODES)
    }

    /// Create with custom virtual node count (at least one)
    pub fn with_virtual_nodes(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            state: RwLock::new(RingState::default()),
        }
    }

    /// Hash a string key using blake3
    pub fn hash_key(key: &str) -> u64 {
        let mut hasher = Hasher::new();
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let bytes = hash.as_bytes();
        u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
            bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }

    fn point_label(name: &str, index: u32) -> String {
        format!("{}#{}", name, index)
    }

    /// Insert a shard's points. Returns `false` if it was already present.
    pub fn add_shard(&self, name: &str) -> bool {
        let mut state = self.state.write();
        if !state.members.insert(name.to_string()) {
            return false;
        }

        for vn in 0..self.virtual_nodes {
            let hash = Self::hash_key(&Self::point_label(name, vn));
            let seq = state.next_seq;
            state.next_seq += 1;
            state.points.insert((hash, seq), name.to_string());
        }

        debug!(shard = %name, points = self.virtual_nodes, "Shard added to ring");
        true
    }

    /// Remove all of a shard's points. Returns `false` if it was absent.
    pub fn remove_shard(&self, name: &str) -> bool {
        let mut state = self.state.write();
        if !state.members.remove(name) {
            return false;
        }
        state.points.retain(|_, owner| owner != name);

        debug!(shard = %name, "Shard removed from ring");
        true
    }

    /// Shard owning `key`
    pub fn resolve(&self, key: &str) -> Result<ShardName, RouterError> {
        let hash = Self::hash_key(key);
        let state = self.state.read();

        // Find the first point >= hash, or wrap around to the first
        let owner = state
            .points
            .range((hash, 0)..)
            .next()
            .or_else(|| state.points.iter().next())
            .map(|(_, owner)| owner.clone())
            .ok_or(RouterError::EmptyRing)?;

        trace!(key = %key, hash = %hash, shard = %owner, "Consistent hash lookup");
        Ok(owner)
    }

    /// Whether `name` is on the ring
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().members.contains(name)
    }

    /// Member shard names, sorted
    pub fn shards(&self) -> Vec<ShardName> {
        self.state.read().members.iter().cloned().collect()
    }

    /// Ring points in ring order
    pub fn points(&self) -> Vec<RingPoint> {
        self.state
            .read()
            .points
            .iter()
            .map(|(&(hash, _), shard)| RingPoint {
                hash,
                shard: shard.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().members.is_empty()
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ring_of(names: &[&str]) -> HashRing {
        let ring = HashRing::default();
        for name in names {
            ring.add_shard(name);
        }
        ring
    }

    fn sample_keys(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("key:{}", i)).collect()
    }

    #[test]
    fn test_resolve_deterministic() {
        let ring = ring_of(&["cache-a", "cache-b", "cache-c"]);

        let first = ring.resolve("account:alice").unwrap();
        let second = ring.resolve("account:alice").unwrap();

        assert_eq!(first, second, "Same key should route to same shard");
    }

    #[test]
    fn test_resolve_independent_of_insertion_order() {
        let forward = ring_of(&["cache-a", "cache-b", "cache-c"]);
        let backward = ring_of(&["cache-c", "cache-b", "cache-a"]);

        for key in sample_keys(500) {
            assert_eq!(forward.resolve(&key).unwrap(), backward.resolve(&key).unwrap());
        }
    }

    #[test]
    fn test_hash_is_stable() {
        // Changing the hash function, the truncation or the byte order
        // remaps every key across restarts
        assert_eq!(HashRing::hash_key("cache-a#0"), 6_638_444_601_572_658_575);
        assert_eq!(HashRing::hash_key("A#0"), 15_888_815_885_411_301_683);
    }

    #[test]
    fn test_points_are_labelled_name_hash_index() {
        let ring = HashRing::with_virtual_nodes(32);
        ring.add_shard("A");

        let mut expected: Vec<u64> = (0..32).map(|i| HashRing::hash_key(&format!("A#{}", i))).collect();
        expected.sort_unstable();
        let actual: Vec<u64> = ring.points().iter().map(|p| p.hash).collect();

        assert_eq!(actual, expected);
        assert!(ring.points().iter().all(|p| p.shard == "A"));
    }

    #[test]
    fn test_distribution() {
        let ring = ring_of(&["a", "b", "c", "d", "e", "f"]);
        let mut distribution = HashMap::new();

        for key in sample_keys(6000) {
            *distribution.entry(ring.resolve(&key).unwrap()).or_insert(0) += 1;
        }

        // All 6 shards should receive traffic
        assert_eq!(distribution.len(), 6);

        // Roughly 1/6 each
        for count in distribution.values() {
            assert!(*count > 500 && *count < 1600, "count={} is outside expected range", count);
        }
    }

    #[test]
    fn test_minimal_remapping_on_add() {
        let ring = ring_of(&["A", "B", "C"]);
        let keys = sample_keys(10_000);
        let before: Vec<_> = keys.iter().map(|k| ring.resolve(k).unwrap()).collect();

        ring.add_shard("D");
        let mut moved = 0;
        for (key, old) in keys.iter().zip(&before) {
            let new = ring.resolve(key).unwrap();
            if &new != old {
                assert_eq!(new, "D", "a key may only move to the new shard");
                moved += 1;
            }
        }

        // Expected share is 1/4; allow for virtual node variance
        assert!(moved > 0);
        assert!(moved < 3_500, "moved={} keys", moved);
    }

    #[test]
    fn test_remove_restores_mapping() {
        let ring = ring_of(&["A", "B", "C"]);
        let keys = sample_keys(2_000);
        let before: Vec<_> = keys.iter().map(|k| ring.resolve(k).unwrap()).collect();

        ring.add_shard("D");
        assert!(ring.remove_shard("D"));

        let after: Vec<_> = keys.iter().map(|k| ring.resolve(k).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_add_is_idempotent() {
        let ring = HashRing::with_virtual_nodes(20);
        assert!(ring.add_shard("A"));
        assert!(!ring.add_shard("A"));
        assert_eq!(ring.points().len(), 20);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_points_are_ordered() {
        let ring = ring_of(&["A", "B"]);
        let points = ring.points();
        assert_eq!(points.len(), 2 * DEFAULT_VIRTUAL_NODES as usize);
        assert!(points.windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::default();
        assert!(matches!(ring.resolve("key"), Err(RouterError::EmptyRing)));

        ring.add_shard("A");
        ring.remove_shard("A");
        assert!(ring.is_empty());
        assert!(matches!(ring.resolve("key"), Err(RouterError::EmptyRing)));
    }

    #[test]
    fn test_resolve_during_membership_changes() {
        let ring = ring_of(&["A", "B", "C"]);
        let keys = sample_keys(500);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..200 {
                    ring.add_shard("D");
                    ring.remove_shard("D");
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        for key in &keys {
                            let owner = ring.resolve(key).unwrap();
                            assert!(["A", "B", "C", "D"].contains(&owner.as_str()), "owner={}", owner);
                        }
                    }
                });
            }
        });

        assert_eq!(ring.shards(), vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_single_shard() {
        let ring = ring_of(&["only"]);
        for key in sample_keys(100) {
            assert_eq!(ring.resolve(&key).unwrap(), "only");
        }
        assert!(ring.contains("only"));
        assert!(!ring.contains("other"));
    }
}
