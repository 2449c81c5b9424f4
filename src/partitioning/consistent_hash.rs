//! Segment-to-owner mapping.
//!
//! A [`ConsistentHash`] is an immutable table holding the ordered owner list of
//! every segment. It is a pure function of the member list, the number of owners
//! and the number of segments, so every node can recompute it independently.

use crate::partitioning::hashring::{hash_bytes, HashRing};
use crate::types::{NodeId, Segment};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Maps keys to segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_segments: u32,
}

impl KeyPartitioner {
    /// Create a partitioner for `num_segments` segments.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments: num_segments.max(1),
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Assign a key to its segment.
    pub fn segment_of(&self, key: &[u8]) -> Segment {
        (hash_bytes(key) % u64::from(self.num_segments)) as Segment
    }
}

/// Immutable segment ownership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_owners: usize,
    members: Vec<NodeId>,
    segment_owners: Vec<Vec<NodeId>>,
}

/// How the owners of one segment change between two hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    /// The segment.
    pub segment: Segment,

    /// Owners gaining the segment (inbound data).
    pub added: Vec<NodeId>,

    /// Owners losing the segment (outbound data).
    pub removed: Vec<NodeId>,
}

impl ConsistentHash {
    /// Compute the ownership table for a member list.
    pub fn compute(members: &[NodeId], num_owners: usize, num_segments: u32) -> Self {
        let ring = HashRing::new(members);
        let num_owners = num_owners.max(1);
        let segment_owners = (0..num_segments.max(1))
            .map(|segment| ring.segment_owners(segment, num_segments.max(1), num_owners))
            .collect();

        Self {
            num_owners,
            members: ring.nodes().to_vec(),
            segment_owners,
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.segment_owners.len() as u32
    }

    /// Configured owners per segment.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// Sorted member list.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Check if a node is a member.
    pub fn contains_member(&self, node_id: NodeId) -> bool {
        self.members.binary_search(&node_id).is_ok()
    }

    /// Owners of a segment, primary first.
    pub fn owners_of(&self, segment: Segment) -> &[NodeId] {
        self.segment_owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner of a segment.
    pub fn primary_owner(&self, segment: Segment) -> Option<NodeId> {
        self.owners_of(segment).first().copied()
    }

    /// Check if a node owns a segment.
    pub fn is_owner(&self, segment: Segment, node_id: NodeId) -> bool {
        self.owners_of(segment).contains(&node_id)
    }

    /// Segments a node owns, in ascending order.
    pub fn segments_for(&self, node_id: NodeId) -> BTreeSet<Segment> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node_id))
            .map(|(segment, _)| segment as Segment)
            .collect()
    }

    /// Segments for which a node is the primary owner.
    pub fn primary_segments_for(&self, node_id: NodeId) -> BTreeSet<Segment> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(&node_id))
            .map(|(segment, _)| segment as Segment)
            .collect()
    }

    /// Per-segment ownership differences from `self` to `next`.
    ///
    /// Only segments whose owner set changed are reported.
    pub fn diff(&self, next: &ConsistentHash) -> Vec<OwnershipChange> {
        let segments = self.num_segments().max(next.num_segments());
        (0..segments)
            .filter_map(|segment| {
                let before = self.owners_of(segment);
                let after = next.owners_of(segment);
                let added: Vec<NodeId> =
                    after.iter().copied().filter(|n| !before.contains(n)).collect();
                let removed: Vec<NodeId> =
                    before.iter().copied().filter(|n| !after.contains(n)).collect();
                if added.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(OwnershipChange {
                        segment,
                        added,
                        removed,
                    })
                }
            })
            .collect()
    }

    /// Union of two hashes: `self`'s owners followed by `other`'s new owners.
    ///
    /// Used as the write hash while a rebalance is in flight.
    pub fn union(&self, other: &ConsistentHash) -> ConsistentHash {
        let segments = self.num_segments().max(other.num_segments());
        let segment_owners = (0..segments)
            .map(|segment| {
                let mut owners = self.owners_of(segment).to_vec();
                for &node in other.owners_of(segment) {
                    if !owners.contains(&node) {
                        owners.push(node);
                    }
                }
                owners
            })
            .collect();

        let members: BTreeSet<NodeId> = self
            .members
            .iter()
            .chain(other.members.iter())
            .copied()
            .collect();

        ConsistentHash {
            num_owners: self.num_owners.max(other.num_owners),
            members: members.into_iter().collect(),
            segment_owners,
        }
    }

    /// Remove departed members.
    ///
    /// Surviving owners keep their segments in the same order. Segments that lose
    /// every owner are assigned from a fresh computation over the remaining members;
    /// their data is gone, but the segment stays addressable.
    pub fn without_members(&self, left: &[NodeId]) -> ConsistentHash {
        let members: Vec<NodeId> = self
            .members
            .iter()
            .copied()
            .filter(|m| !left.contains(m))
            .collect();

        let mut fresh: Option<ConsistentHash> = None;
        let segment_owners = self
            .segment_owners
            .iter()
            .enumerate()
            .map(|(segment, owners)| {
                let survivors: Vec<NodeId> =
                    owners.iter().copied().filter(|o| !left.contains(o)).collect();
                if !survivors.is_empty() || members.is_empty() {
                    return survivors;
                }
                let fresh = fresh.get_or_insert_with(|| {
                    ConsistentHash::compute(&members, self.num_owners, self.num_segments())
                });
                fresh.owners_of(segment as Segment).to_vec()
            })
            .collect();

        ConsistentHash {
            num_owners: self.num_owners,
            members,
            segment_owners,
        }
    }

    /// Number of segments each member owns, for monitoring.
    pub fn ownership_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> =
            self.members.iter().map(|&m| (m, 0)).collect();
        for owners in &self.segment_owners {
            for owner in owners {
                *counts.entry(*owner).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_partitioner_is_stable() {
        let partitioner = KeyPartitioner::new(256);
        let segment = partitioner.segment_of(b"user:123");
        assert!(segment < 256);
        for _ in 0..10 {
            assert_eq!(partitioner.segment_of(b"user:123"), segment);
        }
    }

    #[test]
    fn test_owner_bounds() {
        let ch = ConsistentHash::compute(&[1, 2, 3, 4], 2, 32);
        assert_eq!(ch.num_segments(), 32);
        for segment in 0..32 {
            let owners = ch.owners_of(segment);
            assert_eq!(owners.len(), 2);
            assert_eq!(ch.primary_owner(segment), Some(owners[0]));
        }
    }

    #[test]
    fn test_fewer_members_than_owners() {
        let ch = ConsistentHash::compute(&[5, 9], 10, 16);
        for segment in 0..16 {
            let mut owners = ch.owners_of(segment).to_vec();
            owners.sort();
            assert_eq!(owners, vec![5, 9]);
        }
    }

    #[test]
    fn test_empty_members() {
        let ch = ConsistentHash::compute(&[], 2, 8);
        assert!(ch.owners_of(0).is_empty());
        assert!(ch.primary_owner(3).is_none());
    }

    #[test]
    fn test_determinism_over_random_member_sets() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let count = rng.gen_range(1..12);
            let mut members: Vec<NodeId> = (0..count).map(|_| rng.gen_range(1..10_000)).collect();
            let num_owners = rng.gen_range(1..5);

            let on_node_a = ConsistentHash::compute(&members, num_owners, 64);
            members.shuffle(&mut rng);
            let on_node_b = ConsistentHash::compute(&members, num_owners, 64);

            assert_eq!(on_node_a, on_node_b);
        }
    }

    #[test]
    fn test_diff_on_join() {
        let before = ConsistentHash::compute(&[1, 2], 2, 64);
        let after = ConsistentHash::compute(&[1, 2, 3], 2, 64);

        let changes = before.diff(&after);
        assert!(!changes.is_empty());
        for change in &changes {
            assert_eq!(change.added, vec![3]);
            assert_eq!(change.removed.len(), 1);
            assert_ne!(change.removed[0], 3);
        }
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let ch = ConsistentHash::compute(&[1, 2, 3], 2, 64);
        assert!(ch.diff(&ch.clone()).is_empty());
    }

    #[test]
    fn test_union_keeps_current_first() {
        let current = ConsistentHash::compute(&[1, 2], 1, 32);
        let pending = ConsistentHash::compute(&[1, 2, 3], 1, 32);
        let union = current.union(&pending);

        assert_eq!(union.members(), &[1, 2, 3]);
        for segment in 0..32 {
            assert_eq!(union.primary_owner(segment), current.primary_owner(segment));
            assert!(union.is_owner(segment, pending.primary_owner(segment).unwrap()));
        }
    }

    #[test]
    fn test_without_members_reassigns_orphans() {
        let ch = ConsistentHash::compute(&[1, 2, 3], 1, 32);
        let pruned = ch.without_members(&[2]);

        assert_eq!(pruned.members(), &[1, 3]);
        for segment in 0..32 {
            let owners = pruned.owners_of(segment);
            assert_eq!(owners.len(), 1);
            assert!(!owners.contains(&2));
            if ch.primary_owner(segment) != Some(2) {
                assert_eq!(owners, ch.owners_of(segment));
            }
        }
    }

    #[test]
    fn test_segments_for() {
        let ch = ConsistentHash::compute(&[1, 2], 2, 16);
        assert_eq!(ch.segments_for(1).len(), 16);
        let primaries: usize = [1, 2]
            .iter()
            .map(|&n| ch.primary_segments_for(n).len())
            .sum();
        assert_eq!(primaries, 16);
        assert_eq!(ch.ownership_counts().get(&2), Some(&16));
    }
}
