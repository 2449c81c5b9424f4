//! Consistent hashing ring with virtual nodes.
//!
//! The ring is only used to compute segment ownership: each physical node is
//! represented by multiple virtual nodes, and a segment's owners are found by
//! walking clockwise from the segment's fixed position.

use crate::types::{NodeId, Segment};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per physical node.
/// More vnodes = more even distribution but higher memory usage.
pub const DEFAULT_VNODES_PER_NODE: usize = 256;

/// A consistent hash ring over a fixed member list.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual nodes mapped to their owning physical nodes.
    vnodes: BTreeMap<u64, NodeId>,

    /// Number of virtual nodes per physical node.
    vnodes_per_node: usize,

    /// Physical nodes, sorted and de-duplicated.
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Build a ring for the given members.
    ///
    /// Members are sorted before their vnodes are placed, so two callers with the same
    /// member set always build the same ring regardless of the order they list it in.
    pub fn new(members: &[NodeId]) -> Self {
        Self::with_vnodes(members, DEFAULT_VNODES_PER_NODE)
    }

    /// Build a ring with a custom vnode count.
    pub fn with_vnodes(members: &[NodeId], vnodes_per_node: usize) -> Self {
        let mut nodes = members.to_vec();
        nodes.sort_unstable();
        nodes.dedup();

        let mut vnodes = BTreeMap::new();
        for &node_id in &nodes {
            for i in 0..vnodes_per_node {
                let vnode_key = format!("{}:{}", node_id, i);
                // On a collision the larger node id keeps the slot, independent of
                // the order members were supplied in.
                vnodes
                    .entry(hash_bytes(vnode_key.as_bytes()))
                    .and_modify(|owner: &mut NodeId| *owner = (*owner).max(node_id))
                    .or_insert(node_id);
            }
        }

        Self {
            vnodes,
            vnodes_per_node,
            nodes,
        }
    }

    /// Get the number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get all physical nodes in the ring.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Get the number of virtual nodes per physical node.
    pub fn vnodes_per_node(&self) -> usize {
        self.vnodes_per_node
    }

    /// The fixed ring position of a segment.
    ///
    /// Segments are spread evenly over the hash space.
    pub fn segment_position(segment: Segment, num_segments: u32) -> u64 {
        let width = u64::MAX / u64::from(num_segments.max(1));
        width.saturating_mul(u64::from(segment))
    }

    /// Get up to `count` distinct owners starting at `position`, primary first.
    pub fn owners_at(&self, position: u64, count: usize) -> Vec<NodeId> {
        if self.vnodes.is_empty() || count == 0 {
            return Vec::new();
        }

        let wanted = count.min(self.nodes.len());
        let mut owners = Vec::with_capacity(wanted);

        let iter = self.vnodes.range(position..).chain(self.vnodes.iter());
        for (_, &node_id) in iter {
            if !owners.contains(&node_id) {
                owners.push(node_id);
                if owners.len() >= wanted {
                    break;
                }
            }
        }

        owners
    }

    /// Get up to `count` owners for a segment.
    pub fn segment_owners(&self, segment: Segment, num_segments: u32, count: usize) -> Vec<NodeId> {
        self.owners_at(Self::segment_position(segment, num_segments), count)
    }
}

/// Hash bytes with xxHash64 (seed 0).
pub(crate) fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}
