//! Immutable snapshot of a cache's topology.

use crate::partitioning::ConsistentHash;
use crate::types::{NodeId, Segment, TopologyId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Phase of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyPhase {
    /// Only the current hash is in effect.
    Stable,
    /// A pending hash is being populated by state transfer.
    ///
    /// Reads use the current hash, writes go to the union of both.
    Rebalancing,
}

/// A generation of a cache's topology.
///
/// Never mutated after creation; a change produces a new snapshot with a higher
/// `topology_id`, published by the [`TopologyManager`](super::TopologyManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    topology_id: TopologyId,
    rebalance_id: u64,
    coordinator: NodeId,
    members: Vec<NodeId>,
    current_ch: ConsistentHash,
    pending_ch: Option<ConsistentHash>,
    union_ch: Option<ConsistentHash>,
}

impl CacheTopology {
    /// Topology in effect before the first one is installed.
    ///
    /// Has id 0, no members and no owners.
    pub fn empty(num_owners: usize, num_segments: u32) -> Self {
        Self {
            topology_id: 0,
            rebalance_id: 0,
            coordinator: 0,
            members: Vec::new(),
            current_ch: ConsistentHash::compute(&[], num_owners, num_segments),
            pending_ch: None,
            union_ch: None,
        }
    }

    /// A topology with no rebalance in flight.
    pub fn stable(
        topology_id: TopologyId,
        rebalance_id: u64,
        coordinator: NodeId,
        members: Vec<NodeId>,
        current_ch: ConsistentHash,
    ) -> Self {
        Self {
            topology_id,
            rebalance_id,
            coordinator,
            members,
            current_ch,
            pending_ch: None,
            union_ch: None,
        }
    }

    /// A topology moving ownership from `current_ch` to `pending_ch`.
    pub fn rebalancing(
        topology_id: TopologyId,
        rebalance_id: u64,
        coordinator: NodeId,
        members: Vec<NodeId>,
        current_ch: ConsistentHash,
        pending_ch: ConsistentHash,
    ) -> Self {
        let union_ch = current_ch.union(&pending_ch);
        Self {
            topology_id,
            rebalance_id,
            coordinator,
            members,
            current_ch,
            pending_ch: Some(pending_ch),
            union_ch: Some(union_ch),
        }
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn rebalance_id(&self) -> u64 {
        self.rebalance_id
    }

    /// Node that created this topology.
    pub fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    /// Membership view, oldest member first.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.members.contains(&node_id)
    }

    pub fn phase(&self) -> TopologyPhase {
        if self.pending_ch.is_some() {
            TopologyPhase::Rebalancing
        } else {
            TopologyPhase::Stable
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.phase() == TopologyPhase::Rebalancing
    }

    pub fn current_ch(&self) -> &ConsistentHash {
        &self.current_ch
    }

    pub fn pending_ch(&self) -> Option<&ConsistentHash> {
        self.pending_ch.as_ref()
    }

    /// Hash used to route reads.
    pub fn read_ch(&self) -> &ConsistentHash {
        &self.current_ch
    }

    /// Hash used to route writes: the union while rebalancing.
    pub fn write_ch(&self) -> &ConsistentHash {
        self.union_ch.as_ref().unwrap_or(&self.current_ch)
    }

    /// Owners serving reads for a segment, primary first.
    pub fn read_owners(&self, segment: Segment) -> &[NodeId] {
        self.read_ch().owners_of(segment)
    }

    /// Owners receiving writes for a segment, primary first.
    pub fn write_owners(&self, segment: Segment) -> &[NodeId] {
        self.write_ch().owners_of(segment)
    }

    /// Node that assigns versions to writes on a segment.
    pub fn primary_owner(&self, segment: Segment) -> Option<NodeId> {
        self.current_ch.primary_owner(segment)
    }

    /// Check if a node is gaining a segment in this rebalance.
    pub fn is_pending_owner(&self, segment: Segment, node_id: NodeId) -> bool {
        match &self.pending_ch {
            Some(pending) => {
                pending.is_owner(segment, node_id) && !self.current_ch.is_owner(segment, node_id)
            }
            None => false,
        }
    }

    /// Segments a node must receive before the rebalance can complete.
    pub fn inbound_segments(&self, node_id: NodeId) -> BTreeSet<Segment> {
        match &self.pending_ch {
            Some(pending) => pending
                .segments_for(node_id)
                .into_iter()
                .filter(|&segment| !self.current_ch.is_owner(segment, node_id))
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Node that pushes `segment` to `destination`.
    ///
    /// The first current owner that is still a member and is not the destination.
    /// `None` when every previous owner is gone, in which case the segment starts empty.
    pub fn transfer_source(&self, segment: Segment, destination: NodeId) -> Option<NodeId> {
        self.current_ch
            .owners_of(segment)
            .iter()
            .copied()
            .find(|&owner| owner != destination && self.is_member(owner))
    }

    /// Segments a node must push, grouped by destination.
    pub fn outbound_segments(&self, source: NodeId) -> Vec<(NodeId, Vec<Segment>)> {
        let Some(pending) = &self.pending_ch else {
            return Vec::new();
        };

        let mut outbound: std::collections::BTreeMap<NodeId, Vec<Segment>> = Default::default();
        for change in self.current_ch.diff(pending) {
            for &destination in &change.added {
                if self.transfer_source(change.segment, destination) == Some(source) {
                    outbound.entry(destination).or_default().push(change.segment);
                }
            }
        }
        outbound.into_iter().collect()
    }
}
