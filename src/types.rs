//! Core types used throughout the grid.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// A segment of the keyspace, in `[0, num_segments)`.
pub type Segment = u32;

/// Generation counter of a cache topology.
pub type TopologyId = u64;

/// Name of a clustered cache.
pub type CacheName = SmolStr;

/// Protocol version spoken by a node.
///
/// Every command variant declares the version it was introduced in; a node refuses
/// commands introduced after its own version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeVersion {
    pub major: u8,
    pub minor: u8,
}

impl NodeVersion {
    pub const FOURTEEN: NodeVersion = NodeVersion::new(14, 0);
    pub const FIFTEEN: NodeVersion = NodeVersion::new(15, 0);
    pub const SIXTEEN: NodeVersion = NodeVersion::new(16, 0);

    /// The version of this build.
    pub const CURRENT: NodeVersion = NodeVersion::SIXTEEN;

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Logical recency of an entry.
///
/// Assigned by the primary owner when a write is applied. Ordered by topology first so
/// that a primary promoted by a rebalance always wins over its predecessor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryVersion {
    pub topology_id: TopologyId,
    pub sequence: u64,
}

impl EntryVersion {
    pub fn new(topology_id: TopologyId, sequence: u64) -> Self {
        Self {
            topology_id,
            sequence,
        }
    }
}

/// Cache statistics for one node.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Live entries held locally.
    pub entry_count: u64,
    /// Segments this node currently holds data for.
    pub owned_segments: usize,
    /// Number of local read hits.
    pub hits: u64,
    /// Number of local read misses.
    pub misses: u64,
}
