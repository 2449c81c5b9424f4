//! Partitioning of the keyspace into segments and segments onto nodes.
//!
//! Keys hash to a fixed number of segments; segments are assigned to nodes by
//! a consistent hash ring with virtual nodes:
//! - Deterministic: every node computes the same table from the same members
//! - Minimal movement when nodes join/leave
//! - Configurable replication (`num_owners`)
//!
//! # Architecture
//!
//! ```text
//! key "user:123" ──xxh64──▶ segment 17
//!                               │
//! ┌─────────────────────────────▼───────────────────────────────┐
//! │                     ConsistentHash                           │
//! │   segment 0  → [2, 3]                                        │
//! │   segment 17 → [1, 2]   (primary first)                      │
//! │   ...                                                        │
//! │        built by walking a HashRing of 256 vnodes per node    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use segment_grid::partitioning::{ConsistentHash, KeyPartitioner};
//!
//! let partitioner = KeyPartitioner::new(64);
//! let ch = ConsistentHash::compute(&[1, 2, 3], 2, 64);
//!
//! let segment = partitioner.segment_of(b"user:123");
//! let owners = ch.owners_of(segment);
//! assert_eq!(owners.len(), 2);
//! ```

mod consistent_hash;
mod hashring;

pub use consistent_hash::{ConsistentHash, KeyPartitioner, OwnershipChange};
pub use hashring::{HashRing, DEFAULT_VNODES_PER_NODE};
