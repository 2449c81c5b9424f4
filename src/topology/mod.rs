//! Cache topologies and their installation.
//!
//! A [`CacheTopology`] is an immutable snapshot of who owns which segment; the
//! [`TopologyManager`] installs new snapshots in increasing id order and, on the
//! coordinator, decides when a rebalance starts and ends.

pub mod cache_topology;
pub mod manager;

pub use cache_topology::{CacheTopology, TopologyPhase};
pub use manager::TopologyManager;
