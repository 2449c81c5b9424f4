//! Testing utilities for clustered caches.
//!
//! [`LocalCluster`] runs any number of cache nodes in one process over an
//! [`InMemoryNetwork`](crate::network::InMemoryNetwork). The harness plays the part of
//! the failure detector: joins and crashes are reported to the other nodes as
//! membership events.
//!
//! # Example
//!
//! ```rust,no_run
//! use segment_grid::{GridConfig, LocalCluster};
//! use std::time::Duration;
//!
//! # async fn example() -> segment_grid::Result<()> {
//! let mut cluster = LocalCluster::start(GridConfig::default().with_num_owners(2), 3).await?;
//!
//! cluster.nodes()[0].put("key", "value").await?;
//!
//! // Crash a node and wait for the survivors to rebalance
//! cluster.remove_node(2).await?;
//! cluster.wait_for_stable(Duration::from_secs(5)).await?;
//!
//! cluster.network().drop_next_reply(3);
//! # Ok(())
//! # }
//! ```

mod cluster;
mod utils;

#[cfg(test)]
mod cluster_tests;
#[cfg(test)]
mod dispatch_tests;

pub use cluster::LocalCluster;
pub use utils::wait_for_result;
