//! Topology, dispatch and state-transfer core of a segmented in-memory data grid.
//!
//! Cooperating nodes jointly own a keyspace split into a fixed number of segments.
//! Segments are assigned to nodes by a consistent hash; when nodes join, leave or
//! fail, a coordinator publishes a new topology and the affected segments move to
//! their new owners while reads and writes keep working.
//!
//! # Example
//!
//! ```rust,no_run
//! use segment_grid::{ClusteredCache, GridConfig, InMemoryNetwork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = InMemoryNetwork::new();
//!
//!     let config = GridConfig::new(1).with_num_owners(2);
//!     let cache = ClusteredCache::new(config, network.transport(1))?;
//!     network.register(1, cache.clone());
//!     cache.join(vec![1]).await?;
//!
//!     cache.put("user:123", "Alice").await?;
//!     assert!(cache.get("user:123").await?.is_some());
//!
//!     cache.increment("visits", 1).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              ClusteredCache                 │
//! │  get / put / remove / increment / touch     │
//! │  read_many / clear_cross_site_status        │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │            CommandDispatcher                │
//! │  route to owners, collect, retry on change  │
//! └─────────────────────────────────────────────┘
//!        │                     │
//!        ▼                     ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────────┐
//! │ Command      │     │ RpcManager   │────▶│ Transport            │
//! │ Executor     │     │ + collectors │     │ (in-memory or TCP)   │
//! └──────────────┘     └──────────────┘     └──────────────────────┘
//!        │
//!        ▼
//! ┌──────────────┐  ┌──────────────────┐  ┌───────────────────────┐
//! │ DataContainer│◀─│ StateTransfer    │◀─│ TopologyManager       │
//! │ (segments)   │  │ Manager          │  │ (CacheTopology watch) │
//! └──────────────┘  └──────────────────┘  └───────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: applied by the segment's primary owner, which versions them and
//!   replicates to every other write owner before answering
//! - **Reads**: served by any read owner
//! - **Rebalance**: while segments move, writes reach both old and new owners; reads
//!   stay on the old owners until the move completes
//!
//! Data lives in memory only; losing every owner of a segment loses its entries.

pub mod cache;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod statetransfer;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use cache::ClusteredCache;
pub use config::{DispatchConfig, GridConfig, ReadPolicy, StateTransferConfig};
pub use error::{Error, Result};
pub use types::{CacheName, CacheStats, EntryVersion, NodeId, NodeVersion, Segment, TopologyId};

// Re-export cluster types
pub use cluster::{MemberEvent, MemberEventListener};

// Re-export command types
pub use commands::{CacheLoader, Command, CommandKind, Flags, FunctionRegistry, LoadType, Params};

// Re-export dispatch types
pub use dispatch::{
    FirstSuccessCollector, NodeStatus, PassthroughMapCollector, Response, ResponseCollector,
    ResponseValue, UnanimousCollector,
};

// Re-export network types
pub use network::{FrameHandler, InMemoryNetwork, NetworkServer, TcpTransport, Transport};

// Re-export partitioning types
pub use partitioning::{ConsistentHash, HashRing, KeyPartitioner};

// Re-export state transfer types
pub use statetransfer::{CrossSiteStateTransfer, PushStatus, TransferProgress};

// Re-export topology types
pub use topology::{CacheTopology, TopologyPhase};

// Re-export metrics types
pub use metrics::{Counter, Gauge, GridMetrics, LabeledCounter, MetricsSnapshot};

// Re-export testing types
pub use testing::LocalCluster;
