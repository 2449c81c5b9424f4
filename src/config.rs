//! Configuration types for a clustered cache.
//!
//! All values arrive already resolved; there is no file format or builder
//! validation framework here, only plain structs with `with_*` setters.

use crate::error::{Error, Result};
use crate::types::{CacheName, NodeId, NodeVersion};
use std::time::Duration;

/// Main configuration for one clustered cache on one node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Name of the cache.
    pub cache_name: CacheName,

    /// Protocol version this node speaks.
    pub node_version: NodeVersion,

    /// Number of owners per segment (primary + backups).
    pub num_owners: usize,

    /// Number of segments in the keyspace. Fixed for the life of the cache.
    pub num_segments: u32,

    /// Whether membership changes trigger a rebalance.
    pub rebalance_enabled: bool,

    /// Whether local operations block until the join transfer completes.
    pub await_initial_transfer: bool,

    /// State transfer configuration.
    pub state_transfer: StateTransferConfig,

    /// Command dispatch configuration.
    pub dispatch: DispatchConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cache_name: CacheName::new_inline("default"),
            node_version: NodeVersion::CURRENT,
            num_owners: 2,
            num_segments: 256,
            rebalance_enabled: true,
            await_initial_transfer: true,
            state_transfer: StateTransferConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the cache name.
    pub fn with_cache_name(mut self, name: impl AsRef<str>) -> Self {
        self.cache_name = CacheName::new(name);
        self
    }

    /// Set the protocol version this node advertises.
    pub fn with_node_version(mut self, version: NodeVersion) -> Self {
        self.node_version = version;
        self
    }

    /// Set the number of owners per segment.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Enable or disable rebalancing.
    pub fn with_rebalance_enabled(mut self, enabled: bool) -> Self {
        self.rebalance_enabled = enabled;
        self
    }

    /// Block local operations until the initial transfer completes.
    pub fn with_await_initial_transfer(mut self, enabled: bool) -> Self {
        self.await_initial_transfer = enabled;
        self
    }

    /// Set state transfer configuration.
    pub fn with_state_transfer(mut self, state_transfer: StateTransferConfig) -> Self {
        self.state_transfer = state_transfer;
        self
    }

    /// Set dispatch configuration.
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Check the resolved parameters for values the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be at least 1".into()));
        }
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be at least 1".into()));
        }
        if self.state_transfer.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".into()));
        }
        if self.state_transfer.blocking_pool_size == 0 {
            return Err(Error::Config("blocking_pool_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// How reads behave for segments the local node is still receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Read from a current owner that already holds the data.
    Redirect,
    /// Block until the segment's transfer completes.
    Wait,
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Maximum entries per transferred chunk.
    pub chunk_size: usize,

    /// Upper bound for the initial transfer and for waiting on a segment.
    pub timeout: Duration,

    /// Read behaviour for segments still in transfer.
    pub read_policy: ReadPolicy,

    /// Maximum concurrent chunk applications on the blocking pool.
    pub blocking_pool_size: usize,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            timeout: Duration::from_secs(240),
            read_policy: ReadPolicy::Redirect,
            blocking_pool_size: 4,
        }
    }
}

impl StateTransferConfig {
    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the read policy.
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    /// Set the blocking pool size.
    pub fn with_blocking_pool_size(mut self, size: usize) -> Self {
        self.blocking_pool_size = size;
        self
    }
}

/// Command dispatch configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Retries against refreshed topologies before giving up.
    pub max_retries: u32,

    /// Timeout for a single remote invocation.
    pub rpc_timeout: Duration,

    /// How long a retry waits for a newer topology before trying again anyway.
    pub retry_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            rpc_timeout: Duration::from_secs(15),
            retry_wait: Duration::from_millis(500),
        }
    }
}

impl DispatchConfig {
    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the retry wait.
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }
}
