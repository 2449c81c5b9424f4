//! An in-process cluster of cache nodes connected by an [`InMemoryNetwork`].

use crate::cache::ClusteredCache;
use crate::cluster::MemberEvent;
use crate::config::GridConfig;
use crate::error::{Error, Result};
use crate::network::InMemoryNetwork;
use crate::testing::utils::wait_for;
use crate::types::{NodeId, TopologyId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Nodes of one cache, oldest first, plus the network between them.
///
/// Membership events are delivered by the harness itself, the way a failure
/// detector would deliver them.
pub struct LocalCluster {
    network: Arc<InMemoryNetwork>,
    base: GridConfig,
    nodes: Vec<Arc<ClusteredCache>>,
}

impl LocalCluster {
    /// An empty cluster whose nodes are configured from `base`.
    pub fn new(base: GridConfig) -> Self {
        Self {
            network: InMemoryNetwork::new(),
            base,
            nodes: Vec::new(),
        }
    }

    /// Start a cluster of nodes `1..=count` and wait until it is stable.
    pub async fn start(base: GridConfig, count: u64) -> Result<Self> {
        let mut cluster = Self::new(base);
        for node_id in 1..=count {
            cluster.add_node(node_id).await?;
        }
        cluster.wait_for_stable(Duration::from_secs(10)).await?;
        Ok(cluster)
    }

    /// Add a node configured from the base configuration.
    pub async fn add_node(&mut self, node_id: NodeId) -> Result<Arc<ClusteredCache>> {
        let mut config = self.base.clone();
        config.node_id = node_id;
        self.add_node_with(config).await
    }

    /// Add a node with its own configuration.
    ///
    /// Existing members hear about the joiner before it joins; with
    /// `await_initial_transfer` set, this returns once the joiner holds its data.
    pub async fn add_node_with(&mut self, config: GridConfig) -> Result<Arc<ClusteredCache>> {
        let node_id = config.node_id;
        if self.node(node_id).is_some() {
            return Err(Error::Config(format!("node {} already in the cluster", node_id)));
        }
        info!(node_id, "Adding node to local cluster");

        let cache = ClusteredCache::new(config, self.network.transport(node_id))?;
        self.network.register(node_id, cache.clone());

        let mut members = self.node_ids();
        for node in &self.nodes {
            node.on_member_event(MemberEvent::NodeJoin { node_id });
        }
        members.push(node_id);
        self.nodes.push(Arc::clone(&cache));

        cache.join(members).await?;
        Ok(cache)
    }

    /// Crash a node: detach it from the network, stop it and report it failed to the
    /// survivors.
    pub async fn remove_node(&mut self, node_id: NodeId) -> Result<()> {
        let position = self
            .nodes
            .iter()
            .position(|n| n.node_id() == node_id)
            .ok_or_else(|| Error::Config(format!("node {} not in the cluster", node_id)))?;
        info!(node_id, "Removing node from local cluster");

        let cache = self.nodes.remove(position);
        self.network.unregister(node_id);
        cache.shutdown().await;
        for node in &self.nodes {
            node.on_member_event(MemberEvent::NodeFailed { node_id });
        }
        Ok(())
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Arc<ClusteredCache>> {
        self.nodes.iter().find(|n| n.node_id() == node_id)
    }

    /// All running nodes, oldest first.
    pub fn nodes(&self) -> &[Arc<ClusteredCache>] {
        &self.nodes
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id()).collect()
    }

    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    /// Whether every node runs the same stable topology naming exactly the running
    /// nodes.
    pub fn is_stable(&self) -> bool {
        let Some(first) = self.nodes.first() else {
            return true;
        };
        let expected: BTreeSet<NodeId> = self.node_ids().into_iter().collect();
        let topology_id = first.current_topology().topology_id();
        self.nodes.iter().all(|node| {
            let topology = node.current_topology();
            let members: BTreeSet<NodeId> = topology.members().iter().copied().collect();
            topology.topology_id() == topology_id
                && topology.topology_id() > 0
                && !topology.is_rebalancing()
                && members == expected
                && node.is_initial_transfer_done()
        })
    }

    /// Wait until [`is_stable`](Self::is_stable) holds and return the agreed topology id.
    pub async fn wait_for_stable(&self, timeout: Duration) -> Result<TopologyId> {
        if !wait_for(|| self.is_stable(), timeout, Duration::from_millis(10)).await {
            return Err(Error::Timeout);
        }
        Ok(self
            .nodes
            .first()
            .map(|n| n.current_topology().topology_id())
            .unwrap_or_default())
    }

    /// Stop every node.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            self.network.unregister(node.node_id());
            node.shutdown().await;
        }
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("nodes", &self.node_ids())
            .finish()
    }
}
