//! Routing of commands to their owners, with retry on topology change.
//!
//! ```text
//! dispatch(cmd)
//!   loop:
//!     stamp cmd with current topology id
//!     route by command type ──▶ local executor / remote owners ──▶ collector
//!     retryable failure? ──▶ wait for a newer topology, try again
//! ```

use crate::commands::{Command, CommandExecutor, Flags, ReadOnlyManyCommand};
use crate::config::{GridConfig, ReadPolicy};
use crate::dispatch::collector::{
    FirstSuccessCollector, PassthroughMapCollector, UnanimousCollector,
};
use crate::dispatch::response::{Response, ResponseValue};
use crate::dispatch::rpc::RpcManager;
use crate::error::{Error, Result, TopologyError};
use crate::metrics::GridMetrics;
use crate::network::Message;
use crate::partitioning::KeyPartitioner;
use crate::statetransfer::StateTransferManager;
use crate::topology::{CacheTopology, TopologyManager};
use crate::types::{NodeId, Segment};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Upper bound of the random pause between retries.
const RETRY_JITTER_MS: u64 = 10;

/// Run a command on one target, locally when the target is this node.
async fn invoke_on(
    executor: &CommandExecutor,
    rpc: &RpcManager,
    target: NodeId,
    command: &Command,
) -> Result<ResponseValue> {
    if target == rpc.local_node() {
        return executor.execute(target, command.clone()).await;
    }
    let mut values = rpc
        .invoke_command(&[target], command, UnanimousCollector::with_expected(1))
        .await?;
    Ok(values.remove(&target).unwrap_or_default())
}

/// Sends commands to the nodes that own their keys.
pub struct CommandDispatcher {
    local: NodeId,
    config: Arc<GridConfig>,
    partitioner: KeyPartitioner,
    topology: Arc<TopologyManager>,
    state_transfer: Arc<StateTransferManager>,
    executor: Arc<CommandExecutor>,
    rpc: Arc<RpcManager>,
    metrics: Arc<GridMetrics>,
}

impl CommandDispatcher {
    pub fn new(
        config: Arc<GridConfig>,
        topology: Arc<TopologyManager>,
        state_transfer: Arc<StateTransferManager>,
        executor: Arc<CommandExecutor>,
        rpc: Arc<RpcManager>,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        Self {
            local: config.node_id,
            partitioner: KeyPartitioner::new(config.num_segments),
            config,
            topology,
            state_transfer,
            executor,
            rpc,
            metrics,
        }
    }

    /// Dispatch a command and wait for its result.
    ///
    /// Failures caused by a topology change are retried against the newer topology,
    /// up to the configured number of retries.
    pub async fn dispatch(&self, mut command: Command) -> Result<ResponseValue> {
        self.metrics.record_command(command.name());

        if command.flags().contains(Flags::CACHE_MODE_LOCAL) {
            return self.executor.execute(self.local, command).await;
        }
        if self.config.await_initial_transfer
            && !command.flags().contains(Flags::SKIP_TRANSFER_WAIT)
            && !self.state_transfer.is_initial_transfer_done()
        {
            debug!(command = command.name(), "Waiting for initial state transfer");
            self.state_transfer
                .await_initial_transfer(self.config.state_transfer.timeout)
                .await?;
        }
        if !command.is_return_value_expected() {
            return self.dispatch_one_way(command).await;
        }

        let max_retries = self.config.dispatch.max_retries;
        let mut retries = 0;
        loop {
            let topology = self.ready_topology().await?;
            command.set_topology_id(topology.topology_id());

            let error = match self.dispatch_once(&command, &topology).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if retries >= max_retries {
                warn!(
                    command = command.name(),
                    attempts = retries + 1,
                    error = %error,
                    "Giving up after retries"
                );
                return Err(TopologyError::RetriesExhausted {
                    attempts: retries + 1,
                }
                .into());
            }
            retries += 1;
            self.metrics.record_retry();

            let wanted = error
                .topology_hint()
                .unwrap_or_default()
                .max(topology.topology_id() + 1);
            debug!(
                command = command.name(),
                retry = retries,
                topology_id = topology.topology_id(),
                wanted,
                error = %error,
                "Retrying command"
            );
            match self
                .topology
                .await_topology(wanted, self.config.dispatch.retry_wait)
                .await
            {
                Ok(_) | Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
            let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    /// The installed topology, waiting for the first one if needed.
    async fn ready_topology(&self) -> Result<Arc<CacheTopology>> {
        let topology = self.topology.current();
        if topology.topology_id() > 0 {
            return Ok(topology);
        }
        self.topology
            .await_topology(1, self.config.state_transfer.timeout)
            .await
            .map_err(|e| match e {
                Error::Timeout => TopologyError::NotInstalled.into(),
                other => other,
            })
    }

    async fn dispatch_once(
        &self,
        command: &Command,
        topology: &CacheTopology,
    ) -> Result<ResponseValue> {
        trace!(
            command = command.name(),
            topology_id = topology.topology_id(),
            "Dispatching"
        );
        match command {
            Command::Get(get) => {
                self.dispatch_read(command, get.segment, get.flags, topology)
                    .await
            }
            Command::Write(write) => {
                let primary = topology
                    .primary_owner(write.segment)
                    .ok_or(TopologyError::NoOwners(write.segment))?;
                invoke_on(&self.executor, &self.rpc, primary, command).await
            }
            Command::Touch(touch) => {
                let values = self
                    .invoke_write_owners(command, touch.segment, topology)
                    .await?;
                Ok(ResponseValue::Bool(
                    values.values().all(|v| v.as_bool() == Some(true)),
                ))
            }
            Command::BackupWrite(backup) => {
                self.invoke_write_owners(command, backup.segment, topology)
                    .await?;
                Ok(ResponseValue::Empty)
            }
            Command::ReadOnlyMany(read) => self.dispatch_read_many(read, topology).await,
            Command::ClearCrossSiteStatus(_) => self.dispatch_one_way(command.clone()).await,
            Command::TopologyInfo(_) => self.executor.execute(self.local, command.clone()).await,
        }
    }

    /// Run a command on every member of the current topology and return each
    /// member's response, failures included.
    pub async fn dispatch_to_members(&self, command: Command) -> Result<BTreeMap<NodeId, Response>> {
        self.metrics.record_command(command.name());
        let topology = self.ready_topology().await?;
        let members = topology.members();

        let mut seed = Vec::new();
        if members.contains(&self.local) {
            let local = self.executor.execute(self.local, command.clone()).await;
            seed.push((self.local, Response::from_result(local)));
        }
        let remote: Vec<NodeId> = members
            .iter()
            .copied()
            .filter(|&n| n != self.local)
            .collect();
        trace!(command = command.name(), targets = members.len(), "Dispatching to members");
        self.rpc
            .invoke_command_seeded(
                &remote,
                &command,
                PassthroughMapCollector::with_expected(seed.len() + remote.len()),
                seed,
            )
            .await
    }

    async fn dispatch_read(
        &self,
        command: &Command,
        segment: Segment,
        flags: Flags,
        topology: &CacheTopology,
    ) -> Result<ResponseValue> {
        let owners = topology.read_owners(segment);
        if owners.contains(&self.local) {
            return self.executor.execute(self.local, command.clone()).await;
        }

        if topology.is_pending_owner(segment, self.local)
            && self.config.state_transfer.read_policy == ReadPolicy::Wait
            && !flags.contains(Flags::SKIP_TRANSFER_WAIT)
        {
            debug!(segment, "Waiting for segment in transfer");
            self.state_transfer
                .await_segment(segment, self.config.state_transfer.timeout)
                .await?;
            return self.executor.execute(self.local, command.clone()).await;
        }

        if owners.is_empty() {
            return Err(TopologyError::NoOwners(segment).into());
        }
        self.rpc
            .invoke_command(owners, command, FirstSuccessCollector::with_expected(owners.len()))
            .await
    }

    /// Run a command on every write owner of a segment, this node included.
    async fn invoke_write_owners(
        &self,
        command: &Command,
        segment: Segment,
        topology: &CacheTopology,
    ) -> Result<BTreeMap<NodeId, ResponseValue>> {
        let owners = topology.write_owners(segment);
        if owners.is_empty() {
            return Err(TopologyError::NoOwners(segment).into());
        }

        let mut seed = Vec::new();
        if owners.contains(&self.local) {
            let local = self.executor.execute(self.local, command.clone()).await;
            seed.push((self.local, Response::from_result(local)));
        }
        let remote: Vec<NodeId> = owners
            .iter()
            .copied()
            .filter(|&n| n != self.local)
            .collect();
        self.rpc
            .invoke_command_seeded(
                &remote,
                command,
                UnanimousCollector::with_expected(owners.len()),
                seed,
            )
            .await
    }

    /// Split the keys by the node that reads them, run each part there and put the
    /// results back in key order.
    async fn dispatch_read_many(
        &self,
        read: &ReadOnlyManyCommand,
        topology: &CacheTopology,
    ) -> Result<ResponseValue> {
        let mut groups: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        for (index, key) in read.keys.iter().enumerate() {
            let segment = self.partitioner.segment_of(key);
            let target = if topology.read_owners(segment).contains(&self.local) {
                self.local
            } else {
                topology
                    .primary_owner(segment)
                    .ok_or(TopologyError::NoOwners(segment))?
            };
            groups.entry(target).or_default().push(index);
        }
        trace!(keys = read.keys.len(), targets = groups.len(), "Read-many grouped");

        let mut set = JoinSet::new();
        for (target, indices) in groups {
            let keys = indices.iter().map(|&i| read.keys[i].clone()).collect();
            let part = Command::ReadOnlyMany(read.with_keys(keys));
            let executor = Arc::clone(&self.executor);
            let rpc = Arc::clone(&self.rpc);
            set.spawn(async move {
                let result = invoke_on(&executor, &rpc, target, &part).await;
                (indices, result)
            });
        }

        let mut values = vec![None; read.keys.len()];
        while let Some(joined) = set.join_next().await {
            let (indices, result) =
                joined.map_err(|e| Error::Internal(format!("read-many task failed: {}", e)))?;
            let part = result?.into_values();
            if part.len() != indices.len() {
                return Err(Error::Internal(format!(
                    "expected {} read-many results, got {}",
                    indices.len(),
                    part.len()
                )));
            }
            for (index, value) in indices.into_iter().zip(part) {
                values[index] = value;
            }
        }
        Ok(ResponseValue::Values(values))
    }

    /// Send a command to every member without waiting for answers, and run it here.
    async fn dispatch_one_way(&self, command: Command) -> Result<ResponseValue> {
        let targets: Vec<NodeId> = self
            .topology
            .current()
            .members()
            .iter()
            .copied()
            .filter(|&n| n != self.local)
            .collect();
        let delivered = self
            .rpc
            .broadcast_one_way(&targets, &Message::Command(command.clone()))
            .await?;
        debug!(
            command = command.name(),
            delivered,
            targets = targets.len(),
            "Sent one-way command"
        );
        self.executor.execute(self.local, command).await?;
        Ok(ResponseValue::Empty)
    }
}
