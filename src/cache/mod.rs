//! Clustered cache implementation.

pub mod container;

use crate::cluster::{MemberEvent, MemberEventListener};
use crate::commands::{
    CacheLoader, ClearCrossSiteStatusCommand, Command, CommandExecutor, Flags, FunctionRegistry,
    GetCommand, Params, ReadOnlyManyCommand, TopologyInfoCommand, TouchCommand, WriteCommand,
    WriteOp,
};
use crate::config::GridConfig;
use crate::dispatch::{CommandDispatcher, NodeStatus, Response, ResponseValue, RpcManager};
use crate::error::{CommandError, Error, Result};
use crate::metrics::GridMetrics;
use crate::network::{FrameHandler, Message, Transport};
use crate::partitioning::KeyPartitioner;
use crate::statetransfer::{CrossSiteStateTransfer, StateTransferManager, TransferProgress};
use crate::topology::{CacheTopology, TopologyManager};
use crate::types::{CacheStats, NodeId, Segment, TopologyId};
use async_trait::async_trait;
use bytes::Bytes;
use container::DataContainer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One node's share of a clustered cache.
///
/// Operations are routed to the owners of their keys under the current topology;
/// membership changes are fed in through [`on_member_event`](Self::on_member_event)
/// and frames from other nodes through the [`FrameHandler`] implementation.
pub struct ClusteredCache {
    config: Arc<GridConfig>,
    partitioner: KeyPartitioner,

    metrics: Arc<GridMetrics>,

    /// Local entries.
    container: Arc<DataContainer>,

    rpc: Arc<RpcManager>,

    topology: Arc<TopologyManager>,

    state_transfer: Arc<StateTransferManager>,

    xsite: Arc<CrossSiteStateTransfer>,

    executor: Arc<CommandExecutor>,

    dispatcher: CommandDispatcher,

    /// Stops the background loops.
    shutdown: CancellationToken,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusteredCache {
    /// Create a cache node on top of a transport.
    ///
    /// Starts the topology and state transfer loops, so this must be called inside a
    /// Tokio runtime. The node takes part in the cluster once [`join`](Self::join) is
    /// called.
    pub fn new(config: GridConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        info!(
            node_id = config.node_id,
            cache = %config.cache_name,
            version = %config.node_version,
            "Starting clustered cache"
        );

        let metrics = Arc::new(GridMetrics::new());
        let container = Arc::new(DataContainer::new(config.num_segments));
        let rpc = Arc::new(RpcManager::new(
            config.node_id,
            config.node_version,
            transport,
            config.dispatch.rpc_timeout,
        ));
        let topology = Arc::new(TopologyManager::new(
            Arc::clone(&config),
            Arc::clone(&rpc),
            Arc::clone(&metrics),
        ));
        let state_transfer = Arc::new(StateTransferManager::new(
            Arc::clone(&config),
            Arc::clone(&container),
            Arc::clone(&topology),
            Arc::clone(&rpc),
            Arc::clone(&metrics),
        ));
        let xsite = Arc::new(CrossSiteStateTransfer::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&config),
            Arc::clone(&container),
            Arc::clone(&topology),
            Arc::clone(&state_transfer),
            Arc::clone(&rpc),
            Arc::clone(&xsite),
            Arc::new(FunctionRegistry::with_builtins()),
            Arc::clone(&metrics),
        ));
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&config),
            Arc::clone(&topology),
            Arc::clone(&state_transfer),
            Arc::clone(&executor),
            Arc::clone(&rpc),
            Arc::clone(&metrics),
        );

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.extend(topology.spawn(shutdown.clone()));
        tasks.push(state_transfer.spawn(shutdown.clone()));

        Ok(Arc::new(Self {
            partitioner: KeyPartitioner::new(config.num_segments),
            config,
            metrics,
            container,
            rpc,
            topology,
            state_transfer,
            xsite,
            executor,
            dispatcher,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Join the cluster formed by `members`, oldest first.
    ///
    /// With `await_initial_transfer` set, returns once this node holds its share of the
    /// data.
    pub async fn join(&self, members: Vec<NodeId>) -> Result<()> {
        info!(node_id = self.node_id(), ?members, "Joining cluster");
        self.topology.start(members);
        if self.config.await_initial_transfer {
            self.state_transfer
                .await_initial_transfer(self.config.state_transfer.timeout)
                .await?;
            info!(node_id = self.node_id(), "Initial state transfer complete");
        }
        Ok(())
    }

    /// Feed a membership change.
    pub fn on_member_event(&self, event: MemberEvent) {
        debug!(node_id = self.node_id(), ?event, "Member event");
        self.topology.on_event(event);
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Segment a key belongs to.
    pub fn segment_of(&self, key: &[u8]) -> Segment {
        self.partitioner.segment_of(key)
    }

    // ==================== Data operations ====================

    /// Get a value.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.get_with_flags(key, Flags::NONE).await
    }

    /// Get a value with explicit flags.
    pub async fn get_with_flags(&self, key: impl Into<Bytes>, flags: Flags) -> Result<Option<Bytes>> {
        let key = key.into();
        let command = Command::Get(GetCommand {
            cache: self.config.cache_name.clone(),
            segment: self.segment_of(&key),
            key,
            flags,
            topology_id: 0,
        });
        Ok(self.dispatch(command).await?.into_value())
    }

    /// Store a value, returning the previous one.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.put_with_expiration(key, value, None, None).await
    }

    /// Store a value that expires after `lifespan`, or after going unused for
    /// `max_idle`.
    pub async fn put_with_expiration(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> Result<Option<Bytes>> {
        let op = WriteOp::Put {
            value: value.into(),
            lifespan,
            max_idle,
        };
        Ok(self.write(key.into(), op, Flags::NONE).await?.into_value())
    }

    /// Remove a value, returning the previous one.
    pub async fn remove(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        Ok(self
            .write(key.into(), WriteOp::Remove, Flags::NONE)
            .await?
            .into_value())
    }

    /// Add `delta` to a counter stored as a big-endian `i64`, returning the new value.
    /// A missing counter starts at zero.
    pub async fn increment(&self, key: impl Into<Bytes>, delta: i64) -> Result<i64> {
        let value = self
            .write(key.into(), WriteOp::Increment { delta }, Flags::NONE)
            .await?
            .into_value()
            .unwrap_or_default();
        let raw: [u8; 8] = value.as_ref().try_into().map_err(|_| {
            CommandError::InvalidValue(format!("counter reply of {} bytes", value.len()))
        })?;
        Ok(i64::from_be_bytes(raw))
    }

    async fn write(&self, key: Bytes, op: WriteOp, flags: Flags) -> Result<ResponseValue> {
        let command = Command::Write(WriteCommand {
            cache: self.config.cache_name.clone(),
            segment: self.segment_of(&key),
            key,
            flags,
            topology_id: 0,
            op,
            invocation_id: Uuid::new_v4(),
        });
        self.dispatch(command).await
    }

    /// Refresh an entry's last-access time on every owner. Returns whether every owner
    /// held a touchable entry.
    pub async fn touch(&self, key: impl Into<Bytes>, touch_even_if_expired: bool) -> Result<bool> {
        let key = key.into();
        let command = Command::Touch(TouchCommand {
            cache: self.config.cache_name.clone(),
            segment: self.segment_of(&key),
            key,
            flags: Flags::NONE,
            topology_id: 0,
            touch_even_if_expired,
        });
        Ok(self.dispatch(command).await?.as_bool().unwrap_or(false))
    }

    /// Apply a registered read-only function to many keys. Results come back in key
    /// order.
    pub async fn read_many(
        &self,
        keys: Vec<Bytes>,
        function: &str,
        params: Params,
    ) -> Result<Vec<Option<Bytes>>> {
        let command = Command::ReadOnlyMany(ReadOnlyManyCommand {
            cache: self.config.cache_name.clone(),
            keys,
            function: function.into(),
            params,
            flags: Flags::NONE,
            topology_id: 0,
        });
        Ok(self.dispatch(command).await?.into_values())
    }

    /// Reset cross-site push status on every node. Nothing is waited for.
    pub async fn clear_cross_site_status(&self) -> Result<()> {
        let command = Command::ClearCrossSiteStatus(ClearCrossSiteStatusCommand {
            cache: self.config.cache_name.clone(),
        });
        self.dispatch(command).await?;
        Ok(())
    }

    /// Dispatch any command.
    pub async fn dispatch(&self, command: Command) -> Result<ResponseValue> {
        self.dispatcher.dispatch(command).await
    }

    // ==================== Topology ====================

    pub fn current_topology(&self) -> Arc<CacheTopology> {
        self.topology.current()
    }

    /// Wait until a topology with at least `topology_id` is installed.
    pub async fn await_topology(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        self.topology.await_topology(topology_id, timeout).await
    }

    pub fn is_coordinator(&self) -> bool {
        self.topology.is_coordinator()
    }

    /// Ask every member for its topology and transfer state.
    ///
    /// A member that cannot answer is reported with its error instead of failing the
    /// whole query.
    pub async fn cluster_status(&self) -> Result<BTreeMap<NodeId, Result<NodeStatus>>> {
        let command = Command::TopologyInfo(TopologyInfoCommand {
            cache: self.config.cache_name.clone(),
        });
        let responses = self.dispatcher.dispatch_to_members(command).await?;
        Ok(responses
            .into_iter()
            .map(|(node, response)| {
                let status = response.into_result(node).and_then(|value| {
                    value.as_status().ok_or_else(|| {
                        Error::Internal(format!("node {} sent no topology status", node))
                    })
                });
                (node, status)
            })
            .collect())
    }

    /// Suspend or resume rebalancing. Only the coordinator's setting matters.
    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        self.topology.set_rebalancing_enabled(enabled);
    }

    /// Ask the coordinator for a rebalance towards the current membership.
    pub fn request_rebalance(&self) {
        self.topology.request_rebalance();
    }

    pub fn is_initial_transfer_done(&self) -> bool {
        self.state_transfer.is_initial_transfer_done()
    }

    /// Progress of the running inbound transfer, if any.
    pub fn transfer_progress(&self) -> Option<TransferProgress> {
        self.state_transfer.progress()
    }

    // ==================== Local state ====================

    pub fn set_loader(&self, loader: Option<Arc<dyn CacheLoader>>) {
        self.executor.set_loader(loader);
    }

    /// Registry of functions usable with [`read_many`](Self::read_many).
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        self.executor.functions()
    }

    pub fn cross_site(&self) -> &Arc<CrossSiteStateTransfer> {
        &self.xsite
    }

    pub fn metrics(&self) -> &Arc<GridMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> CacheStats {
        self.container.stats()
    }

    /// Live entries held by this node.
    pub fn local_entry_count(&self) -> usize {
        self.container.size()
    }

    /// Read the local copy of a key, without routing or statistics.
    pub fn peek_local(&self, key: &[u8]) -> Option<Bytes> {
        self.container
            .peek(self.segment_of(key), key)
            .and_then(|e| e.value)
    }

    /// Remove expired entries held by this node.
    pub fn purge_expired(&self) -> usize {
        self.container.purge_expired()
    }

    /// Stop the background loops and cancel transfers in flight.
    pub async fn shutdown(&self) {
        info!(node_id = self.node_id(), "Shutting down clustered cache");
        self.shutdown.cancel();
        self.state_transfer.cancel_all();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
    }

    async fn handle_message(&self, origin: NodeId, message: Message) -> Option<Message> {
        match message {
            Message::Command(command) => {
                let expected = command.is_return_value_expected();
                let result = self.executor.execute(origin, command).await;
                expected.then(|| Message::Response(Response::from_result(result)))
            }
            Message::TopologyUpdate(update) => {
                if update.cache != self.config.cache_name {
                    warn!(cache = %update.cache, "Topology for unknown cache");
                } else {
                    self.topology.install(update.topology);
                }
                Some(Message::Response(Response::Success(ResponseValue::Empty)))
            }
            Message::RebalanceConfirm(confirm) => {
                self.topology
                    .on_rebalance_confirm(confirm.node, confirm.topology_id);
                Some(Message::Response(Response::Success(ResponseValue::Empty)))
            }
            Message::StateChunk(chunk) => {
                match self.state_transfer.apply_chunk(origin, chunk).await {
                    Ok(ack) => Some(Message::ChunkAck(ack)),
                    Err(e) => Some(Message::Response(Response::from_result(Err(e)))),
                }
            }
            Message::Response(_) | Message::ChunkAck(_) => {
                debug!(origin, "Ignoring unsolicited reply");
                None
            }
        }
    }
}

#[async_trait]
impl FrameHandler for ClusteredCache {
    async fn handle_frame(&self, frame: Bytes) -> Option<Bytes> {
        let codec = *self.rpc.codec();
        let reply = match codec.decode(frame) {
            Ok(envelope) => {
                self.handle_message(envelope.origin, envelope.message)
                    .await?
            }
            Err(e) => {
                warn!(node_id = self.node_id(), error = %e, "Rejecting frame");
                Message::Response(Response::from_result(Err(e)))
            }
        };
        match codec.encode(&reply) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(error = %e, "Failed to encode reply");
                None
            }
        }
    }
}

impl MemberEventListener for ClusteredCache {
    fn on_event(&self, event: MemberEvent) {
        self.on_member_event(event);
    }
}

impl std::fmt::Debug for ClusteredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredCache")
            .field("node_id", &self.node_id())
            .field("cache", &self.config.cache_name)
            .field("topology_id", &self.topology.current_id())
            .finish()
    }
}
