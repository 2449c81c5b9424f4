//! Execution of commands on the node they were routed to.
//!
//! The executor is the single interpreter of [`Command`]: every command, whether it
//! originated locally or arrived from another node, goes through
//! [`CommandExecutor::execute`], which checks it against this node's version, cache
//! and topology before touching the container.

use crate::cache::container::{now_millis, DataContainer, EntryUpdate, InternalEntry};
use crate::commands::functional::{FunctionRegistry, ReadEntryView};
use crate::commands::{
    BackupWriteCommand, Command, Flags, GetCommand, LoadType, ReadOnlyManyCommand, TouchCommand,
    WriteCommand, WriteOp,
};
use crate::config::GridConfig;
use crate::dispatch::{NodeStatus, ResponseValue, RpcManager, UnanimousCollector};
use crate::error::{CommandError, ExceptionKind, Result};
use crate::metrics::GridMetrics;
use crate::partitioning::KeyPartitioner;
use crate::statetransfer::{CrossSiteStateTransfer, StateTransferManager};
use crate::topology::{CacheTopology, TopologyManager};
use crate::types::{EntryVersion, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Completed write invocations remembered for retried duplicates.
const COMPLETED_INVOCATIONS_CAPACITY: usize = 65_536;

/// Source of values missing from memory.
#[async_trait]
pub trait CacheLoader: Send + Sync + 'static {
    /// Load the value of a key, or `None` if the store has none.
    async fn load(&self, key: &Bytes) -> Result<Option<Bytes>>;
}

/// Bounded memory of completed writes, oldest evicted first.
#[derive(Debug, Default)]
struct CompletedInvocations {
    results: HashMap<Uuid, ResponseValue>,
    order: VecDeque<Uuid>,
}

impl CompletedInvocations {
    fn get(&self, id: &Uuid) -> Option<ResponseValue> {
        self.results.get(id).cloned()
    }

    fn insert(&mut self, id: Uuid, result: ResponseValue) {
        if self.results.insert(id, result).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > COMPLETED_INVOCATIONS_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.results.remove(&evicted);
            }
        }
    }
}

/// Executes commands against the local container.
pub struct CommandExecutor {
    local: NodeId,
    config: Arc<GridConfig>,
    partitioner: KeyPartitioner,
    container: Arc<DataContainer>,
    topology: Arc<TopologyManager>,
    state_transfer: Arc<StateTransferManager>,
    rpc: Arc<RpcManager>,
    xsite: Arc<CrossSiteStateTransfer>,
    functions: Arc<FunctionRegistry>,
    metrics: Arc<GridMetrics>,
    loader: RwLock<Option<Arc<dyn CacheLoader>>>,

    /// Sequence part of the versions this node assigns as primary.
    sequence: AtomicU64,

    completed: Mutex<CompletedInvocations>,
}

impl CommandExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GridConfig>,
        container: Arc<DataContainer>,
        topology: Arc<TopologyManager>,
        state_transfer: Arc<StateTransferManager>,
        rpc: Arc<RpcManager>,
        xsite: Arc<CrossSiteStateTransfer>,
        functions: Arc<FunctionRegistry>,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        Self {
            local: config.node_id,
            partitioner: KeyPartitioner::new(config.num_segments),
            config,
            container,
            topology,
            state_transfer,
            rpc,
            xsite,
            functions,
            metrics,
            loader: RwLock::new(None),
            sequence: AtomicU64::new(0),
            completed: Mutex::new(CompletedInvocations::default()),
        }
    }

    /// Install or remove the cache loader.
    pub fn set_loader(&self, loader: Option<Arc<dyn CacheLoader>>) {
        *self.loader.write() = loader;
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Execute a command on this node.
    pub async fn execute(&self, origin: NodeId, command: Command) -> Result<ResponseValue> {
        self.metrics.record_execution(command.name());
        trace!(origin, command = command.name(), "Executing command");

        let result = self.execute_checked(origin, command).await;
        if let Err(e) = &result {
            self.metrics.record_error(kind_label(e.exception_kind()));
        }
        result
    }

    async fn execute_checked(&self, origin: NodeId, command: Command) -> Result<ResponseValue> {
        let supported = self.config.node_version;
        if command.supported_since() > supported {
            warn!(
                origin,
                command = command.name(),
                required = %command.supported_since(),
                %supported,
                "Rejecting command newer than this node"
            );
            return Err(CommandError::UnsupportedVersion {
                command: command.name(),
                required: command.supported_since(),
                supported,
            }
            .into());
        }
        if command.cache_name() != &self.config.cache_name {
            return Err(CommandError::UnknownCache(command.cache_name().to_string()).into());
        }

        let topology = match command.topology_id() {
            Some(topology_id) if !command.flags().contains(Flags::CACHE_MODE_LOCAL) => Some(
                self.topology
                    .validate_command_topology(topology_id, self.config.dispatch.retry_wait)
                    .await?,
            ),
            _ => None,
        };
        if topology.is_some() {
            self.state_transfer.catch_up().await;
        }

        let skip_load = command.skips_load();
        match command {
            Command::Get(get) => self.get(get, skip_load).await,
            Command::Write(write) => self.write(write, topology.as_deref(), skip_load).await,
            Command::BackupWrite(backup) => self.backup_write(backup),
            Command::ReadOnlyMany(read) => self.read_only_many(read, skip_load).await,
            Command::Touch(touch) => Ok(self.touch(touch)),
            Command::ClearCrossSiteStatus(_) => {
                self.xsite.clear_status();
                Ok(ResponseValue::Empty)
            }
            Command::TopologyInfo(_) => Ok(self.topology_info()),
        }
    }

    fn loader(&self) -> Option<Arc<dyn CacheLoader>> {
        self.loader.read().clone()
    }

    async fn load(&self, key: &Bytes) -> Result<Option<Bytes>> {
        match self.loader() {
            Some(loader) => {
                let loaded = loader.load(key).await?;
                debug!(found = loaded.is_some(), "Consulted cache loader");
                Ok(loaded)
            }
            None => Ok(None),
        }
    }

    async fn get(&self, get: GetCommand, skip_load: bool) -> Result<ResponseValue> {
        if let Some(entry) = self.container.get(get.segment, &get.key) {
            return Ok(ResponseValue::Value(entry.value));
        }
        if skip_load {
            return Ok(ResponseValue::Value(None));
        }
        Ok(ResponseValue::Value(self.load(&get.key).await?))
    }

    async fn write(
        &self,
        write: WriteCommand,
        topology: Option<&CacheTopology>,
        skip_load: bool,
    ) -> Result<ResponseValue> {
        let remembered = self.completed.lock().get(&write.invocation_id);
        if let Some(result) = remembered {
            self.metrics.duplicate_invocations.inc();
            debug!(
                invocation_id = %write.invocation_id,
                "Answering retried write from completed invocation"
            );
            if let Some(topology) = topology {
                self.replicate_current(&write, topology).await?;
            }
            return Ok(result);
        }

        let loaded = if skip_load || self.container.peek(write.segment, &write.key).is_some() {
            None
        } else {
            self.load(&write.key).await?
        };
        let ignore_previous = write.load_type() == LoadType::DontLoad;

        let topology_id = topology.map_or_else(|| self.topology.current_id(), |t| t.topology_id());
        let version = EntryVersion::new(
            topology_id,
            self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        );

        let (result, replicated) = self.container.compute(write.segment, write.key.clone(), |current| {
            apply_write(&write.op, current, loaded, version, ignore_previous)
        })?;
        self.completed
            .lock()
            .insert(write.invocation_id, result.clone());

        if let Some(topology) = topology {
            self.replicate(&write, topology, replicated, result.clone())
                .await?;
        }
        Ok(result)
    }

    /// Send an applied write to the other write owners.
    async fn replicate(
        &self,
        write: &WriteCommand,
        topology: &CacheTopology,
        entry: InternalEntry,
        result: ResponseValue,
    ) -> Result<()> {
        let backups: Vec<NodeId> = topology
            .write_owners(write.segment)
            .iter()
            .copied()
            .filter(|&n| n != self.local)
            .collect();
        if backups.is_empty() {
            return Ok(());
        }

        let backup = Command::BackupWrite(BackupWriteCommand {
            cache: write.cache.clone(),
            key: write.key.clone(),
            segment: write.segment,
            topology_id: topology.topology_id(),
            value: entry.value,
            version: entry.version,
            created_ms: entry.created_ms,
            lifespan_ms: entry.lifespan_ms,
            max_idle_ms: entry.max_idle_ms,
            invocation_id: write.invocation_id,
            result,
        });
        trace!(segment = write.segment, ?backups, "Replicating write");
        self.rpc
            .invoke_command(&backups, &backup, UnanimousCollector::with_expected(backups.len()))
            .await?;
        Ok(())
    }

    /// Replicate whatever is stored for a retried write's key, so that owners that
    /// missed the original replication catch up.
    async fn replicate_current(&self, write: &WriteCommand, topology: &CacheTopology) -> Result<()> {
        let entry = match self.container.peek(write.segment, &write.key) {
            Some(entry) => entry,
            None => match self.container.version_of(write.segment, &write.key) {
                Some(version) => InternalEntry::tombstone(version, now_millis()),
                None => return Ok(()),
            },
        };
        let result = self
            .completed
            .lock()
            .get(&write.invocation_id)
            .unwrap_or_default();
        self.replicate(write, topology, entry, result).await
    }

    fn backup_write(&self, backup: BackupWriteCommand) -> Result<ResponseValue> {
        let entry = InternalEntry {
            value: backup.value,
            version: backup.version,
            created_ms: backup.created_ms,
            last_used_ms: now_millis(),
            lifespan_ms: backup.lifespan_ms,
            max_idle_ms: backup.max_idle_ms,
        };
        let applied = self
            .container
            .apply_versioned(backup.segment, backup.key, entry);
        trace!(segment = backup.segment, applied, "Backup write");
        self.completed
            .lock()
            .insert(backup.invocation_id, backup.result);
        Ok(ResponseValue::Empty)
    }

    async fn read_only_many(&self, read: ReadOnlyManyCommand, skip_load: bool) -> Result<ResponseValue> {
        let function = self.functions.get(&read.function)?;
        let load = !skip_load;

        let mut values = Vec::with_capacity(read.keys.len());
        for key in &read.keys {
            let segment = self.partitioner.segment_of(key);
            let (value, version) = match self.container.get(segment, key) {
                Some(entry) => (entry.value, Some(entry.version)),
                None if load => (self.load(key).await?, None),
                None => (None, None),
            };
            let view = ReadEntryView::new(key, value.as_ref(), version);
            values.push(function(&view, &read.params)?);
        }
        Ok(ResponseValue::Values(values))
    }

    fn topology_info(&self) -> ResponseValue {
        let topology = self.topology.current();
        let segments_in_transfer = self
            .state_transfer
            .progress()
            .map_or(0, |p| p.total_segments - p.completed_segments);
        ResponseValue::Status(NodeStatus {
            topology_id: topology.topology_id(),
            rebalancing: topology.is_rebalancing(),
            segments_in_transfer: u32::try_from(segments_in_transfer).unwrap_or(u32::MAX),
            initial_transfer_done: self.state_transfer.is_initial_transfer_done(),
        })
    }

    fn touch(&self, touch: TouchCommand) -> ResponseValue {
        ResponseValue::Bool(self.container.touch(
            touch.segment,
            &touch.key,
            touch.touch_even_if_expired,
        ))
    }
}

/// Compute the new state of an entry under a write.
///
/// Returns the container update, plus the caller's result and the entry to replicate.
fn apply_write(
    op: &WriteOp,
    current: Option<&InternalEntry>,
    loaded: Option<Bytes>,
    version: EntryVersion,
    ignore_previous: bool,
) -> Result<(EntryUpdate, (ResponseValue, InternalEntry))> {
    let now = now_millis();
    let previous = current.and_then(|e| e.value.clone()).or(loaded);

    match op {
        WriteOp::Put {
            value,
            lifespan,
            max_idle,
        } => {
            let entry =
                InternalEntry::new(value.clone(), version, now).with_expiration(*lifespan, *max_idle);
            let result = if ignore_previous {
                ResponseValue::Empty
            } else {
                ResponseValue::Value(previous)
            };
            Ok((EntryUpdate::Put(entry.clone()), (result, entry)))
        }
        WriteOp::Remove => Ok((
            EntryUpdate::Remove(version),
            (
                ResponseValue::Value(previous),
                InternalEntry::tombstone(version, now),
            ),
        )),
        WriteOp::Increment { delta } => {
            let base = match previous {
                None => 0,
                Some(bytes) => {
                    let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                        CommandError::InvalidValue(format!(
                            "counter holds {} bytes, expected 8",
                            bytes.len()
                        ))
                    })?;
                    i64::from_be_bytes(raw)
                }
            };
            let next = base
                .checked_add(*delta)
                .ok_or_else(|| CommandError::InvalidValue("counter overflow".to_string()))?;
            let value = Bytes::copy_from_slice(&next.to_be_bytes());

            let mut entry = InternalEntry::new(value.clone(), version, now);
            if let Some(current) = current {
                entry.created_ms = current.created_ms;
                entry.lifespan_ms = current.lifespan_ms;
                entry.max_idle_ms = current.max_idle_ms;
            }
            Ok((
                EntryUpdate::Put(entry.clone()),
                (ResponseValue::Value(Some(value)), entry),
            ))
        }
    }
}

/// Metric label of an exception kind.
fn kind_label(kind: ExceptionKind) -> &'static str {
    match kind {
        ExceptionKind::OutdatedTopology { .. } => "outdated_topology",
        ExceptionKind::UnsupportedVersion => "unsupported_version",
        ExceptionKind::UnknownCommand => "unknown_command",
        ExceptionKind::UnknownFunction => "unknown_function",
        ExceptionKind::InvalidValue => "invalid_value",
        ExceptionKind::Timeout => "timeout",
        ExceptionKind::Internal => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ClearCrossSiteStatusCommand, Params};
    use crate::error::{Error, TopologyError};
    use crate::network::InMemoryNetwork;
    use crate::partitioning::ConsistentHash;
    use crate::statetransfer::{PushStatus, StateChunk, TransferEntry};
    use crate::types::{NodeVersion, Segment};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SEGMENTS: u32 = 8;

    struct Fixture {
        executor: CommandExecutor,
        topology: Arc<TopologyManager>,
        state_transfer: Arc<StateTransferManager>,
        container: Arc<DataContainer>,
        xsite: Arc<CrossSiteStateTransfer>,
    }

    fn fixture(version: NodeVersion) -> Fixture {
        let config = Arc::new(
            GridConfig::new(1)
                .with_num_owners(1)
                .with_num_segments(SEGMENTS)
                .with_node_version(version),
        );
        let network = InMemoryNetwork::new();
        let rpc = Arc::new(RpcManager::new(
            1,
            version,
            network.transport(1),
            Duration::from_millis(100),
        ));
        let metrics = Arc::new(GridMetrics::new());
        let topology = Arc::new(TopologyManager::new(
            Arc::clone(&config),
            Arc::clone(&rpc),
            Arc::clone(&metrics),
        ));
        topology.install(CacheTopology::stable(
            1,
            0,
            1,
            vec![1],
            ConsistentHash::compute(&[1], 1, SEGMENTS),
        ));
        let container = Arc::new(DataContainer::new(SEGMENTS));
        let state_transfer = Arc::new(StateTransferManager::new(
            Arc::clone(&config),
            Arc::clone(&container),
            Arc::clone(&topology),
            Arc::clone(&rpc),
            Arc::clone(&metrics),
        ));
        let xsite = Arc::new(CrossSiteStateTransfer::new());
        let executor = CommandExecutor::new(
            config,
            Arc::clone(&container),
            Arc::clone(&topology),
            Arc::clone(&state_transfer),
            rpc,
            Arc::clone(&xsite),
            Arc::new(FunctionRegistry::with_builtins()),
            metrics,
        );
        Fixture {
            executor,
            topology,
            state_transfer,
            container,
            xsite,
        }
    }

    fn segment(key: &[u8]) -> Segment {
        KeyPartitioner::new(SEGMENTS).segment_of(key)
    }

    fn write(key: &'static [u8], op: WriteOp, invocation_id: Uuid) -> Command {
        Command::Write(WriteCommand {
            cache: "default".into(),
            key: Bytes::from_static(key),
            segment: segment(key),
            flags: Flags::NONE,
            topology_id: 1,
            op,
            invocation_id,
        })
    }

    fn get(key: &'static [u8]) -> Command {
        Command::Get(GetCommand {
            cache: "default".into(),
            key: Bytes::from_static(key),
            segment: segment(key),
            flags: Flags::NONE,
            topology_id: 1,
        })
    }

    fn put(key: &'static [u8], value: &'static [u8]) -> Command {
        write(
            key,
            WriteOp::Put {
                value: Bytes::from_static(value),
                lifespan: None,
                max_idle: None,
            },
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let f = fixture(NodeVersion::CURRENT);
        let previous = f.executor.execute(1, put(b"k", b"v1")).await.unwrap();
        assert_eq!(previous, ResponseValue::Value(None));

        let previous = f.executor.execute(1, put(b"k", b"v2")).await.unwrap();
        assert_eq!(previous.into_value(), Some(Bytes::from_static(b"v1")));

        let value = f.executor.execute(1, get(b"k")).await.unwrap();
        assert_eq!(value.into_value(), Some(Bytes::from_static(b"v2")));

        let removed = f
            .executor
            .execute(1, write(b"k", WriteOp::Remove, Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(removed.into_value(), Some(Bytes::from_static(b"v2")));
        assert_eq!(
            f.executor.execute(1, get(b"k")).await.unwrap(),
            ResponseValue::Value(None)
        );
    }

    #[tokio::test]
    async fn test_retried_increment_applies_once() {
        let f = fixture(NodeVersion::CURRENT);
        let id = Uuid::new_v4();
        let increment = write(b"counter", WriteOp::Increment { delta: 5 }, id);

        let first = f.executor.execute(1, increment.clone()).await.unwrap();
        let retried = f.executor.execute(1, increment).await.unwrap();
        assert_eq!(first, retried);

        let value = f.executor.execute(1, get(b"counter")).await.unwrap();
        assert_eq!(
            value.into_value(),
            Some(Bytes::copy_from_slice(&5i64.to_be_bytes()))
        );
        assert_eq!(f.executor.metrics.duplicate_invocations.get(), 1);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_counter() {
        let f = fixture(NodeVersion::CURRENT);
        f.executor.execute(1, put(b"name", b"alice")).await.unwrap();
        let err = f
            .executor
            .execute(1, write(b"name", WriteOp::Increment { delta: 1 }, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command(CommandError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_version_gating() {
        let f = fixture(NodeVersion::FIFTEEN);
        let read = Command::ReadOnlyMany(ReadOnlyManyCommand {
            cache: "default".into(),
            keys: vec![Bytes::from_static(b"a")],
            function: "value".into(),
            params: Params::default(),
            flags: Flags::NONE,
            topology_id: 1,
        });
        let err = f.executor.execute(2, read).await.unwrap_err();
        assert_eq!(err.exception_kind(), ExceptionKind::UnsupportedVersion);
        assert!(!err.is_retryable());
        assert_eq!(f.executor.metrics.errors.get("unsupported_version"), 1);

        // Older commands still run.
        assert!(f.executor.execute(2, get(b"a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_outdated_topology_rejected() {
        let f = fixture(NodeVersion::CURRENT);
        f.topology.install(CacheTopology::stable(
            2,
            0,
            1,
            vec![1],
            ConsistentHash::compute(&[1], 1, SEGMENTS),
        ));
        let err = f.executor.execute(2, get(b"a")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Topology(TopologyError::Outdated {
                command: 1,
                current: 2
            })
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_only_many_in_key_order() {
        let f = fixture(NodeVersion::CURRENT);
        f.executor.execute(1, put(b"a", b"1")).await.unwrap();
        f.executor.execute(1, put(b"c", b"333")).await.unwrap();

        let read = |function: &str| {
            Command::ReadOnlyMany(ReadOnlyManyCommand {
                cache: "default".into(),
                keys: vec![
                    Bytes::from_static(b"a"),
                    Bytes::from_static(b"b"),
                    Bytes::from_static(b"c"),
                ],
                function: function.into(),
                params: Params::default(),
                flags: Flags::NONE,
                topology_id: 1,
            })
        };

        let values = f.executor.execute(1, read("value")).await.unwrap().into_values();
        assert_eq!(
            values,
            vec![
                Some(Bytes::from_static(b"1")),
                None,
                Some(Bytes::from_static(b"333"))
            ]
        );

        let exists = f.executor.execute(1, read("exists")).await.unwrap().into_values();
        assert_eq!(exists[1], Some(Bytes::from_static(&[0])));

        let err = f.executor.execute(1, read("missing")).await.unwrap_err();
        assert!(matches!(err, Error::Command(CommandError::UnknownFunction(_))));
    }

    #[tokio::test]
    async fn test_touch_and_clear_cross_site_status() {
        let f = fixture(NodeVersion::CURRENT);
        f.executor.execute(1, put(b"k", b"v")).await.unwrap();

        let touch = |key: &'static [u8]| {
            Command::Touch(TouchCommand {
                cache: "default".into(),
                key: Bytes::from_static(key),
                segment: segment(key),
                flags: Flags::NONE,
                topology_id: 1,
                touch_even_if_expired: false,
            })
        };
        assert_eq!(
            f.executor.execute(1, touch(b"k")).await.unwrap(),
            ResponseValue::Bool(true)
        );
        assert_eq!(
            f.executor.execute(1, touch(b"absent")).await.unwrap(),
            ResponseValue::Bool(false)
        );

        f.xsite.start_push("lon");
        f.xsite.mark_status("lon", PushStatus::Ok);
        let clear = Command::ClearCrossSiteStatus(ClearCrossSiteStatusCommand {
            cache: "default".into(),
        });
        f.executor.execute(1, clear.clone()).await.unwrap();
        f.executor.execute(1, clear).await.unwrap();
        assert!(f.xsite.status().is_empty());
    }

    struct CountingLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheLoader for CountingLoader {
        async fn load(&self, key: &Bytes) -> Result<Option<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((key.as_ref() == b"stored").then(|| Bytes::from_static(b"from-store")))
        }
    }

    #[tokio::test]
    async fn test_loader_consulted_on_miss() {
        let f = fixture(NodeVersion::CURRENT);
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
        });
        f.executor.set_loader(Some(loader.clone()));

        let value = f.executor.execute(1, get(b"stored")).await.unwrap();
        assert_eq!(value.into_value(), Some(Bytes::from_static(b"from-store")));

        // A put that ignores return values never loads.
        let mut blind = put(b"stored", b"new");
        if let Command::Write(w) = &mut blind {
            w.flags = Flags::IGNORE_RETURN_VALUES;
        }
        let calls = loader.calls.load(Ordering::SeqCst);
        assert_eq!(
            f.executor.execute(1, blind).await.unwrap(),
            ResponseValue::Empty
        );
        assert_eq!(loader.calls.load(Ordering::SeqCst), calls);

        // SKIP_LOAD bypasses the loader.
        let mut skip = get(b"other");
        if let Command::Get(g) = &mut skip {
            g.flags = Flags::SKIP_LOAD;
        }
        f.executor.execute(1, skip).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_unknown_cache() {
        let f = fixture(NodeVersion::CURRENT);
        let other = Command::Get(GetCommand {
            cache: "other".into(),
            key: Bytes::from_static(b"k"),
            segment: 0,
            flags: Flags::NONE,
            topology_id: 1,
        });
        assert!(matches!(
            f.executor.execute(1, other).await,
            Err(Error::Command(CommandError::UnknownCache(_)))
        ));
    }

    #[tokio::test]
    async fn test_backup_removal_survives_older_transferred_copy() {
        let f = fixture(NodeVersion::CURRENT);
        // Node 1 joins node 2's cluster. The topology is installed, but nothing has
        // reacted to it yet when the first backup write arrives.
        let rebalancing = CacheTopology::rebalancing(
            2,
            1,
            2,
            vec![2, 1],
            ConsistentHash::compute(&[2], 1, SEGMENTS),
            ConsistentHash::compute(&[2, 1], 1, SEGMENTS),
        );
        let inbound = rebalancing.inbound_segments(1);
        let key = (0..1000)
            .map(|i| Bytes::from(format!("k{}", i)))
            .find(|k| inbound.contains(&KeyPartitioner::new(SEGMENTS).segment_of(k)))
            .unwrap();
        let key_segment = KeyPartitioner::new(SEGMENTS).segment_of(&key);
        f.topology.install(rebalancing);

        let removal = Command::BackupWrite(BackupWriteCommand {
            cache: "default".into(),
            key: key.clone(),
            segment: key_segment,
            topology_id: 2,
            value: None,
            version: EntryVersion::new(2, 5),
            created_ms: 0,
            lifespan_ms: None,
            max_idle_ms: None,
            invocation_id: Uuid::new_v4(),
            result: ResponseValue::Empty,
        });
        f.executor.execute(2, removal).await.unwrap();

        let stale = StateChunk {
            cache: "default".into(),
            topology_id: 2,
            segment: key_segment,
            sequence: 0,
            entries: vec![TransferEntry {
                key: key.clone(),
                value: Bytes::from_static(b"stale"),
                version: EntryVersion::new(1, 1),
                created_ms: 0,
                last_used_ms: 0,
                lifespan_ms: None,
                max_idle_ms: None,
            }],
            is_final: true,
        };
        let ack = f.state_transfer.apply_chunk(2, stale).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.applied, 0);
        assert!(f.container.get(key_segment, &key).is_none());
        assert_eq!(
            f.executor.execute(2, get_at(&key, 2)).await.unwrap(),
            ResponseValue::Value(None)
        );
    }

    fn get_at(key: &Bytes, topology_id: u64) -> Command {
        Command::Get(GetCommand {
            cache: "default".into(),
            key: key.clone(),
            segment: segment(key),
            flags: Flags::SKIP_LOAD,
            topology_id,
        })
    }
}
