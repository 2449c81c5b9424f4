//! Moving segment data to new owners during a rebalance.
//!
//! Every node reacts to each newly installed topology:
//!
//! ```text
//! rebalancing topology N
//!   ├─ as source:      snapshot segment ─▶ chunk 0 ─ack─▶ chunk 1 ─ack─▶ ... final
//!   └─ as destination: apply chunks ─▶ all segments final ─▶ confirm N to coordinator
//!
//! stable topology N+1
//!   └─ drop segments no longer owned
//! ```
//!
//! A newer topology cancels whatever the previous one started. Progress is never
//! carried over: the new topology computes its own transfers from scratch and relies on
//! versioned application to merge what is already present.

use crate::cache::container::DataContainer;
use crate::config::GridConfig;
use crate::dispatch::RpcManager;
use crate::error::{Error, Result, StateTransferError};
use crate::metrics::GridMetrics;
use crate::network::Message;
use crate::statetransfer::task::{ChunkDisposition, InboundTransfer, OutboundTransfer, TransferProgress};
use crate::statetransfer::transfer::{ChunkAck, StateChunk};
use crate::topology::{CacheTopology, TopologyManager};
use crate::types::{NodeId, Segment, TopologyId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHUNK_RETRY_BACKOFF: Duration = Duration::from_millis(50);

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TransferState {
    /// Highest topology this manager has reacted to.
    processed_topology: TopologyId,

    /// What this node still has to receive, while rebalancing.
    inbound: Option<InboundTransfer>,

    /// Cancels the pushes and applications of `processed_topology`.
    cancel: CancellationToken,
}

/// Drives state transfer for one cache on one node.
pub struct StateTransferManager {
    local: NodeId,
    config: Arc<GridConfig>,
    container: Arc<DataContainer>,
    topology: Arc<TopologyManager>,
    rpc: Arc<RpcManager>,
    metrics: Arc<GridMetrics>,

    state: Mutex<TransferState>,

    /// Bumped whenever a segment completes or a topology is processed.
    progress_tx: watch::Sender<u64>,

    /// Whether this node has received its share of the data after joining.
    initial_done_tx: watch::Sender<bool>,

    /// Bounds concurrent chunk applications on the blocking pool.
    apply_permits: Arc<Semaphore>,
}

impl StateTransferManager {
    pub fn new(
        config: Arc<GridConfig>,
        container: Arc<DataContainer>,
        topology: Arc<TopologyManager>,
        rpc: Arc<RpcManager>,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(0);
        let (initial_done_tx, _) = watch::channel(false);
        let permits = config.state_transfer.blocking_pool_size.max(1);

        Self {
            local: config.node_id,
            config,
            container,
            topology,
            rpc,
            metrics,
            state: Mutex::new(TransferState {
                processed_topology: 0,
                inbound: None,
                cancel: CancellationToken::new(),
            }),
            progress_tx,
            initial_done_tx,
            apply_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Follow topology changes until shut down.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = self.topology.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let topology = Arc::clone(&rx.borrow_and_update());
                manager.on_topology_update(topology).await;
            }
            manager.cancel_all();
            debug!(node_id = manager.local, "State transfer loop finished");
        })
    }

    /// React to an installed topology. Topologies at or below the last processed id
    /// are ignored, so this may be called from several places.
    pub async fn on_topology_update(self: &Arc<Self>, topology: Arc<CacheTopology>) {
        let topology_id = topology.topology_id();
        let (outbound, token, confirm) = {
            let mut state = self.state.lock();
            if topology_id <= state.processed_topology {
                return;
            }
            state.processed_topology = topology_id;
            state.cancel.cancel();
            state.cancel = CancellationToken::new();

            if let Some(superseded) = state.inbound.take() {
                self.abandon(superseded, &topology);
            }

            if topology.is_rebalancing() {
                let mut inbound = InboundTransfer::new(&topology, self.local);
                let incomplete = inbound.incomplete_segments();
                self.container
                    .set_retain_tombstones(incomplete.iter().copied(), true);
                self.metrics
                    .segments_in_transfer
                    .set(incomplete.len() as i64);

                let orphaned = inbound.orphaned_segments();
                if !orphaned.is_empty() {
                    warn!(
                        node_id = self.local,
                        topology_id,
                        ?orphaned,
                        "No surviving source for segments"
                    );
                }
                info!(
                    node_id = self.local,
                    topology_id,
                    inbound = incomplete.len(),
                    "Rebalance transfer started"
                );

                let confirm = inbound.is_complete() && inbound.mark_confirmed();
                state.inbound = Some(inbound);
                (
                    OutboundTransfer::for_topology(&topology, self.local),
                    state.cancel.clone(),
                    confirm,
                )
            } else {
                self.metrics.segments_in_transfer.set(0);
                self.drop_unowned_segments(&topology);
                (Vec::new(), state.cancel.clone(), false)
            }
        };

        if topology.is_member(self.local) && !topology.is_rebalancing() {
            self.initial_done_tx.send_if_modified(|done| !std::mem::replace(done, true));
        }
        self.progress_tx.send_modify(|p| *p += 1);

        for transfer in outbound {
            let manager = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                manager.push(transfer, token).await;
            });
        }

        if confirm {
            self.spawn_confirm(topology_id, token);
        }
    }

    /// Process the installed topology if the background loop has not yet.
    ///
    /// Anything that writes to the container on behalf of a topology calls this
    /// first, so that segments still in transfer keep their tombstones.
    pub async fn catch_up(self: &Arc<Self>) {
        self.on_topology_update(self.topology.current()).await;
    }

    /// Forget a superseded inbound transfer. Partially received segments this node no
    /// longer writes to are cleared.
    fn abandon(&self, superseded: InboundTransfer, next: &CacheTopology) {
        let incomplete = superseded.incomplete_segments();
        if incomplete.is_empty() {
            return;
        }
        debug!(
            node_id = self.local,
            topology_id = superseded.topology_id(),
            segments = incomplete.len(),
            "Abandoning superseded transfer"
        );

        let still_inbound = if next.is_rebalancing() {
            next.inbound_segments(self.local)
        } else {
            BTreeSet::new()
        };
        let (keep, release): (Vec<Segment>, Vec<Segment>) = incomplete
            .into_iter()
            .partition(|s| still_inbound.contains(s));
        debug!(keep = keep.len(), "Segments still in transfer");

        let unowned: Vec<Segment> = release
            .iter()
            .copied()
            .filter(|&s| !next.write_ch().is_owner(s, self.local))
            .collect();
        self.container.set_retain_tombstones(release, false);
        if !unowned.is_empty() {
            self.container.remove_segments(unowned);
        }
    }

    fn drop_unowned_segments(&self, topology: &CacheTopology) {
        let unowned: Vec<Segment> = self
            .container
            .segments_with_data()
            .into_iter()
            .filter(|&s| !topology.current_ch().is_owner(s, self.local))
            .collect();
        let all: Vec<Segment> = (0..self.container.num_segments()).collect();
        self.container.set_retain_tombstones(all, false);
        if unowned.is_empty() {
            return;
        }

        let removed = self.container.remove_segments(unowned.iter().copied());
        self.metrics.segments_dropped.inc_by(unowned.len() as u64);
        info!(
            node_id = self.local,
            topology_id = topology.topology_id(),
            segments = unowned.len(),
            entries = removed,
            "Dropped segments no longer owned"
        );
    }

    fn spawn_confirm(self: &Arc<Self>, topology_id: TopologyId, token: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.confirm(topology_id, &token).await;
        });
    }

    /// Report a completed inbound transfer, retrying until the coordinator hears it or
    /// the topology is superseded.
    async fn confirm(&self, topology_id: TopologyId, token: &CancellationToken) {
        info!(node_id = self.local, topology_id, "Inbound transfer complete");
        let mut backoff = CHUNK_RETRY_BACKOFF;
        loop {
            match self.topology.confirm_rebalance(topology_id).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(node_id = self.local, topology_id, error = %e, "Failed to confirm rebalance")
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            if self.topology.current_id() != topology_id {
                return;
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }
    }

    /// Push segments to one destination, one acknowledged chunk at a time.
    async fn push(&self, transfer: OutboundTransfer, token: CancellationToken) {
        let destination = transfer.destination;
        debug!(
            node_id = self.local,
            destination,
            topology_id = transfer.topology_id,
            segments = transfer.segments.len(),
            "Pushing segments"
        );

        for segment in transfer.segments {
            if token.is_cancelled() {
                return;
            }
            let entries = self.container.snapshot_segment(segment);
            let chunks = StateChunk::split(
                &self.config.cache_name,
                transfer.topology_id,
                segment,
                entries,
                self.config.state_transfer.chunk_size,
            );
            for chunk in chunks {
                match self.send_chunk(destination, chunk, &token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(destination, segment, "Destination stopped the push");
                        return;
                    }
                    Err(e) => {
                        if !token.is_cancelled() {
                            error!(node_id = self.local, destination, segment, error = %e, "State push failed");
                        }
                        return;
                    }
                }
            }
        }
        debug!(node_id = self.local, destination, "Push complete");
    }

    /// Returns whether the destination accepted the chunk.
    ///
    /// Failed sends are retried with backoff for as long as the push is current and the
    /// destination stays in the membership view.
    async fn send_chunk(
        &self,
        destination: NodeId,
        chunk: StateChunk,
        token: &CancellationToken,
    ) -> Result<bool> {
        let segment = chunk.segment;
        let message = Message::StateChunk(chunk);
        let mut backoff = CHUNK_RETRY_BACKOFF;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let reply = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                reply = self.rpc.send_message(destination, &message) => reply,
            };
            let reason = match reply {
                Ok(Message::ChunkAck(ack)) => {
                    if ack.accepted {
                        self.metrics.chunks_sent.inc();
                    }
                    return Ok(ack.accepted);
                }
                Ok(other) => format!("unexpected reply {} to state chunk", other.name()),
                Err(e) => e.to_string(),
            };

            if !self.topology.members().contains(&destination) {
                return Err(StateTransferError::ChunkFailed {
                    segment,
                    destination,
                    reason,
                }
                .into());
            }
            warn!(destination, segment, attempt, %reason, "Retrying state chunk");
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }
    }

    /// Apply a chunk pushed by `origin`.
    pub async fn apply_chunk(self: &Arc<Self>, origin: NodeId, mut chunk: StateChunk) -> Result<ChunkAck> {
        let timeout = self.config.state_transfer.timeout;
        if chunk.topology_id > self.topology.current_id() {
            self.topology
                .await_topology(chunk.topology_id, timeout)
                .await?;
        }
        self.catch_up().await;

        let (disposition, token) = {
            let state = self.state.lock();
            match &state.inbound {
                Some(inbound) if inbound.topology_id() == chunk.topology_id => (
                    inbound.disposition(chunk.segment, chunk.sequence),
                    state.cancel.clone(),
                ),
                _ => {
                    debug!(origin, topology_id = chunk.topology_id, "Rejecting stale chunk");
                    return Ok(ChunkAck::rejected(&chunk));
                }
            }
        };
        match disposition {
            ChunkDisposition::Apply => {}
            ChunkDisposition::Duplicate => return Ok(ChunkAck::accepted(&chunk, 0)),
            ChunkDisposition::Unexpected => {
                warn!(
                    origin,
                    segment = chunk.segment,
                    sequence = chunk.sequence,
                    "Unexpected chunk"
                );
                return Ok(ChunkAck::rejected(&chunk));
            }
        }

        let permit = Arc::clone(&self.apply_permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        let container = Arc::clone(&self.container);
        let entries = std::mem::take(&mut chunk.entries);
        let segment = chunk.segment;
        let apply_token = token.clone();
        let applied = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if apply_token.is_cancelled() {
                return None;
            }
            Some(container.apply_transferred(segment, entries))
        })
        .await
        .map_err(|e| Error::Internal(format!("chunk application failed: {}", e)))?;
        let Some(applied) = applied else {
            return Ok(ChunkAck::rejected(&chunk));
        };

        let (segment_done, confirm) = {
            let mut state = self.state.lock();
            let Some(inbound) = state
                .inbound
                .as_mut()
                .filter(|t| t.topology_id() == chunk.topology_id)
            else {
                return Ok(ChunkAck::rejected(&chunk));
            };
            if inbound.disposition(segment, chunk.sequence) != ChunkDisposition::Apply {
                return Ok(ChunkAck::accepted(&chunk, applied as u64));
            }
            let done = inbound.record_chunk(segment, chunk.sequence, applied as u64, chunk.is_final);
            (done, inbound.is_complete() && inbound.mark_confirmed())
        };

        self.metrics.record_chunk_applied(applied as u64);
        if segment_done {
            self.container.set_retain_tombstones([segment], false);
            self.metrics.segments_in_transfer.add(-1);
            self.progress_tx.send_modify(|p| *p += 1);
            debug!(node_id = self.local, origin, segment, "Segment received");
        }
        if confirm {
            self.spawn_confirm(chunk.topology_id, token);
        }
        Ok(ChunkAck::accepted(&chunk, applied as u64))
    }

    /// Whether a segment is still being received by this node.
    pub fn is_segment_pending(&self, segment: Segment) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|t| t.is_pending(segment))
    }

    /// Wait until a segment is no longer being received.
    pub async fn await_segment(&self, segment: Segment, timeout: Duration) -> Result<()> {
        let mut rx = self.progress_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|_| !self.is_segment_pending(segment)))
            .await?
            .map_err(|_| Error::Cancelled)?;
        Ok(())
    }

    pub fn is_initial_transfer_done(&self) -> bool {
        *self.initial_done_tx.borrow()
    }

    /// Wait until this node has received its share of the data after joining.
    pub async fn await_initial_transfer(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.initial_done_tx.subscribe();
        let waited = match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(StateTransferError::InitialTransferTimeout(timeout).into()),
        };
        waited
    }

    /// Progress of the running inbound transfer, if any.
    pub fn progress(&self) -> Option<TransferProgress> {
        self.state.lock().inbound.as_ref().map(|t| t.progress())
    }

    /// Cancel every push and application in flight.
    pub fn cancel_all(&self) {
        self.state.lock().cancel.cancel();
    }
}
