//! Topology publication and rebalance coordination.
//!
//! Every node holds the installed [`CacheTopology`] in a watch channel: readers take a
//! cheap snapshot, waiters subscribe for a newer id. Installation only ever moves the
//! id forward, so a node never observes a topology older than one it has seen.
//!
//! The oldest member of the membership view acts as coordinator. It alone creates
//! topologies, from a single event loop:
//!
//! ```text
//!  member joins/leaves ──▶ ┌─────────────┐  rebalancing topology   ┌──────────┐
//!                          │ coordinator │ ──────────────────────▶ │ members  │
//!  rebalance confirmed ──▶ │ event loop  │ ◀────── confirm ─────── │ (state   │
//!                          └─────────────┘  stable topology        │ transfer)│
//!                                 └──────────────────────────────▶ └──────────┘
//! ```

use crate::cluster::{MemberEvent, MemberEventListener};
use crate::config::GridConfig;
use crate::dispatch::RpcManager;
use crate::error::{Error, Result, TopologyError};
use crate::metrics::GridMetrics;
use crate::network::{Message, RebalanceConfirm, TopologyUpdate};
use crate::partitioning::ConsistentHash;
use crate::topology::CacheTopology;
use crate::types::{NodeId, TopologyId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input to the coordinator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TopologyEvent {
    /// The local node finished joining; create the first topology if needed.
    Start,
    Member(MemberEvent),
    Confirm {
        node: NodeId,
        topology_id: TopologyId,
    },
    SetRebalancing(bool),
    /// Rebalance towards the current view even without a membership change.
    RequestRebalance,
}

/// Coordinator state owned by the event loop.
#[derive(Debug, Default)]
struct CoordinatorState {
    /// Members that confirmed the current rebalance.
    confirmations: BTreeSet<NodeId>,
}

/// Owns the installed topology of one cache on one node.
pub struct TopologyManager {
    local: NodeId,
    config: Arc<GridConfig>,
    rpc: Arc<RpcManager>,
    metrics: Arc<GridMetrics>,

    topology_tx: watch::Sender<Arc<CacheTopology>>,

    /// Membership view, oldest member first.
    view: RwLock<Vec<NodeId>>,

    rebalancing_enabled: AtomicBool,

    events_tx: mpsc::UnboundedSender<TopologyEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TopologyEvent>>>,

    /// Stops resending topology updates once the event loop ends.
    resend_cancel: CancellationToken,
}

impl TopologyManager {
    pub fn new(config: Arc<GridConfig>, rpc: Arc<RpcManager>, metrics: Arc<GridMetrics>) -> Self {
        let empty = CacheTopology::empty(config.num_owners, config.num_segments);
        let (topology_tx, _) = watch::channel(Arc::new(empty));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            local: config.node_id,
            rebalancing_enabled: AtomicBool::new(config.rebalance_enabled),
            config,
            rpc,
            metrics,
            topology_tx,
            view: RwLock::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            resend_cancel: CancellationToken::new(),
        }
    }

    /// Start the coordinator loop. Does nothing if it already runs.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let rx = self.events_rx.lock().take()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            manager.run(rx, shutdown).await;
        }))
    }

    /// Set the initial membership view and let the coordinator create the first
    /// topology if none exists yet.
    pub fn start(&self, members: Vec<NodeId>) {
        {
            let mut view = self.view.write();
            for member in members {
                if !view.contains(&member) {
                    view.push(member);
                }
            }
            if !view.contains(&self.local) {
                view.push(self.local);
            }
        }
        self.submit(TopologyEvent::Start);
    }

    /// The installed topology.
    pub fn current(&self) -> Arc<CacheTopology> {
        Arc::clone(&self.topology_tx.borrow())
    }

    pub fn current_id(&self) -> TopologyId {
        self.topology_tx.borrow().topology_id()
    }

    /// Subscribe to topology changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheTopology>> {
        self.topology_tx.subscribe()
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Membership view, oldest member first.
    pub fn members(&self) -> Vec<NodeId> {
        self.view.read().clone()
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.view.read().first().copied()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.local)
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::Acquire)
    }

    /// Suspend or resume rebalancing.
    ///
    /// While suspended, joiners become members without owning segments. Resuming
    /// starts a rebalance towards the current view.
    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        self.rebalancing_enabled.store(enabled, Ordering::Release);
        self.submit(TopologyEvent::SetRebalancing(enabled));
    }

    /// Ask the coordinator to move the cache to the ideal ownership for the current
    /// view. Ignored on other nodes, while a rebalance is running, or while
    /// rebalancing is suspended.
    pub fn request_rebalance(&self) {
        self.submit(TopologyEvent::RequestRebalance);
    }

    /// Install a topology received from the coordinator.
    ///
    /// Returns false, and changes nothing, unless it is newer than the installed one.
    pub fn install(&self, topology: CacheTopology) -> bool {
        let topology_id = topology.topology_id();
        let rebalancing = topology.is_rebalancing();
        let installed = self.topology_tx.send_if_modified(|current| {
            if topology_id > current.topology_id() {
                *current = Arc::new(topology);
                true
            } else {
                false
            }
        });

        if installed {
            self.metrics.record_topology(topology_id);
            info!(
                node_id = self.local,
                topology_id, rebalancing, "Installed topology"
            );
        } else {
            debug!(node_id = self.local, topology_id, "Ignoring stale topology");
        }
        installed
    }

    /// Wait until a topology with at least `topology_id` is installed.
    pub async fn await_topology(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        let mut rx = self.topology_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|t| t.topology_id() >= topology_id),
        )
        .await?;
        let topology = waited.map_err(|_| Error::Cancelled)?;
        Ok(Arc::clone(&topology))
    }

    /// Check a command's topology id against the installed one.
    ///
    /// An older id is rejected so the sender retries with fresh routing; a newer one
    /// waits, bounded by `timeout`, for this node to catch up.
    pub async fn validate_command_topology(
        &self,
        command_topology: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        let current = self.current();
        if command_topology < current.topology_id() {
            return Err(TopologyError::Outdated {
                command: command_topology,
                current: current.topology_id(),
            }
            .into());
        }
        if command_topology == current.topology_id() {
            return Ok(current);
        }

        debug!(
            node_id = self.local,
            command_topology,
            current = current.topology_id(),
            "Waiting for newer topology"
        );
        self.await_topology(command_topology, timeout).await
    }

    /// Report that this node received everything it needs for `topology_id`.
    pub async fn confirm_rebalance(&self, topology_id: TopologyId) -> Result<()> {
        let topology = self.current();
        if topology.topology_id() != topology_id {
            debug!(topology_id, "Not confirming superseded rebalance");
            return Ok(());
        }

        let coordinator = topology.coordinator();
        if coordinator == self.local {
            self.on_rebalance_confirm(self.local, topology_id);
            return Ok(());
        }

        let confirm = Message::RebalanceConfirm(RebalanceConfirm {
            cache: self.config.cache_name.clone(),
            node: self.local,
            topology_id,
        });
        self.rpc.send_message(coordinator, &confirm).await?;
        Ok(())
    }

    /// A member confirmed a rebalance.
    pub fn on_rebalance_confirm(&self, node: NodeId, topology_id: TopologyId) {
        self.submit(TopologyEvent::Confirm { node, topology_id });
    }

    fn submit(&self, event: TopologyEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(node_id = self.local, "Topology event loop stopped");
        }
    }

    async fn run(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<TopologyEvent>,
        shutdown: CancellationToken,
    ) {
        let mut state = CoordinatorState::default();
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(&mut state, event).await;
        }
        self.resend_cancel.cancel();
        debug!(node_id = self.local, "Topology event loop finished");
    }

    async fn handle_event(self: &Arc<Self>, state: &mut CoordinatorState, event: TopologyEvent) {
        match event {
            TopologyEvent::Start => {
                if self.is_coordinator() && self.current_id() == 0 {
                    self.rebalance_to_view(state).await;
                }
            }
            TopologyEvent::Member(event) => {
                let node_id = event.node_id();
                {
                    let mut view = self.view.write();
                    if event.is_join() {
                        if !view.contains(&node_id) {
                            view.push(node_id);
                        }
                    } else if event.is_leave() {
                        view.retain(|&m| m != node_id);
                    } else {
                        return;
                    }
                }
                if self.is_coordinator() {
                    self.rebalance_to_view(state).await;
                }
            }
            TopologyEvent::Confirm { node, topology_id } => {
                self.handle_confirm(state, node, topology_id).await;
            }
            TopologyEvent::RequestRebalance => {
                let current = self.current();
                if self.is_coordinator()
                    && current.topology_id() > 0
                    && !current.is_rebalancing()
                    && self.is_rebalancing_enabled()
                {
                    let ideal = ConsistentHash::compute(
                        &self.members(),
                        self.config.num_owners,
                        self.config.num_segments,
                    );
                    if &ideal != current.current_ch() {
                        self.rebalance_to_view(state).await;
                    }
                }
            }
            TopologyEvent::SetRebalancing(enabled) => {
                info!(node_id = self.local, enabled, "Rebalancing toggled");
                if enabled && self.is_coordinator() {
                    self.rebalance_to_view(state).await;
                }
            }
        }
    }

    /// Create the next topology for the current membership view.
    async fn rebalance_to_view(self: &Arc<Self>, state: &mut CoordinatorState) {
        let view = self.members();
        if view.is_empty() {
            return;
        }
        let current = self.current();
        let next_id = current.topology_id() + 1;
        let num_owners = self.config.num_owners;
        let num_segments = self.config.num_segments;
        state.confirmations.clear();

        if current.topology_id() == 0 {
            let ch = ConsistentHash::compute(&view, num_owners, num_segments);
            info!(node_id = self.local, members = ?view, "Creating initial topology");
            self.publish(CacheTopology::stable(next_id, 0, self.local, view, ch))
                .await;
            return;
        }

        // Departed members leave the current hash; their segments fall to survivors.
        let departed: Vec<NodeId> = current
            .current_ch()
            .members()
            .iter()
            .copied()
            .filter(|m| !view.contains(m))
            .collect();
        let mut current_ch = if departed.is_empty() {
            current.current_ch().clone()
        } else {
            warn!(node_id = self.local, ?departed, "Removing departed owners");
            current.current_ch().without_members(&departed)
        };
        if current_ch.members().is_empty() {
            warn!(node_id = self.local, "No previous owner survived, data lost");
            current_ch = ConsistentHash::compute(&view, num_owners, num_segments);
        }

        if !self.is_rebalancing_enabled() {
            self.publish(CacheTopology::stable(
                next_id,
                current.rebalance_id(),
                self.local,
                view,
                current_ch,
            ))
            .await;
            return;
        }

        let pending_ch = ConsistentHash::compute(&view, num_owners, num_segments);
        if pending_ch == current_ch {
            self.publish(CacheTopology::stable(
                next_id,
                current.rebalance_id(),
                self.local,
                view,
                current_ch,
            ))
            .await;
            return;
        }

        let rebalance_id = current.rebalance_id() + 1;
        info!(
            node_id = self.local,
            topology_id = next_id,
            rebalance_id,
            members = ?view,
            "Starting rebalance"
        );
        self.metrics.rebalances_started.inc();
        self.publish(CacheTopology::rebalancing(
            next_id,
            rebalance_id,
            self.local,
            view,
            current_ch,
            pending_ch,
        ))
        .await;
    }

    async fn handle_confirm(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        node: NodeId,
        topology_id: TopologyId,
    ) {
        let current = self.current();
        if !self.is_coordinator() || current.topology_id() != topology_id {
            debug!(node, topology_id, "Ignoring stale rebalance confirmation");
            return;
        }
        let Some(pending) = current.pending_ch() else {
            return;
        };

        state.confirmations.insert(node);
        let waiting: Vec<NodeId> = pending
            .members()
            .iter()
            .copied()
            .filter(|m| !state.confirmations.contains(m))
            .collect();
        debug!(node, topology_id, ?waiting, "Rebalance confirmation");
        if !waiting.is_empty() {
            return;
        }

        info!(
            node_id = self.local,
            topology_id,
            rebalance_id = current.rebalance_id(),
            "Rebalance complete"
        );
        state.confirmations.clear();
        self.metrics.rebalances_completed.inc();
        self.publish(CacheTopology::stable(
            topology_id + 1,
            current.rebalance_id(),
            self.local,
            current.members().to_vec(),
            pending.clone(),
        ))
        .await;
    }

    /// Install locally, then push to every other member. Members that do not
    /// acknowledge are sent the update again until they do, leave the view, or a newer
    /// topology supersedes it.
    async fn publish(self: &Arc<Self>, topology: CacheTopology) {
        let topology_id = topology.topology_id();
        let targets: Vec<NodeId> = topology
            .members()
            .iter()
            .copied()
            .filter(|&m| m != self.local)
            .collect();
        let update = Message::TopologyUpdate(TopologyUpdate {
            cache: self.config.cache_name.clone(),
            topology: topology.clone(),
        });
        self.install(topology);

        let unacked = self.send_update(&targets, &update).await;
        if unacked.is_empty() {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.resend_update(topology_id, unacked, update).await;
        });
    }

    /// Push an update, returning the targets that did not acknowledge it.
    async fn send_update(&self, targets: &[NodeId], update: &Message) -> Vec<NodeId> {
        match self.rpc.broadcast(targets, update).await {
            Ok(replies) => replies
                .into_iter()
                .filter_map(|(target, reply)| match reply {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(target, error = %e, "Topology update not acknowledged");
                        Some(target)
                    }
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to encode topology update");
                Vec::new()
            }
        }
    }

    async fn resend_update(
        &self,
        topology_id: TopologyId,
        mut targets: Vec<NodeId>,
        update: Message,
    ) {
        let interval = self.config.dispatch.retry_wait;
        while !targets.is_empty() {
            tokio::select! {
                _ = self.resend_cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.current_id() != topology_id {
                debug!(topology_id, "Superseded topology no longer resent");
                return;
            }
            let view = self.members();
            targets.retain(|t| view.contains(t));
            if targets.is_empty() {
                return;
            }
            debug!(topology_id, ?targets, "Resending topology update");
            targets = self.send_update(&targets, &update).await;
        }
        debug!(node_id = self.local, topology_id, "Topology update acknowledged by all members");
    }
}

impl MemberEventListener for TopologyManager {
    fn on_event(&self, event: MemberEvent) {
        self.submit(TopologyEvent::Member(event));
    }
}
