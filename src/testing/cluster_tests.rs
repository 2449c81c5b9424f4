//! Membership changes and state transfer across several nodes.

use crate::config::{GridConfig, StateTransferConfig};
use crate::testing::LocalCluster;
use crate::types::NodeId;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::time::Duration;
use test_log::test;

const STABLE_TIMEOUT: Duration = Duration::from_secs(10);

fn base_config(num_owners: usize) -> GridConfig {
    GridConfig::default()
        .with_num_owners(num_owners)
        .with_num_segments(64)
        .with_state_transfer(
            StateTransferConfig::default()
                .with_chunk_size(7)
                .with_timeout(Duration::from_secs(10)),
        )
}

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{}", i))
}

fn value(i: usize) -> Bytes {
    Bytes::from(format!("value-{}", i))
}

async fn load(cluster: &LocalCluster, writer: NodeId, count: usize) {
    let node = cluster.node(writer).unwrap();
    for i in 0..count {
        node.put(key(i), value(i)).await.unwrap();
    }
}

async fn assert_all_readable(cluster: &LocalCluster, count: usize) {
    for node in cluster.nodes() {
        for i in 0..count {
            assert_eq!(
                node.get(key(i)).await.unwrap(),
                Some(value(i)),
                "node {} lost key {}",
                node.node_id(),
                i
            );
        }
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_topology_ids_increase_across_membership_changes() {
    let mut cluster = LocalCluster::start(base_config(2), 2).await.unwrap();
    let first = cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    assert!(cluster.node(1).unwrap().is_coordinator());
    assert!(!cluster.node(2).unwrap().is_coordinator());

    let mut seen = cluster.node(2).unwrap().current_topology().topology_id();
    assert_eq!(seen, first);

    cluster.add_node(3).await.unwrap();
    let after_join = cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    assert!(after_join > first);
    seen = seen.max(after_join);

    cluster.remove_node(2).await.unwrap();
    let after_leave = cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    assert!(after_leave > seen);

    for node in cluster.nodes() {
        let topology = node.current_topology();
        assert_eq!(topology.members(), &[1, 3]);
        assert_eq!(topology.coordinator(), 1);
    }
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_joiner_receives_every_entry() {
    let mut cluster = LocalCluster::start(base_config(10), 2).await.unwrap();
    load(&cluster, 1, 100).await;

    let joiner = cluster.add_node(3).await.unwrap();
    assert!(joiner.is_initial_transfer_done());
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();

    // Every node owns every segment, so the joiner must hold all data locally.
    assert_eq!(joiner.local_entry_count(), 100);
    for i in 0..100 {
        assert_eq!(joiner.peek_local(&key(i)), Some(value(i)));
    }
    let topology = joiner.current_topology();
    assert!(topology.pending_ch().is_none());
    assert_eq!(topology.read_ch().segments_for(3).len(), 64);
    assert!(joiner.metrics().snapshot().entries_transferred >= 100);
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_data_survives_coordinator_crash() {
    let mut cluster = LocalCluster::start(base_config(2), 3).await.unwrap();
    load(&cluster, 2, 60).await;

    cluster.remove_node(1).await.unwrap();
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();

    assert!(cluster.node(2).unwrap().is_coordinator());
    assert_all_readable(&cluster, 60).await;

    // Two owners per segment again on the survivors.
    let topology = cluster.node(3).unwrap().current_topology();
    for segment in 0..64 {
        assert_eq!(topology.read_owners(segment).len(), 2);
    }
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_leave_during_rebalance() {
    let base = base_config(2);
    let mut cluster = LocalCluster::start(base.clone(), 2).await.unwrap();
    load(&cluster, 1, 100).await;

    let mut joiner = base;
    joiner.node_id = 3;
    joiner.await_initial_transfer = false;
    cluster.add_node_with(joiner).await.unwrap();
    cluster.remove_node(2).await.unwrap();

    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    assert_all_readable(&cluster, 100).await;

    let topology = cluster.node(3).unwrap().current_topology();
    let owners: BTreeSet<NodeId> = topology.read_ch().members().iter().copied().collect();
    assert_eq!(owners, BTreeSet::from([1, 3]));
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_rebalance_held_until_enabled() {
    let base = base_config(1);
    let mut cluster = LocalCluster::start(base.clone(), 2).await.unwrap();
    load(&cluster, 1, 40).await;
    cluster.node(1).unwrap().set_rebalancing_enabled(false);

    let mut joiner = base;
    joiner.node_id = 3;
    joiner.await_initial_transfer = false;
    let node3 = cluster.add_node_with(joiner).await.unwrap();
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();

    // A member without segments still serves reads from the owners.
    assert!(node3.current_topology().read_ch().segments_for(3).is_empty());
    assert_eq!(node3.local_entry_count(), 0);
    assert_eq!(node3.get(key(7)).await.unwrap(), Some(value(7)));

    cluster.node(1).unwrap().set_rebalancing_enabled(true);
    crate::testing::utils::wait_for(
        || !node3.current_topology().read_ch().segments_for(3).is_empty(),
        STABLE_TIMEOUT,
        Duration::from_millis(10),
    )
    .await;
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();

    assert!(node3.local_entry_count() > 0);
    assert_all_readable(&cluster, 40).await;
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_member_that_missed_topology_update_catches_up() {
    let base = base_config(2);
    let mut cluster = LocalCluster::start(base.clone(), 2).await.unwrap();
    load(&cluster, 1, 50).await;
    let before = cluster.node(2).unwrap().current_topology().topology_id();

    // Node 2 cannot be reached while node 3's rebalance is announced.
    cluster.network().unregister(2);
    let mut joiner = base;
    joiner.node_id = 3;
    joiner.await_initial_transfer = false;
    cluster.add_node_with(joiner).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        cluster.node(2).unwrap().current_topology().topology_id(),
        before
    );

    let node2 = cluster.node(2).unwrap().clone();
    cluster.network().register(2, node2.clone());
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    assert!(node2.current_topology().topology_id() > before);
    assert!(node2.current_topology().is_member(3));
    assert_all_readable(&cluster, 50).await;
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_transfer_resumes_after_destination_unreachable() {
    let base = base_config(1);
    let mut cluster = LocalCluster::start(base.clone(), 2).await.unwrap();
    load(&cluster, 1, 60).await;

    cluster.node(1).unwrap().set_rebalancing_enabled(false);
    let mut joiner = base;
    joiner.node_id = 3;
    joiner.await_initial_transfer = false;
    let node3 = cluster.add_node_with(joiner).await.unwrap();
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();

    // Node 3 drops off the network just as it is given segments.
    cluster.network().unregister(3);
    cluster.node(1).unwrap().set_rebalancing_enabled(true);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!cluster.is_stable());
    assert_eq!(node3.local_entry_count(), 0);

    cluster.network().register(3, node3.clone());
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    assert!(node3.local_entry_count() > 0);
    assert_all_readable(&cluster, 60).await;
    cluster.shutdown().await;
}
