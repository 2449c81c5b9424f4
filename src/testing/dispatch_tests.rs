//! Command routing, retries and collectors across several nodes.

use crate::cache::ClusteredCache;
use crate::commands::Params;
use crate::config::{DispatchConfig, GridConfig, ReadPolicy, StateTransferConfig};
use crate::error::{Error, ExceptionKind, TopologyError};
use crate::statetransfer::PushStatus;
use crate::testing::utils::{wait_for, wait_for_result};
use crate::testing::LocalCluster;
use crate::types::{NodeId, NodeVersion};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use test_log::test;

const STABLE_TIMEOUT: Duration = Duration::from_secs(10);

fn base_config(num_owners: usize) -> GridConfig {
    GridConfig::default()
        .with_num_owners(num_owners)
        .with_num_segments(32)
        .with_dispatch(
            DispatchConfig::default()
                .with_max_retries(3)
                .with_retry_wait(Duration::from_millis(50))
                .with_rpc_timeout(Duration::from_secs(2)),
        )
}

/// First key of the form `{prefix}-{i}` whose owners, as seen by `node`, are exactly
/// `owners` in order.
fn key_owned_by(node: &ClusteredCache, prefix: &str, owners: &[NodeId]) -> Bytes {
    let topology = node.current_topology();
    (0..10_000)
        .map(|i| Bytes::from(format!("{}-{}", prefix, i)))
        .find(|key| topology.read_owners(node.segment_of(key)) == owners)
        .expect("no key with the requested owners")
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_increment_with_lost_reply_applies_once() {
    let cluster = LocalCluster::start(base_config(1), 2).await.unwrap();
    let node1 = cluster.node(1).unwrap();
    let counter = key_owned_by(node1, "counter", &[2]);

    assert_eq!(node1.increment(counter.clone(), 5).await.unwrap(), 5);

    // The primary applies the next increment but its answer is lost; the retry must
    // not apply it a second time.
    cluster.network().drop_next_reply(2);
    assert_eq!(node1.increment(counter.clone(), 5).await.unwrap(), 10);

    let stored = node1.get(counter.clone()).await.unwrap().unwrap();
    assert_eq!(stored.as_ref(), &10i64.to_be_bytes());
    assert!(node1.metrics().snapshot().retries >= 1);
    assert_eq!(
        cluster
            .node(2)
            .unwrap()
            .metrics()
            .snapshot()
            .duplicate_invocations,
        1
    );
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_backups_hold_written_values() {
    let cluster = LocalCluster::start(base_config(2), 3).await.unwrap();
    let node3 = cluster.node(3).unwrap();
    let key = key_owned_by(node3, "replicated", &[1, 2]);

    node3.put(key.clone(), "v").await.unwrap();
    assert_eq!(cluster.node(1).unwrap().peek_local(&key), Some(Bytes::from_static(b"v")));
    assert_eq!(cluster.node(2).unwrap().peek_local(&key), Some(Bytes::from_static(b"v")));
    assert_eq!(node3.peek_local(&key), None);

    assert_eq!(
        node3.remove(key.clone()).await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );
    assert_eq!(cluster.node(2).unwrap().peek_local(&key), None);
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_read_succeeds_with_one_owner_unreachable() {
    let cluster = LocalCluster::start(base_config(2), 3).await.unwrap();
    let node3 = cluster.node(3).unwrap();
    let key = key_owned_by(node3, "read", &[1, 2]);
    node3.put(key.clone(), "v").await.unwrap();

    // Node 2 stops answering before anyone notices it is gone.
    cluster.network().unregister(2);
    assert_eq!(node3.get(key.clone()).await.unwrap(), Some(Bytes::from_static(b"v")));
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_write_fails_until_unreachable_backup_is_removed() {
    let mut cluster = LocalCluster::start(base_config(2), 3).await.unwrap();
    let key = key_owned_by(cluster.node(3).unwrap(), "write", &[1, 2]);

    cluster.network().unregister(2);
    let err = cluster
        .node(3)
        .unwrap()
        .put(key.clone(), "v")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Topology(TopologyError::RetriesExhausted { attempts: 4 })
    ));

    cluster.remove_node(2).await.unwrap();
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    let node3 = cluster.node(3).unwrap();
    let written = wait_for_result(
        || node3.put(key.clone(), "v2"),
        |result| result.is_ok(),
        Duration::from_secs(2),
    )
    .await;
    assert!(written.is_some());
    assert_eq!(node3.get(key).await.unwrap(), Some(Bytes::from_static(b"v2")));
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_read_many_across_owners_keeps_key_order() {
    let cluster = LocalCluster::start(base_config(1), 3).await.unwrap();
    let node1 = cluster.node(1).unwrap();
    let keys: Vec<Bytes> = (0..30).map(|i| Bytes::from(format!("many-{}", i))).collect();
    for (i, key) in keys.iter().enumerate() {
        if i % 3 != 0 {
            node1.put(key.clone(), format!("v{}", i)).await.unwrap();
        }
    }

    let values = node1
        .read_many(keys.clone(), "value", Params::new(Vec::new()))
        .await
        .unwrap();
    assert_eq!(values.len(), 30);
    for (i, value) in values.into_iter().enumerate() {
        let expected = (i % 3 != 0).then(|| Bytes::from(format!("v{}", i)));
        assert_eq!(value, expected, "key {}", i);
    }

    let err = node1
        .read_many(keys, "no-such-function", Params::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_older_node_rejects_newer_command() {
    let mut cluster = LocalCluster::new(base_config(1));
    cluster.add_node(1).await.unwrap();
    let mut old = base_config(1);
    old.node_id = 2;
    old.node_version = NodeVersion::FIFTEEN;
    cluster.add_node_with(old).await.unwrap();
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();

    let node1 = cluster.node(1).unwrap();
    let key = key_owned_by(node1, "gated", &[2]);
    node1.put(key.clone(), "v").await.unwrap();
    assert!(node1.touch(key.clone(), false).await.unwrap());

    let err = node1
        .read_many(vec![key], "value", Params::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Remote {
            node: 2,
            kind: ExceptionKind::UnsupportedVersion,
            ..
        }
    ));
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_clear_cross_site_status_twice_equals_once() {
    let cluster = LocalCluster::start(base_config(2), 2).await.unwrap();
    for node in cluster.nodes() {
        let xsite = node.cross_site();
        assert!(xsite.start_push("lon"));
        xsite.mark_status("lon", PushStatus::Ok);
        assert!(xsite.start_push("nyc"));
    }
    let expected: BTreeMap<String, PushStatus> =
        BTreeMap::from([("nyc".to_string(), PushStatus::Sending)]);

    let node1 = cluster.node(1).unwrap();
    node1.clear_cross_site_status().await.unwrap();
    let node2 = cluster.node(2).unwrap();
    assert!(
        wait_for(
            || node2.cross_site().status() == expected,
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .await
    );
    assert_eq!(node1.cross_site().status(), expected);

    node1.clear_cross_site_status().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node1.cross_site().status(), expected);
    assert_eq!(node2.cross_site().status(), expected);
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_reads_on_joiner_under_wait_policy() {
    let base = base_config(1).with_state_transfer(
        StateTransferConfig::default()
            .with_chunk_size(4)
            .with_read_policy(ReadPolicy::Wait)
            .with_timeout(Duration::from_secs(10)),
    );
    let mut cluster = LocalCluster::start(base.clone(), 2).await.unwrap();
    for i in 0..80 {
        cluster
            .node(1)
            .unwrap()
            .put(format!("k{}", i), format!("v{}", i))
            .await
            .unwrap();
    }

    let mut joiner = base;
    joiner.node_id = 3;
    joiner.await_initial_transfer = false;
    let node3 = cluster.add_node_with(joiner).await.unwrap();
    for i in 0..80 {
        assert_eq!(
            node3.get(format!("k{}", i)).await.unwrap(),
            Some(Bytes::from(format!("v{}", i)))
        );
    }
    cluster.wait_for_stable(STABLE_TIMEOUT).await.unwrap();
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_touch_keeps_idle_entry_alive_on_all_owners() {
    let cluster = LocalCluster::start(base_config(2), 2).await.unwrap();
    let node1 = cluster.node(1).unwrap();
    let node2 = cluster.node(2).unwrap();
    node1
        .put_with_expiration("session", "s", None, Some(Duration::from_millis(300)))
        .await
        .unwrap();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(node2.touch("session", false).await.unwrap());
    }
    assert_eq!(node1.peek_local(b"session"), Some(Bytes::from_static(b"s")));
    assert_eq!(node2.peek_local(b"session"), Some(Bytes::from_static(b"s")));

    // Untouched for longer than max idle on every owner.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(!node2.touch("session", false).await.unwrap());
    assert_eq!(node1.get("session").await.unwrap(), None);
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_cluster_status_reports_every_member() {
    let cluster = LocalCluster::start(base_config(2), 3).await.unwrap();
    let node1 = cluster.node(1).unwrap();
    let topology_id = node1.current_topology().topology_id();

    let status = node1.cluster_status().await.unwrap();
    assert_eq!(status.len(), 3);
    for (node, reported) in &status {
        let reported = reported.as_ref().unwrap();
        assert_eq!(reported.topology_id, topology_id, "node {}", node);
        assert!(!reported.rebalancing);
        assert_eq!(reported.segments_in_transfer, 0);
        assert!(reported.initial_transfer_done);
    }

    // An unreachable member is reported, not fatal.
    cluster.network().unregister(3);
    let status = node1.cluster_status().await.unwrap();
    assert_eq!(status.len(), 3);
    assert!(status[&1].is_ok());
    assert!(status[&2].is_ok());
    assert!(status[&3].is_err());
    cluster.shutdown().await;
}
