//! End-to-end tests against an in-process cluster.

use std::time::Duration;

use bytes::Bytes;
use pbft_config::PbftConfig;
use pbft_consensus::ReplicaState;
use pbft_node::{ClientError, LocalCluster};
use pbft_types::{ClientId, ReplicaId, SlotNumber, ViewNumber};
use tempfile::TempDir;

fn config(journal: &TempDir) -> PbftConfig {
    let mut config = PbftConfig::testing();
    config.journal.dir = journal.path().to_path_buf();
    config
}

/// Polls every running replica's journal until each holds `len` decisions.
async fn wait_for_journals(cluster: &LocalCluster, len: usize) {
    let journals: Vec<_> = cluster.running().map(|id| cluster.journal(id)).collect();
    for _ in 0..200 {
        let mut done = true;
        for journal in &journals {
            let log = journal.read().await.expect("journal readable");
            done &= log.len() >= len;
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("journals did not reach {len} decisions");
}

fn assert_same_log(states: &[ReplicaState], slots: u64) {
    for slot in 0..slots {
        let slot = SlotNumber::new(slot);
        let digests: Vec<_> = states
            .iter()
            .filter_map(|s| s.commit_certificate(slot))
            .map(|cert| cert.proposal.digest())
            .collect();
        assert!(
            digests.windows(2).all(|pair| pair[0] == pair[1]),
            "replicas disagree on slot {slot}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_commits_and_is_journaled_everywhere() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cluster = LocalCluster::start(config(&dir)).expect("cluster starts");
    let mut client = cluster.client(ClientId::new(1));

    let reply = client.submit(&b"put k v"[..]).await.expect("request commits");
    assert_eq!(reply.slot, SlotNumber::ZERO);
    assert_eq!(reply.view, ViewNumber::ZERO);
    assert_eq!(reply.proposal.data, Bytes::from_static(b"put k v"));

    wait_for_journals(&cluster, 1).await;
    let journal = cluster.journal(ReplicaId::new(2)).read().await.expect("read");
    assert_eq!(journal[0].data, Bytes::from_static(b"put k v"));

    let states = cluster.shutdown().await.expect("clean shutdown");
    assert_eq!(states.len(), 4);
    assert_same_log(&states, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_requests_cross_checkpoints() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cluster = LocalCluster::start(config(&dir)).expect("cluster starts");
    let mut client = cluster.client(ClientId::new(7));

    // Checkpoint interval is 4 in the testing config.
    for i in 0..10u64 {
        let reply = client
            .submit(format!("op-{i}").into_bytes())
            .await
            .expect("request commits");
        assert_eq!(reply.slot, SlotNumber::new(i));
    }

    wait_for_journals(&cluster, 10).await;
    let states = cluster.shutdown().await.expect("clean shutdown");
    for state in &states {
        assert_eq!(state.last_committed(), Some(SlotNumber::new(9)));
        // Slot 8 lies outside the first window, so committing it required
        // adopting the checkpoint at 4.
        assert!(state.stable_checkpoint().next_slot >= SlotNumber::new(4));
    }
    assert_same_log(&states, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_leader_is_replaced_through_client_escalation() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut cluster = LocalCluster::start(config(&dir)).expect("cluster starts");
    cluster.crash(ReplicaId::new(0)).await.expect("replica 0 stops");

    let mut client = cluster.client(ClientId::new(2));
    let reply = client
        .submit(&b"after crash"[..])
        .await
        .expect("request commits once a new leader is elected");

    assert!(reply.view >= ViewNumber::new(1));
    assert_ne!(reply.from, ReplicaId::new(0));
    assert_ne!(client.target(), ReplicaId::new(0));

    // The next request goes straight to the new leader.
    let second = client.submit(&b"second"[..]).await.expect("request commits");
    assert_eq!(second.view, reply.view);

    let states = cluster.shutdown().await.expect("clean shutdown");
    assert_eq!(states.len(), 3);
    for state in &states {
        assert!(state.view() >= ViewNumber::new(1));
    }
    assert_same_log(&states, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_gives_up_without_a_quorum() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = config(&dir);
    config.client.resend_interval_ms = 20;
    config.client.max_attempts = 5;
    let mut cluster = LocalCluster::start(config).expect("cluster starts");

    // Two crashes exceed f = 1: no quorum of 3 remains.
    cluster.crash(ReplicaId::new(0)).await.expect("replica 0 stops");
    cluster.crash(ReplicaId::new(1)).await.expect("replica 1 stops");

    let mut client = cluster.client(ClientId::new(3));
    let err = client.submit(&b"doomed"[..]).await.unwrap_err();
    assert_eq!(err, ClientError::Exhausted { attempts: 5 });

    cluster.shutdown().await.expect("clean shutdown");
}
