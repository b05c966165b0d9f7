//! Local cluster run.

use anyhow::{Context, Result};
use pbft_config::PbftConfig;
use pbft_consensus::instrumentation::METRICS;
use pbft_node::LocalCluster;
use pbft_types::{ClientId, ReplicaId};
use std::path::Path;
use std::time::Instant;

/// Start a cluster, submit `requests` operations, and report what each
/// replica committed.
pub fn run(project: &str, requests: u64, crash_leader: bool) -> Result<()> {
    let config = PbftConfig::load_from_dir(Path::new(project))
        .context("Failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(drive(config, requests, crash_leader))
}

async fn drive(config: PbftConfig, requests: u64, crash_leader: bool) -> Result<()> {
    let mut cluster = LocalCluster::start(config).context("Failed to start cluster")?;

    if crash_leader {
        cluster.crash(ReplicaId::new(0)).await?;
        println!("Crashed replica 0 (leader of view 0)");
    }

    let mut client = cluster.client(ClientId::new(1));
    let started = Instant::now();
    for i in 0..requests {
        let reply = client
            .submit(format!("op-{i}").into_bytes())
            .await
            .with_context(|| format!("Request {i} failed"))?;
        println!(
            "request {i}: slot {} view {} (answered by replica {})",
            reply.slot, reply.view, reply.from
        );
    }
    println!(
        "\n{requests} requests committed in {:.2?}\n",
        started.elapsed()
    );

    let journals: Vec<_> = cluster.running().map(|id| cluster.journal(id)).collect();
    let states = cluster.shutdown().await?;
    for (state, journal) in states.iter().zip(&journals) {
        let committed = journal.read().await?.len();
        println!(
            "replica {}: view {}, checkpoint at slot {}, {committed} decisions in {}",
            state.replica_id(),
            state.view(),
            state.stable_checkpoint().next_slot,
            journal.path().display()
        );
    }

    let metrics = METRICS.snapshot();
    println!();
    println!("Messages sent: {}", metrics.messages_sent_total);
    println!("Messages received: {}", metrics.messages_received_total);
    println!("Commits: {}", metrics.commits_total);
    println!("Checkpoints adopted: {}", metrics.checkpoints_adopted_total);
    println!("View changes: {}", metrics.view_changes_total);
    println!("Rejections: {}", metrics.rejections_total);

    Ok(())
}
