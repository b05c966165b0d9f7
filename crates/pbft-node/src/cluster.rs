//! In-process cluster orchestration.

use std::collections::BTreeMap;

use pbft_config::PbftConfig;
use pbft_consensus::{ClusterConfig, ReplicaState};
use pbft_types::{ClientId, ReplicaId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::Client;
use crate::error::{NodeError, Result};
use crate::journal::Journal;
use crate::network::{Address, LocalNetwork};
use crate::runtime::ReplicaNode;

/// Builds the consensus parameters from a loaded configuration.
pub fn cluster_config(config: &PbftConfig) -> Result<ClusterConfig> {
    config
        .validate()
        .map_err(|e| NodeError::Config(e.to_string()))?;
    let size = u8::try_from(config.cluster.replicas.len())
        .map_err(|_| NodeError::Config("too many replicas".to_string()))?;

    Ok(ClusterConfig::with_size(size)
        .with_checkpoint_interval(config.consensus.checkpoint_interval)
        .with_view_change_interval(config.consensus.view_change_min_interval())
        .with_max_pending_requests(config.consensus.max_pending_requests))
}

struct RunningReplica {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<ReplicaState>,
}

/// Every replica of a cluster, each running as its own task on one
/// [`LocalNetwork`].
pub struct LocalCluster {
    config: PbftConfig,
    consensus: ClusterConfig,
    network: LocalNetwork,
    replicas: BTreeMap<ReplicaId, RunningReplica>,
}

impl LocalCluster {
    /// Spawns one actor per configured replica. Must be called from within a
    /// tokio runtime.
    pub fn start(config: PbftConfig) -> Result<Self> {
        let consensus = cluster_config(&config)?;
        let network = LocalNetwork::new(config.network.loss_rate, config.network.timeout());

        let mut replicas = BTreeMap::new();
        for id in consensus.replicas() {
            let mailbox = network.register(Address::Replica(id));
            let journal = Journal::new(&config.journal.dir, id);
            let state = ReplicaState::new(id, consensus.clone());
            let node = ReplicaNode::new(state, network.clone(), mailbox, Some(journal));

            let (shutdown, signal) = watch::channel(false);
            let handle = tokio::spawn(node.run(signal));
            replicas.insert(id, RunningReplica { shutdown, handle });
        }

        info!(
            replicas = consensus.cluster_size(),
            faults = consensus.max_faults(),
            journal = %config.journal.dir.display(),
            "cluster started"
        );

        Ok(Self {
            config,
            consensus,
            network,
            replicas,
        })
    }

    pub fn config(&self) -> &PbftConfig {
        &self.config
    }

    pub fn consensus(&self) -> &ClusterConfig {
        &self.consensus
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Replicas that have not been crashed.
    pub fn running(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.keys().copied()
    }

    pub fn journal(&self, replica: ReplicaId) -> Journal {
        Journal::new(&self.config.journal.dir, replica)
    }

    /// Registers a client endpoint and returns its driver.
    pub fn client(&self, id: ClientId) -> Client<LocalNetwork> {
        let callback = format!("mem://client-{id}");
        let mailbox = self.network.register(Address::Client(callback.clone()));
        Client::new(
            id,
            callback,
            self.network.clone(),
            mailbox,
            self.consensus.clone(),
            &self.config.client,
        )
    }

    /// Stops a replica and detaches it from the network. Returns the state
    /// it held when it stopped.
    pub async fn crash(&mut self, replica: ReplicaId) -> Result<ReplicaState> {
        let running = self
            .replicas
            .remove(&replica)
            .ok_or_else(|| NodeError::Config(format!("replica {replica} is not running")))?;
        info!(%replica, "crashing replica");
        Self::stop(&self.network, replica, running).await
    }

    /// Stops every running replica and returns their final states in id
    /// order.
    pub async fn shutdown(self) -> Result<Vec<ReplicaState>> {
        let mut states = Vec::with_capacity(self.replicas.len());
        for (replica, running) in self.replicas {
            states.push(Self::stop(&self.network, replica, running).await?);
        }
        info!("cluster stopped");
        Ok(states)
    }

    async fn stop(
        network: &LocalNetwork,
        replica: ReplicaId,
        running: RunningReplica,
    ) -> Result<ReplicaState> {
        network.unregister(&Address::Replica(replica));
        // A send error means the actor already exited; the join below
        // reports how.
        let _ = running.shutdown.send(true);
        running
            .handle
            .await
            .map_err(|_| NodeError::Shutdown(replica.as_u8()))
    }
}
