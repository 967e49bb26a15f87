//! In-process cluster of replicas wired together by `LocalNotifier`.
//!
//! Every replica owns a `MemStore` and a `StaticPeer` listing the whole
//! cluster. Writes reach replicas only through `ClusterServer::set()`, which
//! delivers each write to a chosen set of replicas, standing in for the
//! replication delivery a front end or anti-entropy would provide.

use std::sync::Arc;

use crate::server::{
    Addr, LocalNotifier, MemStore, Server, ServerController, ServerStore,
    StaticPeer, Timestamp, Write,
};
use crate::utils::CbtxError;

use async_trait::async_trait;

use tokio::task::JoinHandle;

/// Controller type of a local cluster replica.
pub type LocalController =
    ServerController<Arc<MemStore>, StaticPeer<LocalNotifier>>;

/// A set of replicas running in this process.
#[derive(Debug)]
pub struct LocalCluster {
    /// Shared notify routing table.
    notifier: LocalNotifier,

    /// Per-replica controllers.
    controllers: Vec<Arc<LocalController>>,

    /// Per-replica stores, shared with the controllers.
    stores: Vec<Arc<MemStore>>,

    /// Join handles of the per-replica notify loops.
    notify_loops: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Address of the replica at index `idx`.
    pub fn addr(idx: usize) -> Addr {
        format!("replica{}", idx)
    }

    /// Creates a cluster of `population` replicas and spawns their notify
    /// loops. `config_str` is passed to every controller.
    pub async fn new(
        population: usize,
        chan_cap: usize,
        config_str: Option<&str>,
    ) -> Result<Self, CbtxError> {
        if population == 0 {
            return logged_err!("invalid population {}", population);
        }
        let replicas: Vec<Addr> = (0..population).map(Self::addr).collect();

        let notifier = LocalNotifier::new();
        let mut controllers = Vec::with_capacity(population);
        let mut stores = Vec::with_capacity(population);
        let mut notify_loops = Vec::with_capacity(population);
        for me in &replicas {
            let rx_notify = notifier.register(me.clone(), chan_cap).await?;
            let store = Arc::new(MemStore::new());
            let peer =
                StaticPeer::new(me.clone(), replicas.clone(), notifier.clone())?;
            let controller = Arc::new(ServerController::new(
                me.clone(),
                store.clone(),
                peer,
                config_str,
            )?);

            notify_loops.push(controller.clone().spawn_notify_loop(rx_notify));
            controllers.push(controller);
            stores.push(store);
        }

        pf_info!("local cluster of {} replicas up", population);
        Ok(LocalCluster {
            notifier,
            controllers,
            stores,
            notify_loops,
        })
    }

    /// Number of replicas.
    pub fn population(&self) -> usize {
        self.controllers.len()
    }

    /// Returns the controller of replica `idx`.
    pub fn controller(&self, idx: usize) -> &Arc<LocalController> {
        &self.controllers[idx]
    }

    /// Returns the store of replica `idx`.
    pub fn store(&self, idx: usize) -> &Arc<MemStore> {
        &self.stores[idx]
    }

    /// Makes replica `idx` unreachable for notifies from now on.
    pub async fn isolate(&self, idx: usize) {
        self.notifier.unregister(&Self::addr(idx)).await;
    }

    /// Returns a `Server` handle reading from replica `home` and delivering
    /// writes to every replica.
    pub fn server(&self, home: usize) -> ClusterServer<'_> {
        self.server_to(home, (0..self.population()).collect())
    }

    /// Returns a `Server` handle reading from replica `home` and delivering
    /// writes only to the replicas in `targets`.
    pub fn server_to(&self, home: usize, targets: Vec<usize>) -> ClusterServer<'_> {
        ClusterServer {
            cluster: self,
            home,
            targets,
        }
    }

    /// Polls replica `idx` until a stable write of `key` at or above `ts`
    /// exists, giving up after `attempts` polls 10ms apart. Returns whether
    /// it was observed.
    pub async fn wait_stable(
        &self,
        idx: usize,
        key: &str,
        ts: Timestamp,
        attempts: usize,
    ) -> Result<bool, CbtxError> {
        for _ in 0..attempts {
            if self.store(idx).good_find(key, ts).await?.is_some() {
                return Ok(true);
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        Ok(false)
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for handle in &self.notify_loops {
            handle.abort();
        }
    }
}

/// `Server` handle over a `LocalCluster`.
#[derive(Debug)]
pub struct ClusterServer<'c> {
    cluster: &'c LocalCluster,
    home: usize,
    targets: Vec<usize>,
}

#[async_trait]
impl<'c> Server for ClusterServer<'c> {
    async fn get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        self.cluster.controller(self.home).get(key, ts_required).await
    }

    async fn set(&self, w: Write) -> Result<(), CbtxError> {
        for &idx in &self.targets {
            self.cluster.controller(idx).set(w.clone()).await?;
        }
        Ok(())
    }
}
