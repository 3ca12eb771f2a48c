//! Background tasks: replication rounds, retention sweeps and consumer
//! session expiry.
//!
//! Each task holds a weak reference to the cluster and exits on its shutdown
//! signal or once the cluster is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use kestrel_core::Timestamp;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;

/// Handles to the running background tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawns every background task for `cluster`.
    #[must_use]
    pub fn spawn(cluster: &Arc<Cluster>) -> Self {
        let config = cluster.config();
        let mut tasks = Self {
            shutdown: Vec::new(),
            handles: Vec::new(),
        };
        let wakeup = cluster.replication_wakeup();
        tasks.add(
            cluster,
            Duration::from_millis(config.replication_interval_ms),
            move |cluster, period, shutdown_rx| replication_task(cluster, period, wakeup, shutdown_rx),
        );
        tasks.add(
            cluster,
            Duration::from_millis(config.retention_check_interval_ms),
            retention_task,
        );
        tasks.add(
            cluster,
            Duration::from_millis(config.session_check_interval_ms),
            session_reaper_task,
        );
        info!(tasks = tasks.handles.len(), "Started background tasks");
        tasks
    }

    fn add<F, Fut>(&mut self, cluster: &Arc<Cluster>, period: Duration, task: F)
    where
        F: FnOnce(Weak<Cluster>, Duration, mpsc::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown.push(shutdown_tx);
        self.handles
            .push(tokio::spawn(task(Arc::downgrade(cluster), period, shutdown_rx)));
    }

    /// Signals every task to stop and waits for them to finish.
    pub async fn shutdown(self) {
        for tx in &self.shutdown {
            // A closed channel means the task already exited.
            let _ = tx.send(()).await;
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Stopped background tasks");
    }
}

/// Copies leader records to followers and shrinks the ISR on lag.
///
/// Runs a round every `period`, and early whenever a producer asks for one.
async fn replication_task(
    cluster: Weak<Cluster>,
    period: Duration,
    wakeup: Arc<Notify>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Replication task shutting down");
                break;
            }
            () = wakeup.notified() => {
                let Some(cluster) = cluster.upgrade() else { break };
                cluster.run_replication_round(Timestamp::now()).await;
            }
            _ = interval.tick() => {
                let Some(cluster) = cluster.upgrade() else { break };
                let copied = cluster.run_replication_round(Timestamp::now()).await;
                if copied > 0 {
                    debug!(records = copied, "Replication round");
                }
            }
        }
    }
}

/// Deletes expired segments.
async fn retention_task(cluster: Weak<Cluster>, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Retention task shutting down");
                break;
            }
            _ = interval.tick() => {
                let Some(cluster) = cluster.upgrade() else { break };
                cluster.run_retention(Timestamp::now()).await;
            }
        }
    }
}

/// Evicts consumer group members whose session expired.
async fn session_reaper_task(cluster: Weak<Cluster>, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Session reaper shutting down");
                break;
            }
            _ = interval.tick() => {
                let Some(cluster) = cluster.upgrade() else { break };
                let evicted = cluster.evict_expired_members(Timestamp::now()).await;
                if !evicted.is_empty() {
                    info!(members = evicted.len(), "Evicted expired group members");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use kestrel_core::{NodeId, Offset, PartitionId, Record};
    use kestrel_partition::{AckMode, RetentionPolicy};

    #[tokio::test]
    async fn test_background_replication_commits_leader_acks() {
        let config = ClusterConfig::with_broker_count(3).with_replication_interval_ms(5);
        let cluster = Cluster::start(config).await.unwrap();
        cluster
            .create_topic("orders", 1, 3, RetentionPolicy::default())
            .await
            .unwrap();
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        leader
            .produce("orders", Some(PartitionId::new(0)), Record::new("x"), AckMode::Leader)
            .await
            .unwrap();

        let mut committed = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let description = cluster.describe_topic("orders").await.unwrap();
            if description.partitions[0].high_water_mark == Offset::new(1) {
                committed = true;
                break;
            }
        }
        assert!(committed);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cluster = Cluster::start(ClusterConfig::with_broker_count(1)).await.unwrap();
        cluster.shutdown().await.unwrap();
        cluster.shutdown().await.unwrap();
    }
}
