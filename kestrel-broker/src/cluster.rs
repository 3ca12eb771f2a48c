//! Cluster registry: brokers, topics and the group coordinator.
//!
//! # Locking
//!
//! ```text
//! Cluster
//!   brokers: RwLock<online flags>          membership only
//!   topics:  RwLock<name -> Arc<Topic>>    membership only
//!              Topic
//!                partitions[i]: RwLock<ReplicationGroup>  shared reads, one writer
//!   coordinator                            one mutex per consumer group
//! ```
//!
//! The topic table lock is never held while a partition is locked, except
//! during topic creation, which builds partitions before they are visible.
//! Cross-partition work (broker failover, deletion, background rounds) takes
//! a snapshot of the handles and then locks one partition at a time.
//!
//! A replication round reads leader records under the shared lock and takes
//! the exclusive lock only to apply them to follower logs. Producers waiting
//! for `AckMode::All` sleep on the partition's progress signal, which the
//! round fires when the high-water mark moves.

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_core::{NodeId, Offset, PartitionId, Timestamp, TopicPartition};
use kestrel_group::{
    CommitMode, FileOffsetStore, GroupCoordinator, GroupDescription, GroupId, JoinResult,
    MemberId, MemoryOffsetStore, OffsetStore,
};
use kestrel_partition::{
    LeadershipChange, ReplicationError, ReplicationGroup, RetentionOutcome, RetentionPolicy,
};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::ClusterConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::tasks::BackgroundTasks;
use crate::topic::{place_replicas, validate_topic, PartitionHandle, Topic, TopicDescription};

/// Directory under the data dir that holds committed offsets.
pub const OFFSETS_DIR: &str = "__consumer_offsets";

/// File name of the committed offset snapshot.
pub const OFFSETS_FILE: &str = "committed-offsets.snap";

/// Group coordinator over whichever offset store the cluster was opened with.
pub type ClusterCoordinator = GroupCoordinator<Box<dyn OffsetStore>>;

/// A cluster of brokers hosted in one process.
pub struct Cluster {
    config: ClusterConfig,
    brokers: RwLock<BTreeMap<NodeId, bool>>,
    topics: RwLock<BTreeMap<Arc<str>, Arc<Topic>>>,
    coordinator: ClusterCoordinator,
    tasks: Mutex<Option<BackgroundTasks>>,
    /// Asks the replication task for an early round.
    replication_wakeup: Arc<Notify>,
}

impl Cluster {
    /// Opens a cluster without background tasks.
    ///
    /// Committed offsets are recovered from the data directory when one is
    /// configured. Replication, retention and session expiry run only when
    /// driven through [`Cluster::run_replication_round`],
    /// [`Cluster::run_retention`] and [`Cluster::evict_expired_members`],
    /// so an `AckMode::All` produce completes only once a caller drives the
    /// rounds that replicate it.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a bad config, `Io` if the data directory
    /// cannot be created, and `Group` if committed offsets cannot be loaded.
    pub async fn open(config: ClusterConfig) -> BrokerResult<Arc<Self>> {
        config.validate()?;

        let store: Box<dyn OffsetStore> = match &config.data_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await.map_err(|e| BrokerError::Io {
                    operation: "create data directory",
                    message: e.to_string(),
                })?;
                Box::new(FileOffsetStore::open(dir.join(OFFSETS_DIR).join(OFFSETS_FILE)).await?)
            }
            None => Box::new(MemoryOffsetStore::new()),
        };
        let coordinator = GroupCoordinator::new(store, config.group)?;
        let recovered = coordinator.recover().await?;

        info!(
            brokers = config.brokers.len(),
            data_dir = ?config.data_dir,
            recovered_offsets = recovered,
            "Opened cluster"
        );
        Ok(Arc::new(Self {
            brokers: RwLock::new(config.brokers.iter().map(|&b| (b, true)).collect()),
            topics: RwLock::new(BTreeMap::new()),
            coordinator,
            tasks: Mutex::new(None),
            replication_wakeup: Arc::new(Notify::new()),
            config,
        }))
    }

    /// Opens a cluster and starts its background tasks.
    ///
    /// # Errors
    /// See [`Cluster::open`].
    pub async fn start(config: ClusterConfig) -> BrokerResult<Arc<Self>> {
        let cluster = Self::open(config).await?;
        cluster.start_background_tasks().await;
        Ok(cluster)
    }

    /// Starts the replication, retention and session tasks. No-op if they
    /// are already running.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_none() {
            *tasks = Some(BackgroundTasks::spawn(self));
        }
    }

    /// Stops background tasks and flushes every partition.
    ///
    /// # Errors
    /// Returns the first flush error; every partition is still attempted.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.shutdown().await;
        }

        let mut first_error = None;
        for handle in self.all_partitions().await {
            let Ok(group) = handle.read().await else {
                continue;
            };
            if let Err(e) = group.flush() {
                error!(topic_partition = %handle.topic_partition(), error = %e, "Flush failed during shutdown");
                first_error.get_or_insert(BrokerError::from(e));
            }
        }
        info!("Cluster shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Asks the replication task to run a round now rather than at its next
    /// tick. Without background tasks this does nothing until one is started.
    pub fn request_replication(&self) {
        self.replication_wakeup.notify_one();
    }

    pub(crate) fn replication_wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.replication_wakeup)
    }

    /// Returns the group coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &ClusterCoordinator {
        &self.coordinator
    }

    // -------------------------------------------------------------------------
    // Brokers
    // -------------------------------------------------------------------------

    /// Returns a request handle for one broker.
    ///
    /// # Errors
    /// Returns `UnknownBroker` if the id is not part of the cluster.
    pub async fn broker(self: &Arc<Self>, id: NodeId) -> BrokerResult<Broker> {
        if !self.brokers.read().await.contains_key(&id) {
            return Err(BrokerError::UnknownBroker { broker: id });
        }
        Ok(Broker::new(id, Arc::clone(self)))
    }

    /// Returns whether a broker is online.
    ///
    /// # Errors
    /// Returns `UnknownBroker` if the id is not part of the cluster.
    pub async fn is_broker_online(&self, id: NodeId) -> BrokerResult<bool> {
        self.brokers
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or(BrokerError::UnknownBroker { broker: id })
    }

    /// Returns the online brokers, sorted.
    pub async fn online_brokers(&self) -> Vec<NodeId> {
        self.brokers
            .read()
            .await
            .iter()
            .filter(|(_, online)| **online)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Marks a broker up or down and updates every partition it replicates.
    ///
    /// Partitions led by a broker going down elect a new leader from their
    /// in-sync replicas. Partitions that cannot elect one stay leaderless
    /// until an in-sync replica returns. Returns the leadership changes.
    ///
    /// # Errors
    /// Returns `UnknownBroker` if the id is not part of the cluster.
    pub async fn set_broker_online(
        &self,
        id: NodeId,
        online: bool,
    ) -> BrokerResult<Vec<(TopicPartition, LeadershipChange)>> {
        {
            let mut brokers = self.brokers.write().await;
            let flag = brokers
                .get_mut(&id)
                .ok_or(BrokerError::UnknownBroker { broker: id })?;
            if *flag == online {
                return Ok(Vec::new());
            }
            *flag = online;
        }
        if online {
            info!(broker = %id, "Broker online");
        } else {
            warn!(broker = %id, "Broker offline");
        }

        let now = Timestamp::now();
        let mut changes = Vec::new();
        for handle in self.all_partitions().await {
            let Ok(mut group) = handle.write().await else {
                continue;
            };
            if !group.replica_set().contains(&id) {
                continue;
            }
            let result = group.set_replica_online(id, online, now);
            drop(group);
            handle.notify_progress();
            match result {
                Ok(Some(change)) => changes.push((handle.topic_partition().clone(), change)),
                Ok(None) => {}
                Err(ReplicationError::ReplicaSetLost) => {
                    error!(topic_partition = %handle.topic_partition(), "All replicas offline, partition unavailable");
                }
                Err(e) => {
                    warn!(topic_partition = %handle.topic_partition(), error = %e, "Partition left without leader");
                }
            }
        }
        Ok(changes)
    }

    // -------------------------------------------------------------------------
    // Topics
    // -------------------------------------------------------------------------

    /// Creates a topic, placing replicas across the online brokers.
    ///
    /// Either every partition is created or none is.
    ///
    /// # Errors
    /// Returns `InvalidTopicConfig` for bad arguments, `TopicAlreadyExists`,
    /// and `Partition` or `Replication` if a partition log cannot be opened.
    pub async fn create_topic(
        &self,
        name: &str,
        partitions: u32,
        replication_factor: u32,
        retention: RetentionPolicy,
    ) -> BrokerResult<TopicDescription> {
        let online = self.online_brokers().await;
        validate_topic(name, partitions, replication_factor, online.len(), &self.config.limits)?;
        if retention.max_bytes == Some(0) {
            return Err(BrokerError::InvalidTopicConfig {
                reason: "retention max_bytes must be positive".to_string(),
            });
        }

        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(BrokerError::TopicAlreadyExists {
                topic: name.to_string(),
            });
        }

        let name: Arc<str> = Arc::from(name);
        let log_config = self.config.log.with_retention(retention);
        let now = Timestamp::now();
        let mut groups: Vec<ReplicationGroup> = Vec::with_capacity(partitions as usize);
        for (index, replicas) in place_replicas(&online, partitions, replication_factor)
            .into_iter()
            .enumerate()
        {
            let topic_partition = TopicPartition::new(name.clone(), PartitionId::new(index as u64));
            let created = ReplicationGroup::new(
                topic_partition,
                replicas,
                log_config,
                self.config.data_dir.as_deref(),
                self.config.replication,
                now,
            );
            match created {
                Ok(group) => groups.push(group),
                Err(e) => {
                    for group in groups {
                        if let Err(cleanup) = group.delete() {
                            warn!(topic = %name, error = %cleanup, "Cleanup after failed create");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        let topic = Arc::new(Topic::new(name.clone(), replication_factor, retention, groups));
        topics.insert(name.clone(), Arc::clone(&topic));
        drop(topics);

        self.coordinator.set_topic_partitions(&name, partitions).await;
        info!(
            topic = %name,
            partitions,
            replication_factor,
            retention = ?retention,
            "Created topic"
        );
        Ok(topic.describe().await)
    }

    /// Deletes a topic.
    ///
    /// The topic is hidden from new requests first, then each partition's
    /// logs are deleted one partition at a time, and finally the topic entry
    /// is removed. Committed offsets for the topic are dropped.
    ///
    /// # Errors
    /// Returns `UnknownTopic`, or the first partition deletion error after
    /// every partition was attempted.
    pub async fn delete_topic(&self, name: &str) -> BrokerResult<()> {
        let topic = self.topic(name).await?;
        if !topic.mark_deleting() {
            return Err(BrokerError::UnknownTopic {
                topic: name.to_string(),
            });
        }
        info!(topic = %name, "Deleting topic");

        let mut first_error = None;
        if let Err(e) = self.coordinator.remove_topic(name).await {
            warn!(topic = %name, error = %e, "Failed to drop committed offsets");
            first_error = Some(BrokerError::from(e));
        }
        for handle in topic.partitions() {
            let Some(group) = handle.take().await else {
                continue;
            };
            if let Err(e) = group.delete() {
                error!(topic_partition = %handle.topic_partition(), error = %e, "Failed to delete partition");
                first_error.get_or_insert(BrokerError::from(e));
            } else {
                debug!(topic_partition = %handle.topic_partition(), "Deleted partition");
            }
        }

        self.topics.write().await.remove(name);
        info!(topic = %name, "Deleted topic");
        first_error.map_or(Ok(()), Err)
    }

    /// Describes a topic.
    ///
    /// # Errors
    /// Returns `UnknownTopic`.
    pub async fn describe_topic(&self, name: &str) -> BrokerResult<TopicDescription> {
        Ok(self.topic(name).await?.describe().await)
    }

    /// Lists live topics, sorted.
    pub async fn list_topics(&self) -> Vec<String> {
        self.topics
            .read()
            .await
            .values()
            .filter(|t| !t.is_deleting())
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Looks up a live topic.
    ///
    /// # Errors
    /// Returns `UnknownTopic` if the topic does not exist or is being deleted.
    pub async fn topic(&self, name: &str) -> BrokerResult<Arc<Topic>> {
        self.topics
            .read()
            .await
            .get(name)
            .filter(|t| !t.is_deleting())
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopic {
                topic: name.to_string(),
            })
    }

    async fn all_partitions(&self) -> Vec<Arc<PartitionHandle>> {
        self.topics
            .read()
            .await
            .values()
            .filter(|t| !t.is_deleting())
            .flat_map(|t| t.partitions().iter().cloned())
            .collect()
    }

    async fn check_partition(&self, topic_partition: &TopicPartition) -> BrokerResult<()> {
        self.topic(&topic_partition.topic)
            .await?
            .partition(topic_partition.partition)
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Runs one replication fetch for every follower of every partition,
    /// then moves lagging followers out of the ISR. Returns records copied.
    ///
    /// Leader records are read under the shared partition lock; only copying
    /// them into follower logs takes the exclusive one.
    pub async fn run_replication_round(&self, now: Timestamp) -> usize {
        let mut copied = 0;
        for handle in self.all_partitions().await {
            let fetches = {
                let Ok(group) = handle.read().await else {
                    continue;
                };
                group.prepare_fetches(now)
            };
            let Ok(mut group) = handle.write().await else {
                continue;
            };
            let before = group.high_water_mark();
            copied += group.apply_fetches(fetches, now);
            group.check_lagging(now);
            let advanced = group.high_water_mark() > before;
            drop(group);
            if advanced {
                handle.notify_progress();
            }
        }
        copied
    }

    /// Applies retention to every partition. Returns the partitions that
    /// deleted segments.
    pub async fn run_retention(&self, now: Timestamp) -> Vec<(TopicPartition, RetentionOutcome)> {
        let mut swept = Vec::new();
        for handle in self.all_partitions().await {
            let Ok(mut group) = handle.write().await else {
                continue;
            };
            match group.retention_sweep(now) {
                Ok(outcome) if !outcome.is_empty() => {
                    debug!(
                        topic_partition = %handle.topic_partition(),
                        segments = outcome.deleted_segments.len(),
                        "Retention sweep"
                    );
                    swept.push((handle.topic_partition().clone(), outcome));
                }
                Ok(_) => {}
                Err(e) => {
                    error!(topic_partition = %handle.topic_partition(), error = %e, "Retention sweep failed");
                }
            }
        }
        swept
    }

    /// Evicts consumer group members whose session expired.
    pub async fn evict_expired_members(&self, now: Timestamp) -> Vec<(GroupId, MemberId)> {
        self.coordinator.evict_expired(now).await
    }

    // -------------------------------------------------------------------------
    // Consumer Groups
    // -------------------------------------------------------------------------

    /// Joins a consumer group.
    ///
    /// # Errors
    /// Returns `Group` errors from the coordinator.
    pub async fn join_group(
        &self,
        group: &GroupId,
        member: &MemberId,
        topics: &[&str],
    ) -> BrokerResult<JoinResult> {
        Ok(self
            .coordinator
            .join(group, member, topics, Timestamp::now())
            .await?)
    }

    /// Syncs a member and returns its partitions.
    ///
    /// # Errors
    /// Returns `Group` errors from the coordinator.
    pub async fn sync_group(
        &self,
        group: &GroupId,
        member: &MemberId,
        generation: u32,
    ) -> BrokerResult<Vec<TopicPartition>> {
        Ok(self
            .coordinator
            .sync(group, member, generation, Timestamp::now())
            .await?)
    }

    /// Records a member heartbeat.
    ///
    /// # Errors
    /// Returns `Group` errors from the coordinator.
    pub async fn heartbeat(&self, group: &GroupId, member: &MemberId, generation: u32) -> BrokerResult<()> {
        Ok(self
            .coordinator
            .heartbeat(group, member, generation, Timestamp::now())
            .await?)
    }

    /// Removes a member from its group.
    ///
    /// # Errors
    /// Returns `Group` errors from the coordinator.
    pub async fn leave_group(&self, group: &GroupId, member: &MemberId) -> BrokerResult<()> {
        Ok(self.coordinator.leave(group, member).await?)
    }

    /// Describes a consumer group.
    ///
    /// # Errors
    /// Returns `Group` errors from the coordinator.
    pub async fn describe_group(&self, group: &GroupId) -> BrokerResult<GroupDescription> {
        Ok(self.coordinator.describe(group).await?)
    }

    /// Deletes a consumer group that has no members, dropping its committed
    /// offsets.
    ///
    /// # Errors
    /// Returns `Group(UnknownGroup)`, `Group(NonEmptyGroup)` while members
    /// remain, or the offset store's error.
    pub async fn delete_group(&self, group: &GroupId) -> BrokerResult<()> {
        Ok(self.coordinator.delete_group(group).await?)
    }

    /// Commits a group's offset for an existing partition.
    ///
    /// # Errors
    /// Returns `UnknownTopic` or `UnknownPartition`, and `Group(StaleCommit)`
    /// when a monotonic commit would move the offset backwards.
    pub async fn commit_offset(
        &self,
        group: &GroupId,
        topic_partition: &TopicPartition,
        offset: Offset,
        mode: CommitMode,
    ) -> BrokerResult<()> {
        self.check_partition(topic_partition).await?;
        Ok(self
            .coordinator
            .commit_offset(group, topic_partition, offset, mode)
            .await?)
    }

    /// Returns a group's committed offset for a partition.
    ///
    /// # Errors
    /// Returns `UnknownTopic` or `UnknownPartition`.
    pub async fn fetch_committed_offset(
        &self,
        group: &GroupId,
        topic_partition: &TopicPartition,
    ) -> BrokerResult<Option<Offset>> {
        self.check_partition(topic_partition).await?;
        Ok(self.coordinator.fetch_committed(group, topic_partition).await)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("brokers", &self.config.brokers)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}
