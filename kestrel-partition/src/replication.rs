//! Leader/follower replication of a partition.
//!
//! A replication group owns one [`PartitionLog`] per replica. The leader
//! takes all writes; followers copy the leader's log by fetching from their
//! own log end. The in-sync replica set (ISR) is the leader plus every
//! follower that has caught up within the lag window.
//!
//! # High-water mark
//!
//! The high-water mark (HWM) bounds what consumers can read. It never moves
//! backwards, even across leader changes. See [`HighWaterMarkPolicy`].
//!
//! # Failover
//!
//! When the leader goes offline, the online in-sync replica with the highest
//! log end offset takes over (lowest broker id on ties). An out-of-sync
//! replica is never elected. When no in-sync replica is online, the last
//! leader stays in the ISR so it can resume leadership when it returns.
//! Replicas rejoining under a new leader truncate to the HWM before fetching.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kestrel_core::{NodeId, Offset, Record, Timestamp, TopicPartition};
use tracing::{debug, info, warn};

use crate::checkpoint::{LeaderCheckpoint, CHECKPOINT_FILE_NAME};
use crate::error::{PartitionError, ReplicationError, ReplicationResult};
use crate::log::{FetchIsolation, FetchResult, LogConfig, LogStorage, PartitionLog};
use crate::replica::ReplicaState;
use crate::retention::RetentionOutcome;

/// How the high-water mark is derived from replica log end offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HighWaterMarkPolicy {
    /// Minimum log end offset across the leader and all in-sync followers.
    #[default]
    AllInSync,
    /// Highest log end offset reached by a strict majority of the replica set.
    Majority,
}

/// Durability requested by a producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge once the leader has appended.
    Leader,
    /// Acknowledge once the records are below the high-water mark.
    #[default]
    All,
}

/// Replication tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// An in-sync follower that has not caught up for this long leaves the ISR.
    pub replica_lag_max_ms: u64,
    /// Maximum bytes a follower copies per fetch.
    pub replica_fetch_max_bytes: u64,
    /// High-water mark rule.
    pub hwm_policy: HighWaterMarkPolicy,
    /// Minimum ISR size for `AckMode::All` writes.
    pub min_in_sync_replicas: u32,
    /// First retry delay after a failed follower fetch.
    pub retry_backoff_ms: u64,
    /// Upper bound of the retry delay.
    pub retry_backoff_max_ms: u64,
}

impl ReplicationConfig {
    /// Creates a config with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            replica_lag_max_ms: 10_000,
            replica_fetch_max_bytes: 1024 * 1024,
            hwm_policy: HighWaterMarkPolicy::AllInSync,
            min_in_sync_replicas: 1,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 5_000,
        }
    }

    /// Sets the lag window.
    #[must_use]
    pub const fn with_replica_lag_max_ms(mut self, ms: u64) -> Self {
        self.replica_lag_max_ms = ms;
        self
    }

    /// Sets the per-fetch byte limit.
    #[must_use]
    pub const fn with_replica_fetch_max_bytes(mut self, bytes: u64) -> Self {
        self.replica_fetch_max_bytes = bytes;
        self
    }

    /// Sets the high-water mark policy.
    #[must_use]
    pub const fn with_hwm_policy(mut self, policy: HighWaterMarkPolicy) -> Self {
        self.hwm_policy = policy;
        self
    }

    /// Sets the minimum ISR size for all-replica writes.
    #[must_use]
    pub const fn with_min_in_sync_replicas(mut self, count: u32) -> Self {
        self.min_in_sync_replicas = count;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidReplicaSet` describing the first invalid setting.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.min_in_sync_replicas == 0 {
            return Err(ReplicationError::InvalidReplicaSet {
                reason: "min_in_sync_replicas must be positive".to_string(),
            });
        }
        if self.replica_fetch_max_bytes == 0 {
            return Err(ReplicationError::InvalidReplicaSet {
                reason: "replica_fetch_max_bytes must be positive".to_string(),
            });
        }
        if self.retry_backoff_ms > self.retry_backoff_max_ms {
            return Err(ReplicationError::InvalidReplicaSet {
                reason: "retry_backoff_ms must not exceed retry_backoff_max_ms".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Offsets assigned by a leader append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Offset of the first appended record.
    pub base_offset: Offset,
    /// Offset after the last appended record.
    pub next_offset: Offset,
    /// High-water mark right after the append.
    pub high_water_mark: Offset,
}

/// A completed leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadershipChange {
    /// Leader before the election, if known.
    pub previous: Option<NodeId>,
    /// The new leader.
    pub leader: NodeId,
    /// The new leader epoch.
    pub epoch: u64,
}

/// Point-in-time description of a replicated partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    /// Which partition.
    pub topic_partition: TopicPartition,
    /// Current leader, if any.
    pub leader: Option<NodeId>,
    /// Current leader epoch.
    pub leader_epoch: u64,
    /// Replica set in assignment order.
    pub replicas: Vec<NodeId>,
    /// In-sync replicas, sorted by broker id.
    pub in_sync_replicas: Vec<NodeId>,
    /// Replicas whose broker is offline, sorted by broker id.
    pub offline_replicas: Vec<NodeId>,
    /// Committed offset bound.
    pub high_water_mark: Offset,
    /// First retained offset on the leader.
    pub log_start_offset: Offset,
    /// Leader log end offset.
    pub log_end_offset: Offset,
}

/// Records read from the leader for one follower, not yet applied.
///
/// Produced under shared access by [`ReplicationGroup::prepare_fetches`].
/// A fetch is discarded on apply if the leader epoch or the follower's log
/// end changed in between.
#[derive(Debug, Clone)]
pub struct ReplicaFetch {
    follower: NodeId,
    leader_epoch: u64,
    fetch_from: Offset,
    leader_start: Offset,
    leader_end: Offset,
    records: Vec<Record>,
}

impl ReplicaFetch {
    /// Returns the follower this fetch is for.
    #[must_use]
    pub const fn follower(&self) -> NodeId {
        self.follower
    }

    /// Returns the number of records read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the follower had nothing to copy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One replica of the partition.
#[derive(Debug)]
struct Replica {
    broker: NodeId,
    log: PartitionLog,
    state: ReplicaState,
    online: bool,
    failed_fetches: u32,
    retry_at: Option<Timestamp>,
}

/// A partition replicated across a fixed set of brokers.
#[derive(Debug)]
pub struct ReplicationGroup {
    topic_partition: TopicPartition,
    config: ReplicationConfig,
    /// Assignment order; the first entry is the preferred leader.
    replica_set: Vec<NodeId>,
    replicas: BTreeMap<NodeId, Replica>,
    leader: Option<NodeId>,
    /// Most recently elected leader, kept while the partition is leaderless.
    last_leader: Option<NodeId>,
    leader_epoch: u64,
    high_water_mark: Offset,
    /// Leader checkpoint location for file-backed groups.
    checkpoint_path: Option<PathBuf>,
}

/// Picks the leader of a group whose logs were just opened.
///
/// The checkpointed leader wins if it still holds every committed record.
/// Otherwise the longest log wins, earliest in the replica set on ties, and
/// the epoch moves past the checkpointed one.
fn recovered_leader(
    preferred: NodeId,
    replica_set: &[NodeId],
    replicas: &BTreeMap<NodeId, Replica>,
    checkpoint: Option<LeaderCheckpoint>,
) -> (NodeId, u64) {
    let end_of = |broker: &NodeId| {
        replicas
            .get(broker)
            .map_or(Offset::ZERO, |r| r.log.log_end_offset())
    };
    if let Some(checkpoint) = checkpoint {
        if replicas.contains_key(&checkpoint.leader)
            && end_of(&checkpoint.leader) >= checkpoint.high_water_mark
        {
            return (checkpoint.leader, checkpoint.leader_epoch);
        }
    }

    let mut best = preferred;
    for broker in replica_set {
        if end_of(broker) > end_of(&best) {
            best = *broker;
        }
    }
    let epoch = checkpoint.map_or(0, |c| c.leader_epoch + 1);
    (best, epoch)
}

impl ReplicationGroup {
    /// Creates a replication group, recovering any replica logs on disk.
    ///
    /// With `data_dir` set, each replica's segments live under
    /// `<data_dir>/<topic>-<partition>/<broker>/` next to a leader checkpoint.
    /// A fresh group is led by the first replica. A recovered group is led by
    /// the checkpointed leader, or by the longest log when no usable
    /// checkpoint exists (earliest in the replica set on ties). Every other
    /// replica is cut back to the checkpointed high-water mark and fetches
    /// the rest from the leader.
    ///
    /// # Errors
    /// Returns `InvalidReplicaSet` for an empty or duplicated replica set or
    /// a bad config, and `Partition` if a log or the checkpoint cannot be read.
    pub fn new(
        topic_partition: TopicPartition,
        replica_set: Vec<NodeId>,
        log_config: LogConfig,
        data_dir: Option<&Path>,
        config: ReplicationConfig,
        now: Timestamp,
    ) -> ReplicationResult<Self> {
        config.validate()?;
        let Some(&preferred) = replica_set.first() else {
            return Err(ReplicationError::InvalidReplicaSet {
                reason: "replica set is empty".to_string(),
            });
        };

        let partition_dir = data_dir.map(|root| root.join(topic_partition.to_string()));
        let checkpoint_path = partition_dir.as_ref().map(|dir| dir.join(CHECKPOINT_FILE_NAME));
        let checkpoint = match &checkpoint_path {
            Some(path) => LeaderCheckpoint::read(path)?,
            None => None,
        };

        let mut replicas = BTreeMap::new();
        for &broker in &replica_set {
            let storage = partition_dir.as_ref().map_or(LogStorage::Memory, |dir| {
                LogStorage::Directory(dir.join(broker.to_string()))
            });
            let log = PartitionLog::open(topic_partition.clone(), log_config, storage, now)?;
            let replica = Replica {
                broker,
                log,
                state: ReplicaState::Follower,
                online: true,
                failed_fetches: 0,
                retry_at: None,
            };
            if replicas.insert(broker, replica).is_some() {
                return Err(ReplicationError::InvalidReplicaSet {
                    reason: format!("{broker} appears twice"),
                });
            }
        }

        let (leader, leader_epoch) = recovered_leader(preferred, &replica_set, &replicas, checkpoint);
        let mut group = Self {
            topic_partition,
            config,
            replica_set,
            replicas,
            leader: Some(leader),
            last_leader: Some(leader),
            leader_epoch,
            high_water_mark: Offset::ZERO,
            checkpoint_path,
        };

        let leader_end = group.replica(leader)?.log.log_end_offset();
        // Records below the checkpointed mark are identical on every replica
        // that holds them. Anything past it may have diverged.
        let committed = checkpoint.map(|c| c.high_water_mark.min(leader_end));
        for replica in group.replicas.values_mut() {
            if replica.broker == leader {
                replica.state = ReplicaState::Leader {
                    epoch: leader_epoch,
                };
                if let Some(committed) = committed {
                    replica.log.advance_high_water_mark(committed);
                }
                continue;
            }
            let keep = committed
                .unwrap_or(leader_end)
                .max(replica.log.log_start_offset());
            if replica.log.log_end_offset() > keep {
                replica.log.truncate_to(keep)?;
            }
            let caught_up = replica.log.log_end_offset() == leader_end;
            replica.state = replica.state.on_fetch(caught_up, now);
        }
        group.high_water_mark = group.replica(leader)?.log.high_water_mark();
        group.recompute_high_water_mark();
        group.write_checkpoint()?;

        info!(
            topic_partition = %group.topic_partition,
            leader = %leader,
            epoch = leader_epoch,
            replicas = group.replica_set.len(),
            high_water_mark = group.high_water_mark.get(),
            "Created replication group"
        );
        Ok(group)
    }

    fn write_checkpoint(&self) -> ReplicationResult<()> {
        let (Some(path), Some(leader)) = (&self.checkpoint_path, self.leader.or(self.last_leader))
        else {
            return Ok(());
        };
        LeaderCheckpoint {
            leader,
            leader_epoch: self.leader_epoch,
            high_water_mark: self.high_water_mark,
        }
        .write(path)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Returns the partition this group replicates.
    #[must_use]
    pub const fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Returns the current leader, if the partition has one.
    #[must_use]
    pub const fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Returns the current leader epoch.
    #[must_use]
    pub const fn leader_epoch(&self) -> u64 {
        self.leader_epoch
    }

    /// Returns the high-water mark.
    #[must_use]
    pub const fn high_water_mark(&self) -> Offset {
        self.high_water_mark
    }

    /// Returns the replica set in assignment order.
    #[must_use]
    pub fn replica_set(&self) -> &[NodeId] {
        &self.replica_set
    }

    /// Returns the state of a replica.
    #[must_use]
    pub fn replica_state(&self, broker: NodeId) -> Option<ReplicaState> {
        self.replicas.get(&broker).map(|r| r.state)
    }

    /// Returns a replica's log.
    #[must_use]
    pub fn replica_log(&self, broker: NodeId) -> Option<&PartitionLog> {
        self.replicas.get(&broker).map(|r| &r.log)
    }

    /// Returns the ISR, sorted by broker id.
    #[must_use]
    pub fn in_sync_replicas(&self) -> Vec<NodeId> {
        self.replicas
            .values()
            .filter(|r| r.state.is_in_sync())
            .map(|r| r.broker)
            .collect()
    }

    /// Returns the number of online in-sync replicas.
    #[must_use]
    pub fn online_in_sync_count(&self) -> u32 {
        let count = self
            .replicas
            .values()
            .filter(|r| r.online && r.state.is_in_sync())
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Returns the first retained offset on the leader (or the last leader).
    #[must_use]
    pub fn log_start_offset(&self) -> Offset {
        self.reference_log()
            .map_or(Offset::ZERO, PartitionLog::log_start_offset)
    }

    /// Returns the log end offset of the leader (or the last leader).
    #[must_use]
    pub fn log_end_offset(&self) -> Offset {
        self.reference_log()
            .map_or(Offset::ZERO, PartitionLog::log_end_offset)
    }

    fn reference_log(&self) -> Option<&PartitionLog> {
        self.leader
            .or(self.last_leader)
            .and_then(|id| self.replicas.get(&id))
            .map(|r| &r.log)
    }

    /// Returns a point-in-time description of the partition.
    #[must_use]
    pub fn describe(&self) -> PartitionStatus {
        PartitionStatus {
            topic_partition: self.topic_partition.clone(),
            leader: self.leader,
            leader_epoch: self.leader_epoch,
            replicas: self.replica_set.clone(),
            in_sync_replicas: self.in_sync_replicas(),
            offline_replicas: self
                .replicas
                .values()
                .filter(|r| !r.online)
                .map(|r| r.broker)
                .collect(),
            high_water_mark: self.high_water_mark,
            log_start_offset: self.log_start_offset(),
            log_end_offset: self.log_end_offset(),
        }
    }

    fn replica(&self, broker: NodeId) -> ReplicationResult<&Replica> {
        self.replicas
            .get(&broker)
            .ok_or(ReplicationError::UnknownReplica { broker })
    }

    fn replica_mut(&mut self, broker: NodeId) -> ReplicationResult<&mut Replica> {
        self.replicas
            .get_mut(&broker)
            .ok_or(ReplicationError::UnknownReplica { broker })
    }

    fn online_leader(&self) -> ReplicationResult<NodeId> {
        match self.leader {
            Some(leader) if self.replicas.get(&leader).is_some_and(|r| r.online) => Ok(leader),
            _ => Err(ReplicationError::LeaderUnavailable {
                last_leader: self.last_leader,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    /// Appends records to the leader.
    ///
    /// The returned high-water mark reflects only the leader append; followers
    /// catch up through [`ReplicationGroup::replicate`].
    ///
    /// # Errors
    /// Returns `LeaderUnavailable` without an online leader, and
    /// `NotEnoughReplicas` for `AckMode::All` when the online ISR is smaller
    /// than `min_in_sync_replicas`.
    pub fn append(
        &mut self,
        records: Vec<Record>,
        acks: AckMode,
        now: Timestamp,
    ) -> ReplicationResult<AppendOutcome> {
        let leader = self.online_leader()?;

        if acks == AckMode::All {
            let in_sync = self.online_in_sync_count();
            if in_sync < self.config.min_in_sync_replicas {
                return Err(ReplicationError::NotEnoughReplicas {
                    required: self.config.min_in_sync_replicas,
                    in_sync,
                });
            }
        }

        let log = &mut self.replica_mut(leader)?.log;
        let base_offset = log.append_batch(records, now)?;
        let next_offset = log.log_end_offset();

        let high_water_mark = self.recompute_high_water_mark();
        debug!(
            topic_partition = %self.topic_partition,
            base_offset = base_offset.get(),
            next_offset = next_offset.get(),
            "Appended to leader"
        );
        Ok(AppendOutcome {
            base_offset,
            next_offset,
            high_water_mark,
        })
    }

    /// Runs one replication fetch for `follower`. Returns the number of
    /// records copied.
    ///
    /// # Errors
    /// Returns `UnknownReplica`, `ReplicaOffline` or `LeaderUnavailable` when
    /// the fetch cannot run, and `Partition` if either log fails.
    pub fn replicate(&mut self, follower: NodeId, now: Timestamp) -> ReplicationResult<usize> {
        if self.leader == Some(follower) {
            return Ok(0);
        }
        let fetch = self.prepare_fetch(follower)?;
        self.apply_fetch(fetch, now)
    }

    /// Runs one replication fetch for every online follower that is not
    /// backing off. Returns the total number of records copied.
    pub fn replicate_all(&mut self, now: Timestamp) -> usize {
        let fetches = self.prepare_fetches(now);
        self.apply_fetches(fetches, now)
    }

    /// Reads what every due follower needs from the leader.
    ///
    /// Needs only shared access, so it can run alongside fetches. The result
    /// goes to [`ReplicationGroup::apply_fetches`].
    #[must_use]
    pub fn prepare_fetches(&self, now: Timestamp) -> Vec<(NodeId, ReplicationResult<ReplicaFetch>)> {
        let Some(leader) = self.leader else {
            return Vec::new();
        };
        self.replicas
            .values()
            .filter(|r| r.broker != leader && r.online)
            .filter(|r| r.retry_at.map_or(true, |at| at <= now))
            .map(|r| (r.broker, self.prepare_fetch(r.broker)))
            .collect()
    }

    /// Copies prepared fetches into follower logs. Returns the number of
    /// records copied; failed fetches start a retry backoff.
    pub fn apply_fetches(
        &mut self,
        fetches: Vec<(NodeId, ReplicationResult<ReplicaFetch>)>,
        now: Timestamp,
    ) -> usize {
        let mut copied = 0;
        for (follower, fetch) in fetches {
            match fetch.and_then(|fetch| self.apply_fetch(fetch, now)) {
                Ok(count) => copied += count,
                Err(err) => self.record_fetch_failure(follower, &err, now),
            }
        }
        copied
    }

    fn prepare_fetch(&self, follower: NodeId) -> ReplicationResult<ReplicaFetch> {
        let leader = self.online_leader()?;
        let replica = self.replica(follower)?;
        if !replica.online {
            return Err(ReplicationError::ReplicaOffline { broker: follower });
        }
        let fetch_from = replica.log.log_end_offset();

        let leader_log = &self.replica(leader)?.log;
        let leader_start = leader_log.log_start_offset();
        let leader_end = leader_log.log_end_offset();
        let records = if fetch_from >= leader_start && fetch_from < leader_end {
            leader_log
                .fetch(fetch_from, self.config.replica_fetch_max_bytes, FetchIsolation::LogEnd)?
                .records
        } else {
            Vec::new()
        };
        Ok(ReplicaFetch {
            follower,
            leader_epoch: self.leader_epoch,
            fetch_from,
            leader_start,
            leader_end,
            records,
        })
    }

    fn apply_fetch(&mut self, fetch: ReplicaFetch, now: Timestamp) -> ReplicationResult<usize> {
        let ReplicaFetch {
            follower,
            leader_epoch,
            fetch_from,
            leader_start,
            leader_end,
            records,
        } = fetch;
        let leader = self.online_leader()?;
        let high_water_mark = self.high_water_mark;
        let current_epoch = self.leader_epoch;
        let replica = self.replica_mut(follower)?;
        if !replica.online {
            return Err(ReplicationError::ReplicaOffline { broker: follower });
        }
        // Leadership or the follower log moved since the read; drop it.
        if leader_epoch != current_epoch || replica.log.log_end_offset() != fetch_from {
            return Ok(0);
        }

        if fetch_from < leader_start {
            // The leader no longer retains what this replica needs next.
            replica.log.reset_to(leader_start)?;
        } else if fetch_from > leader_end {
            replica.log.truncate_to(leader_end)?;
        }
        replica.log.append_replicated(&records, now)?;
        replica.log.advance_high_water_mark(high_water_mark);

        let follower_end = replica.log.log_end_offset();
        let leader_end = self.replica(leader)?.log.log_end_offset();
        let replica = self.replica_mut(follower)?;
        let before = replica.state;
        replica.state = before.on_fetch(follower_end == leader_end, now);
        replica.failed_fetches = 0;
        replica.retry_at = None;
        let after = replica.state;

        if !before.is_in_sync() && after.is_in_sync() {
            info!(
                topic_partition = %self.topic_partition,
                broker = %follower,
                from = before.name(),
                "Replica joined in-sync set"
            );
        }

        self.recompute_high_water_mark();
        Ok(records.len())
    }

    fn record_fetch_failure(&mut self, follower: NodeId, err: &ReplicationError, now: Timestamp) {
        let base = self.config.retry_backoff_ms;
        let max = self.config.retry_backoff_max_ms;
        let topic_partition = self.topic_partition.clone();
        if let Some(replica) = self.replicas.get_mut(&follower) {
            replica.failed_fetches = replica.failed_fetches.saturating_add(1);
            let shift = replica.failed_fetches.saturating_sub(1).min(16);
            let delay = base.saturating_mul(1 << shift).min(max);
            // Safe cast: delay is capped by retry_backoff_max_ms.
            #[allow(clippy::cast_possible_wrap)]
            let retry_at = Timestamp::from_millis(now.as_millis().saturating_add(delay as i64));
            replica.retry_at = Some(retry_at);
            warn!(
                topic_partition = %topic_partition,
                broker = %follower,
                attempts = replica.failed_fetches,
                retry_in_ms = delay,
                error = %err,
                "Replication fetch failed"
            );
        }
    }

    /// Moves followers that have not caught up within the lag window out of
    /// the ISR. Returns the brokers removed.
    pub fn check_lagging(&mut self, now: Timestamp) -> Vec<NodeId> {
        let max_lag = self.config.replica_lag_max_ms;
        let leader = self.leader;
        let mut removed = Vec::new();
        for replica in self.replicas.values_mut() {
            if Some(replica.broker) == leader || !replica.online {
                continue;
            }
            let before = replica.state;
            replica.state = before.on_lag_check(now, max_lag);
            if before.is_in_sync() && !replica.state.is_in_sync() {
                removed.push(replica.broker);
            }
        }

        if !removed.is_empty() {
            info!(
                topic_partition = %self.topic_partition,
                removed = ?removed,
                "Replicas left in-sync set"
            );
            self.recompute_high_water_mark();
        }
        removed
    }

    /// Recomputes the high-water mark from replica log end offsets and
    /// propagates it to every replica. Returns the resulting mark.
    pub fn recompute_high_water_mark(&mut self) -> Offset {
        let Some(leader) = self.leader else {
            return self.high_water_mark;
        };
        let Some(leader_end) = self.replicas.get(&leader).map(|r| r.log.log_end_offset()) else {
            return self.high_water_mark;
        };

        let candidate = match self.config.hwm_policy {
            HighWaterMarkPolicy::AllInSync => self
                .replicas
                .values()
                .filter(|r| r.online && r.state.is_in_sync())
                .map(|r| r.log.log_end_offset())
                .min()
                .unwrap_or(leader_end),
            HighWaterMarkPolicy::Majority => {
                let mut ends: Vec<Offset> = self
                    .replicas
                    .values()
                    .map(|r| r.log.log_end_offset())
                    .collect();
                ends.sort_unstable_by(|a, b| b.cmp(a));
                let quorum = ends.len() / 2 + 1;
                ends.get(quorum - 1).copied().unwrap_or(leader_end)
            }
        };

        let before = self.high_water_mark;
        let candidate = candidate.max(before);
        if let Some(replica) = self.replicas.get_mut(&leader) {
            self.high_water_mark = replica.log.advance_high_water_mark(candidate).max(before);
        }
        let high_water_mark = self.high_water_mark;
        for replica in self.replicas.values_mut() {
            replica.log.advance_high_water_mark(high_water_mark);
        }

        // Invariant: the high-water mark never decreases.
        debug_assert!(self.high_water_mark >= before);
        if self.high_water_mark > before {
            debug!(
                topic_partition = %self.topic_partition,
                high_water_mark = self.high_water_mark.get(),
                "Advanced high-water mark"
            );
        }
        self.high_water_mark
    }

    // ------------------------------------------------------------------------
    // Membership and failover
    // ------------------------------------------------------------------------

    /// Marks a replica's broker online or offline.
    ///
    /// Going offline removes the replica from the ISR; if it led the
    /// partition, a new leader is elected. Coming back online truncates the
    /// replica to the high-water mark and, if the partition is leaderless,
    /// attempts an election. Returns the leadership change, if any.
    ///
    /// # Errors
    /// Returns `UnknownReplica` for a broker outside the replica set, and
    /// `NoEligibleLeader` or `ReplicaSetLost` when an election was needed but
    /// could not pick a leader. The broker's online flag is updated either way.
    pub fn set_replica_online(
        &mut self,
        broker: NodeId,
        online: bool,
        now: Timestamp,
    ) -> ReplicationResult<Option<LeadershipChange>> {
        let was_leader = self.leader == Some(broker);
        let high_water_mark = self.high_water_mark;
        let has_leader = self.leader.is_some();
        let topic_partition = self.topic_partition.clone();
        let replica = self.replica_mut(broker)?;

        if replica.online == online {
            if online && !has_leader {
                return self.elect_leader(now).map(Some);
            }
            return Ok(None);
        }
        replica.online = online;

        if !online {
            if was_leader {
                // Stays in the ISR until another in-sync replica takes over.
                replica.state = ReplicaState::InSync { caught_up_at: now };
                self.leader = None;
                warn!(topic_partition = %topic_partition, broker = %broker, "Partition leader went offline");
                return self.elect_leader(now).map(Some);
            }
            let before = replica.state;
            replica.state = before.on_offline(now);
            if before.is_in_sync() {
                info!(topic_partition = %topic_partition, broker = %broker, "Offline replica left in-sync set");
            }
            self.recompute_high_water_mark();
            return Ok(None);
        }

        replica.failed_fetches = 0;
        replica.retry_at = None;
        // A returning last leader keeps its log so it can lead again.
        let resumes_leadership = !has_leader && replica.state.is_in_sync();
        if !resumes_leadership {
            replica.log.truncate_to(high_water_mark.max(replica.log.high_water_mark()))?;
            replica.state = ReplicaState::Follower;
        }
        info!(
            topic_partition = %topic_partition,
            broker = %broker,
            log_end_offset = replica.log.log_end_offset().get(),
            "Replica back online"
        );

        if has_leader {
            Ok(None)
        } else {
            self.elect_leader(now).map(Some)
        }
    }

    /// Elects a leader among the online in-sync replicas.
    ///
    /// Picks the highest log end offset, then the lowest broker id. Followers
    /// holding records past the new leader's log end are truncated to it.
    ///
    /// # Errors
    /// Returns `ReplicaSetLost` if every replica is offline, and
    /// `NoEligibleLeader` if no online replica is in sync.
    pub fn elect_leader(&mut self, now: Timestamp) -> ReplicationResult<LeadershipChange> {
        if self.replicas.values().all(|r| !r.online) {
            warn!(topic_partition = %self.topic_partition, "All replicas offline");
            return Err(ReplicationError::ReplicaSetLost);
        }

        let high_water_mark = self.high_water_mark;
        let chosen = self
            .replicas
            .values()
            .filter(|r| r.online && r.state.is_in_sync())
            .filter(|r| r.log.log_end_offset() >= high_water_mark)
            .max_by(|a, b| {
                a.log
                    .log_end_offset()
                    .cmp(&b.log.log_end_offset())
                    .then_with(|| b.broker.cmp(&a.broker))
            })
            .map(|r| (r.broker, r.log.log_end_offset()));

        let Some((leader, leader_end)) = chosen else {
            warn!(topic_partition = %self.topic_partition, "No eligible leader");
            return Err(ReplicationError::NoEligibleLeader);
        };

        let previous = self.leader.or(self.last_leader);
        self.leader_epoch += 1;
        let epoch = self.leader_epoch;

        for replica in self.replicas.values_mut() {
            if replica.broker == leader {
                replica.state = ReplicaState::Leader { epoch };
                replica.log.advance_high_water_mark(high_water_mark);
                continue;
            }
            if !replica.online {
                replica.state = replica.state.on_offline(now);
                continue;
            }
            if replica.state.is_leader() {
                replica.state = ReplicaState::InSync { caught_up_at: now };
            }
            if replica.log.log_end_offset() > leader_end {
                replica.log.truncate_to(leader_end)?;
            }
        }

        self.leader = Some(leader);
        self.last_leader = Some(leader);
        self.recompute_high_water_mark();
        if let Err(err) = self.write_checkpoint() {
            warn!(
                topic_partition = %self.topic_partition,
                leader = %leader,
                error = %err,
                "Failed to write leader checkpoint"
            );
        }

        info!(
            topic_partition = %self.topic_partition,
            leader = %leader,
            previous = ?previous,
            epoch,
            log_end_offset = leader_end.get(),
            "Elected partition leader"
        );
        Ok(LeadershipChange {
            previous,
            leader,
            epoch,
        })
    }

    // ------------------------------------------------------------------------
    // Reads and maintenance
    // ------------------------------------------------------------------------

    /// Reads committed records from the leader.
    ///
    /// # Errors
    /// Returns `LeaderUnavailable` without an online leader, and `Partition`
    /// for out-of-range offsets.
    pub fn fetch(&self, start: Offset, max_bytes: u64) -> ReplicationResult<FetchResult> {
        let leader = self.online_leader()?;
        Ok(self
            .replica(leader)?
            .log
            .fetch(start, max_bytes, FetchIsolation::HighWaterMark)?)
    }

    /// Applies retention to every online replica. Returns the leader's outcome.
    ///
    /// # Errors
    /// Returns `Partition` if a segment cannot be deleted.
    pub fn retention_sweep(&mut self, now: Timestamp) -> ReplicationResult<RetentionOutcome> {
        let leader = self.leader;
        let mut leader_outcome = RetentionOutcome::default();
        for replica in self.replicas.values_mut().filter(|r| r.online) {
            let outcome = replica.log.retention_sweep(now)?;
            if Some(replica.broker) == leader {
                leader_outcome = outcome;
            }
        }
        self.write_checkpoint()?;
        Ok(leader_outcome)
    }

    /// Syncs every replica's active segment, then the leader checkpoint.
    ///
    /// # Errors
    /// Returns `Partition` if a sync or the checkpoint write fails.
    pub fn flush(&self) -> ReplicationResult<()> {
        for replica in self.replicas.values() {
            replica.log.flush()?;
        }
        self.write_checkpoint()
    }

    /// Deletes every replica's log.
    ///
    /// # Errors
    /// Returns `Partition` if files cannot be removed.
    pub fn delete(self) -> ReplicationResult<()> {
        for replica in self.replicas.into_values() {
            replica.log.delete()?;
        }
        let Some(dir) = self.checkpoint_path.as_deref().and_then(Path::parent) else {
            return Ok(());
        };
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PartitionError::io("partition delete dir", &e).into()),
        }
    }
}
