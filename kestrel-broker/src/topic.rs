//! Topics: validation, replica placement and per-partition handles.
//!
//! Each partition's replication group sits behind its own read-write lock.
//! Fetches, offset lookups and follower reads share it; appends, applying
//! follower copies and membership changes take it exclusively. Nothing locks
//! across partitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_core::{Limits, NodeId, PartitionId, TopicPartition};
use kestrel_partition::{PartitionStatus, ReplicationGroup, RetentionPolicy};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BrokerError, BrokerResult};
use crate::partitioner::Partitioner;

/// Topic names starting with this prefix are reserved.
pub const INTERNAL_TOPIC_PREFIX: &str = "__";

// -----------------------------------------------------------------------------
// Validation and Placement
// -----------------------------------------------------------------------------

/// Validates topic creation arguments against the cluster.
///
/// # Errors
/// Returns `InvalidTopicConfig` naming the first problem.
pub fn validate_topic(
    name: &str,
    partitions: u32,
    replication_factor: u32,
    broker_count: usize,
    limits: &Limits,
) -> BrokerResult<()> {
    let invalid = |reason: String| Err(BrokerError::InvalidTopicConfig { reason });

    if name.is_empty() || name == "." || name == ".." {
        return invalid(format!("illegal topic name {name:?}"));
    }
    if name.starts_with(INTERNAL_TOPIC_PREFIX) {
        return invalid(format!("topic name {name:?} uses the reserved prefix"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return invalid(format!("topic name {name:?} contains illegal character {c:?}"));
    }
    if partitions == 0 {
        return invalid("partition count must be at least 1".to_string());
    }
    if replication_factor == 0 {
        return invalid("replication factor must be at least 1".to_string());
    }
    if replication_factor as usize > broker_count {
        return invalid(format!(
            "replication factor {replication_factor} exceeds available brokers ({broker_count})"
        ));
    }
    limits
        .check_topic(name, partitions, replication_factor)
        .or_else(|e| invalid(e.to_string()))
}

/// Places replicas for each partition.
///
/// Partition `p` is led by broker `p % n` (round-robin), and its followers
/// are the next brokers in order, so no broker holds two replicas of one
/// partition.
///
/// # Panics
/// Panics if `replication_factor` is zero or exceeds the broker count.
#[must_use]
pub fn place_replicas(brokers: &[NodeId], partitions: u32, replication_factor: u32) -> Vec<Vec<NodeId>> {
    let factor = replication_factor as usize;
    assert!(factor > 0 && factor <= brokers.len(), "replication factor out of range");

    let assignment: Vec<Vec<NodeId>> = (0..partitions as usize)
        .map(|p| (0..factor).map(|i| brokers[(p + i) % brokers.len()]).collect())
        .collect();

    // Postcondition: replicas of a partition are distinct brokers.
    debug_assert!(assignment.iter().all(|replicas| {
        let mut sorted = replicas.clone();
        sorted.sort();
        sorted.dedup();
        sorted.len() == replicas.len()
    }));
    assignment
}

// -----------------------------------------------------------------------------
// Partition Handle
// -----------------------------------------------------------------------------

/// One partition of a topic.
///
/// The replication group is taken out when the partition is deleted;
/// later lookups report the topic as unknown.
#[derive(Debug)]
pub struct PartitionHandle {
    topic_partition: TopicPartition,
    group: RwLock<Option<ReplicationGroup>>,
    /// Signalled when the high-water mark or leadership changes.
    progress: Notify,
}

impl PartitionHandle {
    /// Wraps a replication group.
    #[must_use]
    pub fn new(group: ReplicationGroup) -> Self {
        Self {
            topic_partition: group.topic_partition().clone(),
            group: RwLock::new(Some(group)),
            progress: Notify::new(),
        }
    }

    /// Returns the partition this handle serves.
    #[must_use]
    pub const fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Locks the partition for shared access.
    ///
    /// # Errors
    /// Returns `UnknownTopic` if the partition has been deleted.
    pub async fn read(&self) -> BrokerResult<RwLockReadGuard<'_, ReplicationGroup>> {
        RwLockReadGuard::try_map(self.group.read().await, Option::as_ref)
            .map_err(|_| self.deleted())
    }

    /// Locks the partition for exclusive access.
    ///
    /// # Errors
    /// Returns `UnknownTopic` if the partition has been deleted.
    pub async fn write(&self) -> BrokerResult<RwLockMappedWriteGuard<'_, ReplicationGroup>> {
        RwLockWriteGuard::try_map(self.group.write().await, Option::as_mut)
            .map_err(|_| self.deleted())
    }

    /// Removes and returns the replication group, if still present.
    pub async fn take(&self) -> Option<ReplicationGroup> {
        let group = self.group.write().await.take();
        self.notify_progress();
        group
    }

    /// Returns a future that resolves on the next progress signal.
    ///
    /// Call [`Notified::enable`] on it before checking the partition so a
    /// signal sent in between is not missed.
    pub fn progressed(&self) -> Notified<'_> {
        self.progress.notified()
    }

    /// Wakes everything waiting in [`PartitionHandle::progressed`].
    pub fn notify_progress(&self) {
        self.progress.notify_waiters();
    }

    fn deleted(&self) -> BrokerError {
        BrokerError::UnknownTopic {
            topic: self.topic_partition.topic.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Topic
// -----------------------------------------------------------------------------

/// Point-in-time description of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescription {
    /// Topic name.
    pub name: Arc<str>,
    /// Configured replication factor.
    pub replication_factor: u32,
    /// Retention policy.
    pub retention: RetentionPolicy,
    /// Partition metadata, indexed by partition id.
    pub partitions: Vec<PartitionStatus>,
}

/// A named, fixed-size set of replicated partitions.
#[derive(Debug)]
pub struct Topic {
    name: Arc<str>,
    replication_factor: u32,
    retention: RetentionPolicy,
    partitions: Vec<Arc<PartitionHandle>>,
    partitioner: Partitioner,
    deleting: AtomicBool,
}

impl Topic {
    /// Creates a topic from its replication groups, ordered by partition id.
    #[must_use]
    pub fn new(
        name: Arc<str>,
        replication_factor: u32,
        retention: RetentionPolicy,
        groups: Vec<ReplicationGroup>,
    ) -> Self {
        // Precondition: groups are in partition order.
        debug_assert!(groups
            .iter()
            .enumerate()
            .all(|(i, g)| g.topic_partition().partition.index() == i));
        Self {
            name,
            replication_factor,
            retention,
            partitions: groups.into_iter().map(|g| Arc::new(PartitionHandle::new(g))).collect(),
            partitioner: Partitioner::new(),
            deleting: AtomicBool::new(false),
        }
    }

    /// Returns the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        // Safe cast: partition counts are bounded by `Limits` at creation.
        u32::try_from(self.partitions.len()).unwrap_or(u32::MAX)
    }

    /// Returns the retention policy.
    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Returns every partition handle.
    #[must_use]
    pub fn partitions(&self) -> &[Arc<PartitionHandle>] {
        &self.partitions
    }

    /// Returns one partition handle.
    ///
    /// # Errors
    /// Returns `UnknownPartition` for an index outside the topic.
    pub fn partition(&self, partition: PartitionId) -> BrokerResult<Arc<PartitionHandle>> {
        self.partitions
            .get(partition.index())
            .cloned()
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: self.name.to_string(),
                partition: partition.get(),
            })
    }

    /// Picks a partition for a record key.
    #[must_use]
    pub fn select_partition(&self, key: Option<&[u8]>) -> PartitionId {
        self.partitioner.select(key, self.partition_count())
    }

    /// Returns true once deletion has started.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    /// Marks the topic as being deleted. Returns false if it already was.
    pub fn mark_deleting(&self) -> bool {
        !self.deleting.swap(true, Ordering::AcqRel)
    }

    /// Describes the topic and all live partitions.
    pub async fn describe(&self) -> TopicDescription {
        let mut partitions = Vec::with_capacity(self.partitions.len());
        for handle in &self.partitions {
            if let Ok(group) = handle.read().await {
                partitions.push(group.describe());
            }
        }
        TopicDescription {
            name: self.name.clone(),
            replication_factor: self.replication_factor,
            retention: self.retention,
            partitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brokers(count: u64) -> Vec<NodeId> {
        (1..=count).map(NodeId::new).collect()
    }

    #[test]
    fn test_validate_topic() {
        let limits = Limits::default();
        assert!(validate_topic("orders", 3, 3, 3, &limits).is_ok());
        assert!(validate_topic("orders.v2_eu-west", 1, 1, 1, &limits).is_ok());

        for (name, partitions, factor) in [
            ("orders", 0, 1),
            ("orders", 1, 0),
            ("orders", 1, 4),
            ("", 1, 1),
            ("..", 1, 1),
            ("bad name", 1, 1),
            ("__internal", 1, 1),
            ("orders", 5_000, 1),
        ] {
            let err = validate_topic(name, partitions, factor, 3, &limits).unwrap_err();
            assert!(
                matches!(err, BrokerError::InvalidTopicConfig { .. }),
                "{name:?} {partitions} {factor}"
            );
        }
    }

    #[test]
    fn test_place_replicas_round_robin_leaders() {
        let placement = place_replicas(&brokers(3), 4, 2);
        let leaders: Vec<u64> = placement.iter().map(|r| r[0].get()).collect();
        assert_eq!(leaders, vec![1, 2, 3, 1]);
        assert_eq!(placement[2], vec![NodeId::new(3), NodeId::new(1)]);
    }

    #[test]
    fn test_place_replicas_full_factor() {
        let placement = place_replicas(&brokers(3), 3, 3);
        for replicas in &placement {
            let mut sorted = replicas.clone();
            sorted.sort();
            assert_eq!(sorted, brokers(3));
        }
    }
}
