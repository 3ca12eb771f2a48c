//! Broker error types.

use kestrel_core::{NodeId, RecordError, TopicPartition};
use kestrel_group::GroupError;
use kestrel_partition::{PartitionError, ReplicationError};

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker error type.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Topic does not exist or is being deleted.
    #[error("unknown topic: {topic}")]
    UnknownTopic {
        /// The topic name.
        topic: String,
    },

    /// Partition index is outside the topic.
    #[error("partition {partition} not found in topic {topic}")]
    UnknownPartition {
        /// The topic name.
        topic: String,
        /// The partition index.
        partition: u64,
    },

    /// Topic already exists.
    #[error("topic already exists: {topic}")]
    TopicAlreadyExists {
        /// The topic name.
        topic: String,
    },

    /// Topic creation arguments were rejected. Nothing was created.
    #[error("invalid topic config: {reason}")]
    InvalidTopicConfig {
        /// Why the topic was rejected.
        reason: String,
    },

    /// This broker does not lead the partition.
    #[error("not leader for partition {topic_partition} (leader: {leader_hint:?})")]
    NotLeaderForPartition {
        /// The partition.
        topic_partition: TopicPartition,
        /// The current leader, if one is known.
        leader_hint: Option<NodeId>,
    },

    /// Broker id is not part of the cluster.
    #[error("unknown broker {broker}")]
    UnknownBroker {
        /// The broker id.
        broker: NodeId,
    },

    /// Broker is offline and cannot serve requests.
    #[error("broker {broker} is offline")]
    BrokerOffline {
        /// The broker id.
        broker: NodeId,
    },

    /// Produce was not acknowledged within the ack timeout.
    #[error("request timed out after {timeout_ms}ms on {topic_partition}")]
    RequestTimedOut {
        /// The partition.
        topic_partition: TopicPartition,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// Malformed request.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong.
        reason: String,
    },

    /// Record exceeds a limit.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// Partition log error (out of range, corrupt segment, I/O).
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Replication error (no leader, not enough replicas, replica set lost).
    #[error(transparent)]
    Replication(ReplicationError),

    /// Consumer group error.
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Invalid configuration.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Configuration error description.
        message: String,
    },

    /// I/O error outside partition logs.
    #[error("I/O error during {operation}: {message}")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },
}

impl From<ReplicationError> for BrokerError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Partition(inner) => Self::Partition(inner),
            other => Self::Replication(other),
        }
    }
}

impl BrokerError {
    /// Returns true if the client should retry against another broker or
    /// after a delay.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeaderForPartition { .. }
                | Self::BrokerOffline { .. }
                | Self::RequestTimedOut { .. }
                | Self::Replication(
                    ReplicationError::LeaderUnavailable { .. }
                        | ReplicationError::NotEnoughReplicas { .. }
                        | ReplicationError::NoEligibleLeader
                )
                | Self::Group(GroupError::RebalanceInProgress { .. })
        )
    }

    /// Returns true for an offset outside the retained range.
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        matches!(self, Self::Partition(PartitionError::OutOfRange { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{Offset, PartitionId};

    #[test]
    fn test_replication_errors_flatten_partition_errors() {
        let inner = PartitionError::OutOfRange {
            offset: Offset::new(500),
            log_start: Offset::new(100),
            log_end: Offset::new(200),
        };
        let err = BrokerError::from(ReplicationError::Partition(inner));
        assert!(err.is_out_of_range());
        assert!(!err.is_retriable());

        let err = BrokerError::from(ReplicationError::NoEligibleLeader);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_not_leader_display() {
        let err = BrokerError::NotLeaderForPartition {
            topic_partition: TopicPartition::new("orders", PartitionId::new(1)),
            leader_hint: Some(NodeId::new(2)),
        };
        assert!(err.to_string().contains("orders-1"));
        assert!(err.is_retriable());
    }
}
