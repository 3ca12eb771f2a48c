//! Partition and replication error types.

use kestrel_core::{NodeId, Offset};
use thiserror::Error;

/// Result type for partition log operations.
pub type PartitionResult<T> = Result<T, PartitionError>;

/// Result type for replication group operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Partition log and segment errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// Requested offset is outside the retained window.
    #[error("offset {offset} out of range [{log_start}, {log_end})")]
    OutOfRange {
        /// Requested offset.
        offset: Offset,
        /// First retained offset.
        log_start: Offset,
        /// Next offset to be assigned.
        log_end: Offset,
    },

    /// Append attempted on a closed segment.
    #[error("segment {base_offset} is closed")]
    SegmentClosed {
        /// Base offset of the closed segment.
        base_offset: Offset,
    },

    /// Stored data failed its integrity check.
    #[error("corrupt segment {base_offset} at byte {position}: {reason}")]
    Corrupt {
        /// Base offset of the affected segment.
        base_offset: Offset,
        /// Byte position of the bad frame within the segment.
        position: u64,
        /// What was wrong.
        reason: String,
    },

    /// The leader checkpoint failed its integrity check.
    #[error("corrupt leader checkpoint: {reason}")]
    CorruptCheckpoint {
        /// What was wrong.
        reason: String,
    },

    /// A replicated record did not carry the next expected offset.
    #[error("non-contiguous append: expected offset {expected}, got {actual}")]
    NonContiguousAppend {
        /// The log end offset.
        expected: Offset,
        /// The offset carried by the record.
        actual: Offset,
    },

    /// Truncation below the high-water mark was requested.
    #[error("cannot truncate to {offset}: below high-water mark {high_water_mark}")]
    InvalidTruncation {
        /// Requested truncation point.
        offset: Offset,
        /// Current high-water mark.
        high_water_mark: Offset,
    },

    /// I/O error on a segment file.
    #[error("I/O error during {operation}: {message}")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Configuration error description.
        message: String,
    },
}

impl PartitionError {
    /// Wraps an I/O error with the operation that raised it.
    #[must_use]
    pub fn io(operation: &'static str, err: &std::io::Error) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }
}

/// Replication group errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The partition currently has no online leader.
    #[error("no leader available (last known: {last_leader:?})")]
    LeaderUnavailable {
        /// The leader before it went offline, if any.
        last_leader: Option<NodeId>,
    },

    /// The broker is not part of the replica set.
    #[error("{broker} is not a replica of this partition")]
    UnknownReplica {
        /// The broker that was named.
        broker: NodeId,
    },

    /// The replica's broker is offline.
    #[error("replica on {broker} is offline")]
    ReplicaOffline {
        /// The offline broker.
        broker: NodeId,
    },

    /// Too few in-sync replicas to accept an all-replica write.
    #[error("not enough in-sync replicas: {in_sync} < {required}")]
    NotEnoughReplicas {
        /// Configured minimum.
        required: u32,
        /// Current in-sync count.
        in_sync: u32,
    },

    /// No in-sync replica is online to take over leadership.
    #[error("no eligible leader among in-sync replicas")]
    NoEligibleLeader,

    /// Every replica is offline; the partition cannot recover on its own.
    #[error("all replicas are offline")]
    ReplicaSetLost,

    /// Invalid replica set or configuration.
    #[error("invalid replica set: {reason}")]
    InvalidReplicaSet {
        /// What was wrong.
        reason: String,
    },

    /// Error from a replica's partition log.
    #[error(transparent)]
    Partition(#[from] PartitionError),
}
