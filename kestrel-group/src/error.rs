//! Consumer group error types.

use kestrel_core::{Offset, TopicPartition};
use thiserror::Error;

use crate::types::{GroupId, MemberId};

/// Result type for group operations.
pub type GroupResult<T> = Result<T, GroupError>;

/// Errors that can occur during group coordination and offset commits.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// Group does not exist.
    #[error("unknown group {group}")]
    UnknownGroup {
        /// The group that was named.
        group: GroupId,
    },

    /// Member is not part of the group.
    #[error("unknown member {member} in group {group}")]
    UnknownMember {
        /// The group.
        group: GroupId,
        /// The member that was named.
        member: MemberId,
    },

    /// Request carried a generation other than the current one.
    #[error("illegal generation {requested} for group {group} (current {current})")]
    IllegalGeneration {
        /// The group.
        group: GroupId,
        /// Current generation.
        current: u32,
        /// Generation in the request.
        requested: u32,
    },

    /// The group is rebalancing; the member must sync first.
    #[error("group {group} is rebalancing")]
    RebalanceInProgress {
        /// The group.
        group: GroupId,
    },

    /// The group still has members and cannot be deleted.
    #[error("group {group} still has {members} members")]
    NonEmptyGroup {
        /// The group.
        group: GroupId,
        /// Current member count.
        members: usize,
    },

    /// Commit would move the committed offset backwards.
    #[error("stale commit for {topic_partition}: {requested} < committed {committed}")]
    StaleCommit {
        /// The partition.
        topic_partition: TopicPartition,
        /// Currently stored offset.
        committed: Offset,
        /// Rejected offset.
        requested: Offset,
    },

    /// Group is full.
    #[error("group {group} has reached {max} members")]
    TooManyMembers {
        /// The group.
        group: GroupId,
        /// Member limit.
        max: u32,
    },

    /// Group or member name is empty or too long.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Offset snapshot failed its integrity check.
    #[error("corrupt offset store: {reason}")]
    Corrupt {
        /// What was wrong.
        reason: String,
    },

    /// I/O error in the offset store.
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

impl GroupError {
    /// Wraps an I/O error with the operation that raised it.
    #[must_use]
    pub fn io(operation: &'static str, err: &std::io::Error) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }
}
