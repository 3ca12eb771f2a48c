//! Replica lifecycle.
//!
//! ```text
//!            caught up                  lag > window
//! Follower ------------> InSync <-------------------+
//!                          |  \                     |
//!              lag > window|   \ elected            |
//!                          v    v                   |
//!                    CatchingUp  Leader             |
//!                          |                        |
//!                          +---- caught up ---------+
//! ```
//!
//! Transitions are pure. The replication group decides when to apply them.

use kestrel_core::Timestamp;

/// Where a replica stands relative to the partition leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Newly assigned, not yet caught up.
    Follower,
    /// Was in sync, fell behind past the lag window.
    CatchingUp {
        /// When the replica was last caught up.
        behind_since: Timestamp,
    },
    /// Caught up with the leader within the lag window.
    InSync {
        /// Last time the replica reached the leader's log end.
        caught_up_at: Timestamp,
    },
    /// Serving reads and writes for the partition.
    Leader {
        /// Leader epoch this replica was elected in.
        epoch: u64,
    },
}

impl ReplicaState {
    /// Returns true for members of the in-sync replica set (leader included).
    #[must_use]
    pub const fn is_in_sync(&self) -> bool {
        matches!(self, Self::InSync { .. } | Self::Leader { .. })
    }

    /// Returns true for the leader.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::CatchingUp { .. } => "catching-up",
            Self::InSync { .. } => "in-sync",
            Self::Leader { .. } => "leader",
        }
    }

    /// State after a replication fetch. `caught_up` means the replica's log
    /// end reached the leader's.
    #[must_use]
    pub const fn on_fetch(self, caught_up: bool, now: Timestamp) -> Self {
        match self {
            Self::Leader { .. } => self,
            _ if caught_up => Self::InSync { caught_up_at: now },
            other => other,
        }
    }

    /// State after a lag check against a window of `max_lag_ms`.
    #[must_use]
    pub const fn on_lag_check(self, now: Timestamp, max_lag_ms: u64) -> Self {
        match self {
            Self::InSync { caught_up_at } if now.millis_since(caught_up_at) > max_lag_ms => {
                Self::CatchingUp {
                    behind_since: caught_up_at,
                }
            }
            other => other,
        }
    }

    /// State after the replica's broker went offline.
    #[must_use]
    pub const fn on_offline(self, now: Timestamp) -> Self {
        match self {
            Self::InSync { caught_up_at } => Self::CatchingUp {
                behind_since: caught_up_at,
            },
            Self::Leader { .. } => Self::CatchingUp { behind_since: now },
            other => other,
        }
    }
}
