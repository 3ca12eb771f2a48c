//! Consumer group data types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use kestrel_core::{Offset, TopicPartition};

use crate::error::{GroupError, GroupResult};

// -----------------------------------------------------------------------------
// Names
// -----------------------------------------------------------------------------

/// Macro to generate string-backed name wrappers.
///
/// Names are shared (`Arc<str>`) because every heartbeat, commit and
/// assignment carries them.
macro_rules! define_name {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Creates a name from a string.
            #[must_use]
            pub fn new(value: impl Into<Arc<str>>) -> Self {
                Self(value.into())
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", &*self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

define_name!(GroupId, "Name of a consumer group.");
define_name!(MemberId, "Name of a member within a consumer group.");

// -----------------------------------------------------------------------------
// Group State
// -----------------------------------------------------------------------------

/// Rebalance state of a consumer group.
///
/// ```text
/// Empty --join--> PreparingRebalance --> AwaitingSync --all synced--> Stable
///                        ^                                              |
///                        +------------ join / leave / evict ------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    /// No members. Committed offsets are kept.
    #[default]
    Empty,
    /// Membership changed; a new assignment is being computed.
    PreparingRebalance,
    /// A new generation was assigned; waiting for every member to sync.
    AwaitingSync,
    /// Every member holds the current generation's assignment.
    Stable,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::PreparingRebalance => "preparing-rebalance",
            Self::AwaitingSync => "awaiting-sync",
            Self::Stable => "stable",
        };
        f.write_str(name)
    }
}

// -----------------------------------------------------------------------------
// Commit Mode
// -----------------------------------------------------------------------------

/// How an offset commit treats the currently stored offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Reject commits lower than the stored offset.
    #[default]
    Monotonic,
    /// Overwrite the stored offset, moving it backwards if needed.
    Reset,
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

/// Configuration for the group coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    /// A member that has not heartbeated for this long is evicted.
    pub session_timeout_ms: u64,
    /// Maximum members per group.
    pub max_members: u32,
}

impl GroupConfig {
    /// Creates a config with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            session_timeout_ms: 10_000,
            max_members: 1000,
        }
    }

    /// Sets the session timeout.
    #[must_use]
    pub const fn with_session_timeout_ms(mut self, ms: u64) -> Self {
        self.session_timeout_ms = ms;
        self
    }

    /// Sets the member limit.
    #[must_use]
    pub const fn with_max_members(mut self, max: u32) -> Self {
        self.max_members = max;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a setting is zero.
    pub fn validate(&self) -> GroupResult<()> {
        if self.session_timeout_ms == 0 {
            return Err(GroupError::InvalidConfig {
                message: "session_timeout_ms must be positive".to_string(),
            });
        }
        if self.max_members == 0 {
            return Err(GroupError::InvalidConfig {
                message: "max_members must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Results
// -----------------------------------------------------------------------------

/// Partitions assigned to each member.
pub type Assignment = BTreeMap<MemberId, Vec<TopicPartition>>;

/// Returned by a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult {
    /// Generation the member joined.
    pub generation: u32,
    /// Group leader (lowest member id).
    pub leader: MemberId,
    /// All members of the generation, sorted.
    pub members: Vec<MemberId>,
    /// True if the join started a new generation.
    pub rebalanced: bool,
}

/// A committed offset as held by an offset store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    /// The committing group.
    pub group: GroupId,
    /// The partition.
    pub topic_partition: TopicPartition,
    /// Next offset the group will read.
    pub offset: Offset,
}

/// Point-in-time description of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescription {
    /// Group name.
    pub group: GroupId,
    /// Rebalance state.
    pub state: GroupState,
    /// Current generation.
    pub generation: u32,
    /// Members and their subscribed topics.
    pub members: BTreeMap<MemberId, BTreeSet<Arc<str>>>,
    /// Current assignment.
    pub assignment: Assignment,
}
