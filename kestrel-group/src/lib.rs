//! Consumer group coordination for Kestrel.
//!
//! This crate divides partitions among the members of consumer groups and
//! keeps each group's committed offsets.
//!
//! # Overview
//!
//! - **Membership**: members join with a topic subscription, sync to receive
//!   their partitions and heartbeat to stay in the group. A member silent for
//!   longer than the session timeout is evicted.
//! - **Assignment**: round-robin over sorted member ids and sorted
//!   partitions. The same members and partitions always yield the same
//!   assignment.
//! - **Committed offsets**: monotonic unless a reset is requested, and
//!   persisted through an [`OffsetStore`] before they become visible.
//!
//! # Rebalance States
//!
//! `Empty` → `PreparingRebalance` → `AwaitingSync` → `Stable`, back to
//! `PreparingRebalance` on any membership or partition change.
//!
//! # Example
//!
//! ```ignore
//! use kestrel_group::{CommitMode, GroupConfig, GroupCoordinator, GroupId, MemoryOffsetStore};
//!
//! let coordinator = GroupCoordinator::new(MemoryOffsetStore::new(), GroupConfig::default())?;
//! coordinator.set_topic_partitions("orders", 3).await;
//!
//! let group = GroupId::from("billing");
//! let joined = coordinator.join(&group, &"consumer-a".into(), &["orders"], now).await?;
//! let partitions = coordinator.sync(&group, &"consumer-a".into(), joined.generation, now).await?;
//!
//! coordinator.commit_offset(&group, &partitions[0], Offset::new(10), CommitMode::Monotonic).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod assignor;
mod coordinator;
mod error;
mod group;
mod store;
mod types;

pub use assignor::{assign_round_robin, subscribed_partitions};
pub use coordinator::GroupCoordinator;
pub use error::{GroupError, GroupResult};
pub use group::{validate_name, Group, MAX_NAME_BYTES};
pub use store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use types::{
    Assignment, CommitMode, CommittedOffset, GroupConfig, GroupDescription, GroupId, GroupState,
    JoinResult, MemberId,
};
