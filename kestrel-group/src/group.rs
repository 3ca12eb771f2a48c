//! Membership and rebalance state machine for a single consumer group.
//!
//! `Group` is synchronous and owns no I/O. The coordinator serializes access
//! to each group and persists commits before applying them here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kestrel_core::{Offset, Timestamp, TopicPartition};
use tracing::{debug, info, warn};

use crate::assignor::{assign_round_robin, subscribed_partitions};
use crate::error::{GroupError, GroupResult};
use crate::types::{
    Assignment, CommitMode, GroupDescription, GroupId, GroupState, JoinResult, MemberId,
};

/// Maximum length of a group or member name in bytes.
pub const MAX_NAME_BYTES: usize = 255;

/// Validates a group or member name.
///
/// # Errors
/// Returns `InvalidName` if the name is empty or longer than
/// [`MAX_NAME_BYTES`].
pub fn validate_name(name: &str) -> GroupResult<()> {
    if name.is_empty() {
        return Err(GroupError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(GroupError::InvalidName {
            name: name.to_string(),
            reason: "name exceeds 255 bytes",
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Member {
    subscription: BTreeSet<Arc<str>>,
    last_heartbeat: Timestamp,
    synced: bool,
}

/// A consumer group: members, the current generation's assignment and the
/// group's committed offsets.
#[derive(Debug, Clone)]
pub struct Group {
    id: GroupId,
    state: GroupState,
    generation: u32,
    members: BTreeMap<MemberId, Member>,
    assignment: Assignment,
    committed: BTreeMap<TopicPartition, Offset>,
}

impl Group {
    /// Creates an empty group at generation 0.
    #[must_use]
    pub const fn new(id: GroupId) -> Self {
        Self {
            id,
            state: GroupState::Empty,
            generation: 0,
            members: BTreeMap::new(),
            assignment: BTreeMap::new(),
            committed: BTreeMap::new(),
        }
    }

    /// Returns the group id.
    #[must_use]
    pub const fn id(&self) -> &GroupId {
        &self.id
    }

    /// Returns the rebalance state.
    #[must_use]
    pub const fn state(&self) -> GroupState {
        self.state
    }

    /// Returns the current generation.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Returns the current assignment.
    #[must_use]
    pub const fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// Returns true if any member subscribes to `topic`.
    #[must_use]
    pub fn subscribes_to(&self, topic: &str) -> bool {
        self.members
            .values()
            .any(|m| m.subscription.iter().any(|t| &**t == topic))
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Adds a member or refreshes an existing one.
    ///
    /// A new member, or an existing member whose subscription changed,
    /// starts a new generation. A repeated join with the same subscription
    /// only refreshes the heartbeat.
    ///
    /// # Errors
    /// Returns `TooManyMembers` if the group is full.
    pub fn join(
        &mut self,
        member: MemberId,
        subscription: BTreeSet<Arc<str>>,
        topics: &BTreeMap<Arc<str>, u32>,
        max_members: u32,
        now: Timestamp,
    ) -> GroupResult<JoinResult> {
        let rebalanced = match self.members.get_mut(&member) {
            Some(existing) if existing.subscription == subscription => {
                existing.last_heartbeat = now;
                false
            }
            Some(existing) => {
                existing.subscription = subscription;
                existing.last_heartbeat = now;
                true
            }
            None => {
                if self.members.len() >= max_members as usize {
                    return Err(GroupError::TooManyMembers {
                        group: self.id.clone(),
                        max: max_members,
                    });
                }
                self.members.insert(
                    member.clone(),
                    Member {
                        subscription,
                        last_heartbeat: now,
                        synced: false,
                    },
                );
                info!(group = %self.id, member = %member, "Member joined");
                true
            }
        };

        if rebalanced {
            self.rebalance(topics);
        }

        let members: Vec<MemberId> = self.members.keys().cloned().collect();
        Ok(JoinResult {
            generation: self.generation,
            leader: members.first().cloned().unwrap_or(member),
            members,
            rebalanced,
        })
    }

    /// Completes a member's part of the rebalance and returns its partitions.
    ///
    /// The group becomes `Stable` once every member has synced the current
    /// generation.
    ///
    /// # Errors
    /// Returns `UnknownMember` or `IllegalGeneration`.
    pub fn sync(
        &mut self,
        member: &MemberId,
        generation: u32,
        now: Timestamp,
    ) -> GroupResult<Vec<TopicPartition>> {
        self.check_generation(member, generation)?;
        if let Some(entry) = self.members.get_mut(member) {
            entry.synced = true;
            entry.last_heartbeat = now;
        }

        if self.state == GroupState::AwaitingSync && self.members.values().all(|m| m.synced) {
            self.state = GroupState::Stable;
            info!(
                group = %self.id,
                generation = self.generation,
                members = self.members.len(),
                "Rebalance completed"
            );
        }

        Ok(self.assignment.get(member).cloned().unwrap_or_default())
    }

    /// Records a heartbeat.
    ///
    /// # Errors
    /// Returns `UnknownMember`, `RebalanceInProgress` if the member has not
    /// synced the current generation, or `IllegalGeneration`. The heartbeat
    /// of a known member is recorded even when an error is returned.
    pub fn heartbeat(&mut self, member: &MemberId, generation: u32, now: Timestamp) -> GroupResult<()> {
        let Some(entry) = self.members.get_mut(member) else {
            return Err(GroupError::UnknownMember {
                group: self.id.clone(),
                member: member.clone(),
            });
        };
        entry.last_heartbeat = now;
        if !entry.synced {
            return Err(GroupError::RebalanceInProgress {
                group: self.id.clone(),
            });
        }
        if generation != self.generation {
            return Err(GroupError::IllegalGeneration {
                group: self.id.clone(),
                current: self.generation,
                requested: generation,
            });
        }
        Ok(())
    }

    /// Removes a member and rebalances the rest.
    ///
    /// # Errors
    /// Returns `UnknownMember` if the member is not in the group.
    pub fn leave(&mut self, member: &MemberId, topics: &BTreeMap<Arc<str>, u32>) -> GroupResult<()> {
        if self.members.remove(member).is_none() {
            return Err(GroupError::UnknownMember {
                group: self.id.clone(),
                member: member.clone(),
            });
        }
        info!(group = %self.id, member = %member, "Member left");
        self.rebalance(topics);
        Ok(())
    }

    /// Evicts members whose last heartbeat is older than the session timeout.
    ///
    /// Returns the evicted members; a non-empty result starts a new
    /// generation.
    pub fn evict_expired(
        &mut self,
        now: Timestamp,
        session_timeout_ms: u64,
        topics: &BTreeMap<Arc<str>, u32>,
    ) -> Vec<MemberId> {
        let expired: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, m)| now.millis_since(m.last_heartbeat) > session_timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }

        for member in &expired {
            self.members.remove(member);
            warn!(
                group = %self.id,
                member = %member,
                session_timeout_ms,
                "Evicted member after session timeout"
            );
        }
        self.rebalance(topics);
        expired
    }

    /// Starts a new generation and recomputes the assignment.
    ///
    /// A group without members becomes `Empty`; otherwise it waits in
    /// `AwaitingSync` until every member syncs.
    pub fn rebalance(&mut self, topics: &BTreeMap<Arc<str>, u32>) {
        self.state = GroupState::PreparingRebalance;
        self.generation = self.generation.wrapping_add(1);

        let subscriptions: BTreeMap<MemberId, BTreeSet<Arc<str>>> = self
            .members
            .iter()
            .map(|(id, m)| (id.clone(), m.subscription.clone()))
            .collect();
        let partitions = subscribed_partitions(topics, subscriptions.values().flatten());
        self.assignment = assign_round_robin(&subscriptions, &partitions);

        for member in self.members.values_mut() {
            member.synced = false;
        }
        self.state = if self.members.is_empty() {
            GroupState::Empty
        } else {
            GroupState::AwaitingSync
        };

        debug!(
            group = %self.id,
            generation = self.generation,
            members = self.members.len(),
            partitions = partitions.len(),
            state = %self.state,
            "Rebalanced group"
        );
    }

    fn check_generation(&self, member: &MemberId, generation: u32) -> GroupResult<()> {
        if !self.members.contains_key(member) {
            return Err(GroupError::UnknownMember {
                group: self.id.clone(),
                member: member.clone(),
            });
        }
        if generation != self.generation {
            return Err(GroupError::IllegalGeneration {
                group: self.id.clone(),
                current: self.generation,
                requested: generation,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Committed Offsets
    // -------------------------------------------------------------------------

    /// Returns the committed offset for a partition.
    #[must_use]
    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<Offset> {
        self.committed.get(topic_partition).copied()
    }

    /// Checks whether a commit would be accepted, without applying it.
    ///
    /// # Errors
    /// Returns `StaleCommit` if `mode` is `Monotonic` and `offset` is below
    /// the committed offset.
    pub fn check_commit(
        &self,
        topic_partition: &TopicPartition,
        offset: Offset,
        mode: CommitMode,
    ) -> GroupResult<()> {
        if mode == CommitMode::Reset {
            return Ok(());
        }
        match self.committed(topic_partition) {
            Some(committed) if offset < committed => Err(GroupError::StaleCommit {
                topic_partition: topic_partition.clone(),
                committed,
                requested: offset,
            }),
            _ => Ok(()),
        }
    }

    /// Applies a commit that has already been checked and persisted.
    pub fn apply_commit(&mut self, topic_partition: TopicPartition, offset: Offset) {
        self.committed.insert(topic_partition, offset);
    }

    /// Drops committed offsets for a topic.
    pub fn forget_topic(&mut self, topic: &str) {
        self.committed.retain(|tp, _| &*tp.topic != topic);
    }

    /// Returns all committed offsets.
    #[must_use]
    pub const fn committed_offsets(&self) -> &BTreeMap<TopicPartition, Offset> {
        &self.committed
    }

    /// Returns a point-in-time description.
    #[must_use]
    pub fn describe(&self) -> GroupDescription {
        GroupDescription {
            group: self.id.clone(),
            state: self.state,
            generation: self.generation,
            members: self
                .members
                .iter()
                .map(|(id, m)| (id.clone(), m.subscription.clone()))
                .collect(),
            assignment: self.assignment.clone(),
        }
    }
}
