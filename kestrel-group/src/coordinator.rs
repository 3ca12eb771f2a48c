//! Group coordinator: membership, assignment and committed offsets for every
//! consumer group.
//!
//! # Design
//!
//! Each group sits behind its own mutex; the group table and the topic table
//! are only locked long enough to look up or insert entries. The coordinator
//! does no background work. Callers drive session expiry through
//! [`GroupCoordinator::evict_expired`].
//!
//! Commits hold the group's mutex across the store write, so commits to one
//! group are applied in order, and the in-memory offset changes only after
//! the store accepted it.
//!
//! Lock order is group table, then group. Only deletion holds both.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use kestrel_core::{Offset, Timestamp, TopicPartition};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{GroupError, GroupResult};
use crate::group::{validate_name, Group};
use crate::store::OffsetStore;
use crate::types::{
    Assignment, CommitMode, GroupConfig, GroupDescription, GroupId, JoinResult, MemberId,
};

/// Coordinates every consumer group on a broker.
pub struct GroupCoordinator<S: OffsetStore> {
    store: Arc<S>,
    config: GroupConfig,
    topics: RwLock<BTreeMap<Arc<str>, u32>>,
    groups: RwLock<HashMap<GroupId, Arc<Mutex<Group>>>>,
}

impl<S: OffsetStore> GroupCoordinator<S> {
    /// Creates a coordinator over `store`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration is invalid.
    pub fn new(store: S, config: GroupConfig) -> GroupResult<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(store),
            config,
            topics: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the offset store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Loads committed offsets from the store into empty groups.
    ///
    /// Returns the number of offsets loaded.
    ///
    /// # Errors
    /// Returns the store's error if loading fails.
    pub async fn recover(&self) -> GroupResult<usize> {
        let committed = self.store.load().await?;
        let count = committed.len();
        for entry in committed {
            let group = self.group_or_create(&entry.group).await;
            group.lock().await.apply_commit(entry.topic_partition, entry.offset);
        }
        info!(offsets = count, "Recovered committed offsets");
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Topics
    // -------------------------------------------------------------------------

    /// Registers a topic or changes its partition count.
    ///
    /// Groups subscribed to the topic rebalance if the count changed.
    pub async fn set_topic_partitions(&self, topic: &str, partitions: u32) {
        let topic: Arc<str> = Arc::from(topic);
        let mut topics = self.topics.write().await;
        if topics.insert(topic.clone(), partitions) == Some(partitions) {
            return;
        }
        let snapshot = topics.clone();
        drop(topics);

        self.rebalance_subscribers(&topic, &snapshot).await;
    }

    /// Unregisters a topic and drops every group's offsets for it.
    ///
    /// # Errors
    /// Returns the store's error if removing the offsets fails; the topic is
    /// unregistered either way.
    pub async fn remove_topic(&self, topic: &str) -> GroupResult<()> {
        let mut topics = self.topics.write().await;
        let removed = topics.remove(topic).is_some();
        let snapshot = topics.clone();
        drop(topics);

        if removed {
            self.rebalance_subscribers(topic, &snapshot).await;
        }
        for group in self.all_groups().await {
            group.lock().await.forget_topic(topic);
        }
        self.store.remove_topic(topic).await
    }

    async fn rebalance_subscribers(&self, topic: &str, topics: &BTreeMap<Arc<str>, u32>) {
        for group in self.all_groups().await {
            let mut group = group.lock().await;
            if group.subscribes_to(topic) {
                debug!(group = %group.id(), topic, "Topic changed, rebalancing");
                group.rebalance(topics);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Adds `member` to `group`, creating the group if needed.
    ///
    /// # Errors
    /// Returns `InvalidName` or `TooManyMembers`.
    pub async fn join(
        &self,
        group: &GroupId,
        member: &MemberId,
        topics: &[&str],
        now: Timestamp,
    ) -> GroupResult<JoinResult> {
        validate_name(group.as_str())?;
        validate_name(member.as_str())?;
        let subscription: BTreeSet<Arc<str>> = topics.iter().map(|t| Arc::from(*t)).collect();

        let handle = self.group_or_create(group).await;
        let table = self.topics.read().await;
        let mut group = handle.lock().await;
        group.join(member.clone(), subscription, &table, self.config.max_members, now)
    }

    /// Completes the member's part of a rebalance.
    ///
    /// # Errors
    /// Returns `UnknownGroup`, `UnknownMember` or `IllegalGeneration`.
    pub async fn sync(
        &self,
        group: &GroupId,
        member: &MemberId,
        generation: u32,
        now: Timestamp,
    ) -> GroupResult<Vec<TopicPartition>> {
        let handle = self.group(group).await?;
        let mut group = handle.lock().await;
        group.sync(member, generation, now)
    }

    /// Records a heartbeat.
    ///
    /// # Errors
    /// Returns `UnknownGroup`, `UnknownMember`, `RebalanceInProgress` or
    /// `IllegalGeneration`.
    pub async fn heartbeat(
        &self,
        group: &GroupId,
        member: &MemberId,
        generation: u32,
        now: Timestamp,
    ) -> GroupResult<()> {
        let handle = self.group(group).await?;
        let mut group = handle.lock().await;
        group.heartbeat(member, generation, now)
    }

    /// Removes a member from its group.
    ///
    /// # Errors
    /// Returns `UnknownGroup` or `UnknownMember`.
    pub async fn leave(&self, group: &GroupId, member: &MemberId) -> GroupResult<()> {
        let handle = self.group(group).await?;
        let table = self.topics.read().await;
        let mut group = handle.lock().await;
        group.leave(member, &table)
    }

    /// Evicts members whose session expired, across all groups.
    pub async fn evict_expired(&self, now: Timestamp) -> Vec<(GroupId, MemberId)> {
        let table = self.topics.read().await.clone();
        let mut evicted = Vec::new();
        for handle in self.all_groups().await {
            let mut group = handle.lock().await;
            let id = group.id().clone();
            evicted.extend(
                group
                    .evict_expired(now, self.config.session_timeout_ms, &table)
                    .into_iter()
                    .map(|member| (id.clone(), member)),
            );
        }
        evicted
    }

    /// Returns the current assignment of a group.
    ///
    /// # Errors
    /// Returns `UnknownGroup`.
    pub async fn assignment(&self, group: &GroupId) -> GroupResult<Assignment> {
        let handle = self.group(group).await?;
        let group = handle.lock().await;
        Ok(group.assignment().clone())
    }

    /// Describes a group.
    ///
    /// # Errors
    /// Returns `UnknownGroup`.
    pub async fn describe(&self, group: &GroupId) -> GroupResult<GroupDescription> {
        let handle = self.group(group).await?;
        let group = handle.lock().await;
        Ok(group.describe())
    }

    /// Deletes an empty group together with its committed offsets.
    ///
    /// # Errors
    /// Returns `UnknownGroup`, `NonEmptyGroup` while members remain, or the
    /// store's error, in which case the group is kept.
    pub async fn delete_group(&self, group: &GroupId) -> GroupResult<()> {
        let mut groups = self.groups.write().await;
        let handle = groups
            .get(group)
            .cloned()
            .ok_or_else(|| GroupError::UnknownGroup {
                group: group.clone(),
            })?;
        let state = handle.lock().await;
        let members = state.member_count();
        if members > 0 {
            return Err(GroupError::NonEmptyGroup {
                group: group.clone(),
                members,
            });
        }

        self.store.remove_group(group).await?;
        groups.remove(group);
        info!(
            group = %group,
            offsets = state.committed_offsets().len(),
            "Deleted consumer group"
        );
        Ok(())
    }

    /// Lists all known groups, sorted.
    pub async fn list_groups(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // -------------------------------------------------------------------------
    // Offsets
    // -------------------------------------------------------------------------

    /// Commits the next offset `group` will read from a partition.
    ///
    /// # Errors
    /// Returns `InvalidName`, `StaleCommit` if `mode` is `Monotonic` and the
    /// offset is below the committed one, or the store's error.
    pub async fn commit_offset(
        &self,
        group: &GroupId,
        topic_partition: &TopicPartition,
        offset: Offset,
        mode: CommitMode,
    ) -> GroupResult<()> {
        validate_name(group.as_str())?;
        let handle = self.group_or_create(group).await;
        let mut state = handle.lock().await;

        state.check_commit(topic_partition, offset, mode)?;
        self.store.save(group, topic_partition, offset).await?;
        state.apply_commit(topic_partition.clone(), offset);

        debug!(
            group = %group,
            topic_partition = %topic_partition,
            offset = offset.get(),
            ?mode,
            "Committed offset"
        );
        Ok(())
    }

    /// Returns the committed offset, or `None` if the group never committed
    /// for the partition.
    pub async fn fetch_committed(
        &self,
        group: &GroupId,
        topic_partition: &TopicPartition,
    ) -> Option<Offset> {
        let handle = self.group(group).await.ok()?;
        let state = handle.lock().await;
        state.committed(topic_partition)
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    async fn group(&self, group: &GroupId) -> GroupResult<Arc<Mutex<Group>>> {
        self.groups
            .read()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| GroupError::UnknownGroup {
                group: group.clone(),
            })
    }

    async fn group_or_create(&self, group: &GroupId) -> Arc<Mutex<Group>> {
        if let Some(handle) = self.groups.read().await.get(group) {
            return handle.clone();
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(group.clone())
            .or_insert_with(|| {
                info!(group = %group, "Created consumer group");
                Arc::new(Mutex::new(Group::new(group.clone())))
            })
            .clone()
    }

    async fn all_groups(&self) -> Vec<Arc<Mutex<Group>>> {
        self.groups.read().await.values().cloned().collect()
    }
}
