//! Round-robin partition assignment.
//!
//! Members and partitions are both sorted before assignment, so the result
//! depends only on the member set, their subscriptions and the partition set.
//! Repeating a rebalance with unchanged inputs yields the same assignment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kestrel_core::{PartitionId, TopicPartition};

use crate::types::{Assignment, MemberId};

/// Expands a topic table into the sorted partitions of the given topics.
///
/// Topics missing from the table contribute no partitions.
#[must_use]
pub fn subscribed_partitions<'a>(
    topics: &BTreeMap<Arc<str>, u32>,
    subscribed: impl IntoIterator<Item = &'a Arc<str>>,
) -> Vec<TopicPartition> {
    let wanted: BTreeSet<&Arc<str>> = subscribed.into_iter().collect();
    let mut partitions = Vec::new();
    for topic in wanted {
        if let Some(&count) = topics.get(topic) {
            partitions.extend(
                (0..u64::from(count)).map(|p| TopicPartition::new(topic.clone(), PartitionId::new(p))),
            );
        }
    }
    partitions
}

/// Assigns partitions to members round-robin.
///
/// Walks the sorted partitions and hands each one to the next member (in
/// member-id order, wrapping around) that subscribes to its topic. Every
/// member appears in the result, possibly with no partitions.
#[must_use]
pub fn assign_round_robin(
    members: &BTreeMap<MemberId, BTreeSet<Arc<str>>>,
    partitions: &[TopicPartition],
) -> Assignment {
    let mut assignment: Assignment = members.keys().map(|m| (m.clone(), Vec::new())).collect();
    let ordered: Vec<(&MemberId, &BTreeSet<Arc<str>>)> = members.iter().collect();
    if ordered.is_empty() {
        return assignment;
    }

    let mut sorted = partitions.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut cursor = 0;
    for tp in sorted {
        for step in 0..ordered.len() {
            let index = (cursor + step) % ordered.len();
            let (member, subscription) = ordered[index];
            if subscription.contains(&tp.topic) {
                if let Some(owned) = assignment.get_mut(member) {
                    owned.push(tp);
                }
                cursor = index + 1;
                break;
            }
        }
    }

    // Postcondition: each partition is owned at most once.
    debug_assert!({
        let owned: Vec<&TopicPartition> = assignment.values().flatten().collect();
        let unique: BTreeSet<&TopicPartition> = owned.iter().copied().collect();
        owned.len() == unique.len()
    });
    assignment
}
