//! Consumer group rebalances and offset commits through the coordinator.

use kestrel_core::{Offset, PartitionId, Timestamp, TopicPartition};
use kestrel_group::{
    CommitMode, FileOffsetStore, GroupConfig, GroupCoordinator, GroupError, GroupId, GroupState,
    MemberId, MemoryOffsetStore,
};

fn at(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn tp(partition: u64) -> TopicPartition {
    TopicPartition::new("orders", PartitionId::new(partition))
}

async fn join_and_sync(
    coordinator: &GroupCoordinator<MemoryOffsetStore>,
    group: &GroupId,
    members: &[&str],
    now: Timestamp,
) -> u32 {
    let mut generation = 0;
    for member in members {
        generation = coordinator
            .join(group, &MemberId::from(*member), &["orders"], now)
            .await
            .unwrap()
            .generation;
    }
    for member in members {
        coordinator
            .sync(group, &MemberId::from(*member), generation, now)
            .await
            .unwrap();
    }
    generation
}

fn counts(assignment: &kestrel_group::Assignment) -> Vec<usize> {
    assignment.values().map(Vec::len).collect()
}

#[tokio::test]
async fn test_billing_two_then_three_members() {
    let coordinator = GroupCoordinator::new(MemoryOffsetStore::new(), GroupConfig::default()).unwrap();
    coordinator.set_topic_partitions("orders", 3).await;
    let billing = GroupId::from("billing");

    join_and_sync(&coordinator, &billing, &["member-a", "member-b"], at(0)).await;
    let assignment = coordinator.assignment(&billing).await.unwrap();
    assert_eq!(counts(&assignment), vec![2, 1]);
    assert_eq!(assignment[&MemberId::from("member-a")], vec![tp(0), tp(2)]);
    assert_eq!(coordinator.describe(&billing).await.unwrap().state, GroupState::Stable);

    // Repeating the rebalance with the same members gives the same result.
    let first = assignment.clone();
    coordinator.leave(&billing, &MemberId::from("member-b")).await.unwrap();
    join_and_sync(&coordinator, &billing, &["member-a", "member-b"], at(1)).await;
    assert_eq!(coordinator.assignment(&billing).await.unwrap(), first);

    let joined = coordinator
        .join(&billing, &MemberId::from("member-c"), &["orders"], at(2))
        .await
        .unwrap();
    assert!(joined.rebalanced);
    assert_eq!(joined.members.len(), 3);
    assert_eq!(joined.leader, MemberId::from("member-a"));

    let err = coordinator
        .heartbeat(&billing, &MemberId::from("member-a"), joined.generation, at(2))
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::RebalanceInProgress { .. }));

    for member in ["member-a", "member-b", "member-c"] {
        let owned = coordinator
            .sync(&billing, &MemberId::from(member), joined.generation, at(3))
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
    }
    let description = coordinator.describe(&billing).await.unwrap();
    assert_eq!(description.state, GroupState::Stable);
    assert_eq!(counts(&description.assignment), vec![1, 1, 1]);
}

#[tokio::test]
async fn test_silent_member_evicted_and_partitions_reassigned() {
    let config = GroupConfig::default().with_session_timeout_ms(1_000);
    let coordinator = GroupCoordinator::new(MemoryOffsetStore::new(), config).unwrap();
    coordinator.set_topic_partitions("orders", 3).await;
    let billing = GroupId::from("billing");

    let generation = join_and_sync(&coordinator, &billing, &["member-a", "member-b"], at(0)).await;
    coordinator
        .heartbeat(&billing, &MemberId::from("member-a"), generation, at(800))
        .await
        .unwrap();

    assert!(coordinator.evict_expired(at(1_000)).await.is_empty());
    let evicted = coordinator.evict_expired(at(1_500)).await;
    assert_eq!(evicted, vec![(billing.clone(), MemberId::from("member-b"))]);

    let assignment = coordinator.assignment(&billing).await.unwrap();
    assert_eq!(assignment.len(), 1);
    assert_eq!(assignment[&MemberId::from("member-a")].len(), 3);

    let err = coordinator
        .sync(&billing, &MemberId::from("member-b"), generation + 1, at(1_500))
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::UnknownMember { .. }));
}

#[tokio::test]
async fn test_stale_commit_keeps_previous_offset() {
    let coordinator = GroupCoordinator::new(MemoryOffsetStore::new(), GroupConfig::default()).unwrap();
    let billing = GroupId::from("billing");

    coordinator
        .commit_offset(&billing, &tp(0), Offset::new(10), CommitMode::Monotonic)
        .await
        .unwrap();
    let err = coordinator
        .commit_offset(&billing, &tp(0), Offset::new(5), CommitMode::Monotonic)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GroupError::StaleCommit {
            topic_partition: tp(0),
            committed: Offset::new(10),
            requested: Offset::new(5),
        }
    );
    assert_eq!(coordinator.fetch_committed(&billing, &tp(0)).await, Some(Offset::new(10)));
}

#[tokio::test]
async fn test_committed_offsets_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("group-offsets.snap");
    let billing = GroupId::from("billing");

    let store = FileOffsetStore::open(&path).await.unwrap();
    let coordinator = GroupCoordinator::new(store, GroupConfig::default()).unwrap();
    coordinator
        .commit_offset(&billing, &tp(1), Offset::new(64), CommitMode::Monotonic)
        .await
        .unwrap();
    drop(coordinator);

    let store = FileOffsetStore::open(&path).await.unwrap();
    let coordinator = GroupCoordinator::new(store, GroupConfig::default()).unwrap();
    assert_eq!(coordinator.recover().await.unwrap(), 1);
    assert_eq!(coordinator.fetch_committed(&billing, &tp(1)).await, Some(Offset::new(64)));

    let err = coordinator
        .commit_offset(&billing, &tp(1), Offset::new(63), CommitMode::Monotonic)
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::StaleCommit { .. }));
}
