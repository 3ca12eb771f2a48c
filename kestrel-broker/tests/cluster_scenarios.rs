//! End-to-end scenarios against an in-process cluster.

use std::collections::BTreeSet;
use std::sync::Arc;

use kestrel_broker::{BrokerError, Cluster, ClusterConfig, OffsetSpec};
use kestrel_core::{NodeId, Offset, PartitionId, Record, Timestamp, TopicPartition};
use kestrel_group::{CommitMode, GroupError, GroupId, MemberId};
use kestrel_partition::{AckMode, LogConfig, RetentionPolicy, SegmentConfig};
use tempfile::TempDir;

async fn leader_of(cluster: &Arc<Cluster>, topic: &str, partition: u64) -> NodeId {
    let description = cluster.describe_topic(topic).await.unwrap();
    description.partitions[partition as usize].leader.unwrap()
}

#[tokio::test]
async fn test_keyed_produce_all_acks_then_fetch_everything() {
    let cluster = Cluster::start(ClusterConfig::with_broker_count(3)).await.unwrap();
    cluster
        .create_topic("orders", 3, 3, RetentionPolicy::default())
        .await
        .unwrap();
    let topic = cluster.topic("orders").await.unwrap();

    for i in 0..100u32 {
        let key = i.to_string();
        let partition = topic.select_partition(Some(key.as_bytes()));
        let leader = leader_of(&cluster, "orders", partition.get()).await;
        let response = cluster
            .broker(leader)
            .await
            .unwrap()
            .produce("orders", None, Record::with_key(key, format!("order-{i}")), AckMode::All)
            .await
            .unwrap();
        assert_eq!(response.topic_partition.partition, partition);
        assert!(response.high_water_mark >= response.next_offset);
    }

    let mut total = 0;
    let mut seen = BTreeSet::new();
    for partition in 0..3u64 {
        let leader = cluster.broker(leader_of(&cluster, "orders", partition).await).await.unwrap();
        let fetched = leader
            .fetch("orders", PartitionId::new(partition), Offset::ZERO, u64::MAX)
            .await
            .unwrap();
        assert_eq!(fetched.next_offset, fetched.high_water_mark);
        for (i, record) in fetched.records.iter().enumerate() {
            assert_eq!(record.offset, Offset::new(i as u64));
            seen.insert(record.key.clone().unwrap());
        }
        total += fetched.records.len();

        let status = &cluster.describe_topic("orders").await.unwrap().partitions[partition as usize];
        assert_eq!(status.in_sync_replicas.len(), 3);
        assert_eq!(status.log_end_offset, status.high_water_mark);
    }
    assert_eq!(total, 100);
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn test_single_partition_reaches_one_hundred() {
    let cluster = Cluster::start(ClusterConfig::with_broker_count(3)).await.unwrap();
    cluster
        .create_topic("orders", 1, 3, RetentionPolicy::default())
        .await
        .unwrap();
    let leader = cluster.broker(NodeId::new(1)).await.unwrap();

    let mut last = None;
    for i in 0..100u32 {
        let record = Record::with_key(i.to_string(), "payload");
        last = Some(leader.produce("orders", None, record, AckMode::All).await.unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last.next_offset, Offset::new(100));
    assert_eq!(last.high_water_mark, Offset::new(100));

    let fetched = leader
        .fetch("orders", PartitionId::new(0), Offset::ZERO, u64::MAX)
        .await
        .unwrap();
    assert_eq!(fetched.records.len(), 100);
    assert_eq!(fetched.next_offset, Offset::new(100));
    assert_eq!(
        leader.list_offset("orders", PartitionId::new(0), OffsetSpec::Latest).await.unwrap(),
        Offset::new(100)
    );
}

#[tokio::test]
async fn test_leader_failure_elects_freshest_in_sync_follower() {
    let cluster = Cluster::open(ClusterConfig::with_broker_count(3)).await.unwrap();
    cluster
        .create_topic("orders", 1, 3, RetentionPolicy::default())
        .await
        .unwrap();
    let original = cluster.broker(NodeId::new(1)).await.unwrap();

    let batch: Vec<Record> = (0..48).map(|i| Record::new(format!("r{i}"))).collect();
    original
        .produce_batch("orders", Some(PartitionId::new(0)), batch, AckMode::Leader)
        .await
        .unwrap();
    cluster.run_replication_round(Timestamp::now()).await;

    let batch: Vec<Record> = (48..50).map(|i| Record::new(format!("r{i}"))).collect();
    original
        .produce_batch("orders", Some(PartitionId::new(0)), batch, AckMode::Leader)
        .await
        .unwrap();

    // Only broker 2 fetches the last two records.
    {
        let handle = cluster.topic("orders").await.unwrap().partition(PartitionId::new(0)).unwrap();
        let mut group = handle.write().await.unwrap();
        group.replicate(NodeId::new(2), Timestamp::now()).unwrap();
        assert_eq!(group.replica_log(NodeId::new(2)).unwrap().log_end_offset(), Offset::new(50));
        assert_eq!(group.replica_log(NodeId::new(3)).unwrap().log_end_offset(), Offset::new(48));
        assert_eq!(group.high_water_mark(), Offset::new(48));
    }

    let changes = cluster.set_broker_online(NodeId::new(1), false).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].1.leader, NodeId::new(2));
    assert_eq!(changes[0].1.previous, Some(NodeId::new(1)));

    let err = original
        .produce("orders", Some(PartitionId::new(0)), Record::new("late"), AckMode::Leader)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::BrokerOffline { .. }));

    let follower = cluster.broker(NodeId::new(3)).await.unwrap();
    let err = follower
        .fetch("orders", PartitionId::new(0), Offset::ZERO, u64::MAX)
        .await
        .unwrap_err();
    assert!(err.is_retriable());
    match err {
        BrokerError::NotLeaderForPartition { leader_hint, .. } => {
            assert_eq!(leader_hint, Some(NodeId::new(2)));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Broker 3 catches up from the new leader and nothing committed is lost.
    cluster.run_replication_round(Timestamp::now()).await;
    let leader = cluster.broker(NodeId::new(2)).await.unwrap();
    let fetched = leader
        .fetch("orders", PartitionId::new(0), Offset::ZERO, u64::MAX)
        .await
        .unwrap();
    assert_eq!(fetched.records.len(), 50);
    assert_eq!(fetched.high_water_mark, Offset::new(50));
}

#[tokio::test]
async fn test_size_retention_keeps_newest_records() {
    const MIB: u64 = 1024 * 1024;
    let log = LogConfig::default()
        .with_segment(SegmentConfig::default().with_max_size_bytes(128 * 1024));
    let cluster = Cluster::open(ClusterConfig::with_broker_count(1).with_log(log))
        .await
        .unwrap();
    cluster
        .create_topic("audit", 1, 1, RetentionPolicy::unlimited().with_max_bytes(MIB))
        .await
        .unwrap();
    let broker = cluster.broker(NodeId::new(1)).await.unwrap();

    let value = vec![7u8; 8 * 1024];
    for _ in 0..256 {
        broker
            .produce("audit", Some(PartitionId::new(0)), Record::new(value.clone()), AckMode::All)
            .await
            .unwrap();
    }

    let swept = cluster.run_retention(Timestamp::now()).await;
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].0, TopicPartition::new("audit", PartitionId::new(0)));

    let handle = cluster.topic("audit").await.unwrap().partition(PartitionId::new(0)).unwrap();
    let size = {
        let group = handle.read().await.unwrap();
        group.replica_log(NodeId::new(1)).unwrap().size_bytes()
    };
    assert!(size <= MIB, "log is {size} bytes");

    let earliest = broker
        .list_offset("audit", PartitionId::new(0), OffsetSpec::Earliest)
        .await
        .unwrap();
    assert!(earliest > Offset::ZERO);
    let newest = broker
        .fetch("audit", PartitionId::new(0), Offset::new(255), u64::MAX)
        .await
        .unwrap();
    assert_eq!(newest.records.len(), 1);

    let err = broker
        .fetch("audit", PartitionId::new(0), Offset::ZERO, u64::MAX)
        .await
        .unwrap_err();
    assert!(err.is_out_of_range());
}

#[tokio::test]
async fn test_group_assignment_and_stale_commit() {
    let cluster = Cluster::open(ClusterConfig::with_broker_count(3)).await.unwrap();
    cluster
        .create_topic("orders", 3, 2, RetentionPolicy::default())
        .await
        .unwrap();
    let billing = GroupId::from("billing");
    let a = MemberId::from("consumer-a");
    let b = MemberId::from("consumer-b");

    cluster.join_group(&billing, &a, &["orders"]).await.unwrap();
    let joined = cluster.join_group(&billing, &b, &["orders"]).await.unwrap();
    let a_parts = cluster.sync_group(&billing, &a, joined.generation).await.unwrap();
    let b_parts = cluster.sync_group(&billing, &b, joined.generation).await.unwrap();
    assert_eq!(a_parts.len(), 2);
    assert_eq!(b_parts.len(), 1);
    cluster.heartbeat(&billing, &a, joined.generation).await.unwrap();

    let tp = TopicPartition::new("orders", PartitionId::new(0));
    cluster
        .commit_offset(&billing, &tp, Offset::new(10), CommitMode::Monotonic)
        .await
        .unwrap();
    let err = cluster
        .commit_offset(&billing, &tp, Offset::new(5), CommitMode::Monotonic)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Group(GroupError::StaleCommit { .. })));
    assert_eq!(
        cluster.fetch_committed_offset(&billing, &tp).await.unwrap(),
        Some(Offset::new(10))
    );

    cluster
        .commit_offset(&billing, &tp, Offset::new(5), CommitMode::Reset)
        .await
        .unwrap();
    assert_eq!(
        cluster.fetch_committed_offset(&billing, &tp).await.unwrap(),
        Some(Offset::new(5))
    );

    let missing = TopicPartition::new("orders", PartitionId::new(9));
    let err = cluster
        .commit_offset(&billing, &missing, Offset::new(1), CommitMode::Monotonic)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownPartition { .. }));
}

#[tokio::test]
async fn test_restart_recovers_log_and_committed_offsets() {
    let dir = TempDir::new().unwrap();
    let config = ClusterConfig::with_broker_count(3).with_data_dir(dir.path());
    let billing = GroupId::from("billing");
    let tp = TopicPartition::new("orders", PartitionId::new(0));

    {
        let cluster = Cluster::start(config.clone()).await.unwrap();
        cluster
            .create_topic("orders", 1, 3, RetentionPolicy::default())
            .await
            .unwrap();
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        let batch: Vec<Record> = (0..10).map(|i| Record::new(format!("r{i}"))).collect();
        leader
            .produce_batch("orders", Some(PartitionId::new(0)), batch, AckMode::All)
            .await
            .unwrap();
        cluster
            .commit_offset(&billing, &tp, Offset::new(7), CommitMode::Monotonic)
            .await
            .unwrap();
        cluster.shutdown().await.unwrap();
    }

    let cluster = Cluster::open(config).await.unwrap();
    cluster
        .create_topic("orders", 1, 3, RetentionPolicy::default())
        .await
        .unwrap();
    let leader = cluster.broker(NodeId::new(1)).await.unwrap();
    let fetched = leader
        .fetch("orders", PartitionId::new(0), Offset::ZERO, u64::MAX)
        .await
        .unwrap();
    assert_eq!(fetched.records.len(), 10);
    assert_eq!(fetched.high_water_mark, Offset::new(10));
    assert_eq!(
        cluster.fetch_committed_offset(&billing, &tp).await.unwrap(),
        Some(Offset::new(7))
    );
}
