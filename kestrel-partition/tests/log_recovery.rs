//! File-backed partition log and replication group recovery.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use kestrel_core::{NodeId, Offset, PartitionId, Record, Timestamp, TopicPartition};
use kestrel_partition::{
    segment_file_name, AckMode, FetchIsolation, LeaderCheckpoint, LogConfig, LogStorage,
    PartitionError, PartitionLog, ReplicationConfig, ReplicationGroup, RetentionPolicy,
    SegmentConfig, CHECKPOINT_FILE_NAME,
};

fn tp() -> TopicPartition {
    TopicPartition::new("orders", PartitionId::new(1))
}

fn at(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn config(segment_bytes: u64) -> LogConfig {
    LogConfig::default()
        .with_segment(SegmentConfig::default().with_max_size_bytes(segment_bytes))
        .with_retention(RetentionPolicy::unlimited())
}

#[test]
fn test_recover_multi_segment_log() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LogStorage::Directory(dir.path().join("orders-1"));

    let mut log = PartitionLog::open(tp(), config(512), storage.clone(), at(0)).unwrap();
    for i in 0..100 {
        log.append(Record::with_key(format!("k{i}"), format!("v{i}")), at(i)).unwrap();
    }
    log.flush().unwrap();
    let segments = log.segment_count();
    assert!(segments > 1);
    drop(log);

    let recovered = PartitionLog::open(tp(), config(512), storage, at(1_000)).unwrap();
    assert_eq!(recovered.segment_count(), segments);
    assert_eq!(recovered.log_start_offset(), Offset::ZERO);
    assert_eq!(recovered.log_end_offset(), Offset::new(100));

    let result = recovered
        .fetch(Offset::new(42), u64::MAX, FetchIsolation::LogEnd)
        .unwrap();
    assert_eq!(result.records.len(), 58);
    assert_eq!(result.records[0].key.as_deref(), Some(&b"k42"[..]));
    assert_eq!(result.records[0].value.as_ref(), b"v42");
}

#[test]
fn test_recover_discards_torn_write() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("orders-1");
    let storage = LogStorage::Directory(log_dir.clone());

    let mut log = PartitionLog::open(tp(), config(1 << 20), storage.clone(), at(0)).unwrap();
    for i in 0..10 {
        log.append(Record::new(format!("v{i}")), at(0)).unwrap();
    }
    drop(log);

    // A crash mid-frame leaves a partial header behind.
    let mut file = OpenOptions::new()
        .append(true)
        .open(log_dir.join(segment_file_name(Offset::ZERO)))
        .unwrap();
    file.write_all(&[0xAB; 5]).unwrap();
    drop(file);

    let mut recovered = PartitionLog::open(tp(), config(1 << 20), storage, at(0)).unwrap();
    assert_eq!(recovered.log_end_offset(), Offset::new(10));
    let next = recovered.append(Record::new("after-crash"), at(1)).unwrap();
    assert_eq!(next, Offset::new(10));
}

#[test]
fn test_recover_reports_corrupt_closed_segment() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("orders-1");
    let storage = LogStorage::Directory(log_dir.clone());

    let mut log = PartitionLog::open(tp(), config(256), storage.clone(), at(0)).unwrap();
    for i in 0..30 {
        log.append(Record::new(format!("value-{i:03}")), at(0)).unwrap();
    }
    assert!(log.segment_count() > 2);
    drop(log);

    let first = log_dir.join(segment_file_name(Offset::ZERO));
    let mut bytes = fs::read(&first).unwrap();
    bytes[10] ^= 0x55;
    fs::write(&first, &bytes).unwrap();

    let err = PartitionLog::open(tp(), config(256), storage, at(0)).unwrap_err();
    assert!(matches!(
        err,
        PartitionError::Corrupt { base_offset, .. } if base_offset == Offset::ZERO
    ));
}

#[test]
fn test_retention_removes_segment_files() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("orders-1");
    let storage = LogStorage::Directory(log_dir.clone());
    let config = config(1024).with_retention(RetentionPolicy::unlimited().with_max_bytes(4096));

    let mut log = PartitionLog::open(tp(), config, storage, at(0)).unwrap();
    for i in 0..400 {
        log.append(Record::new(format!("payload-{i:05}")), at(0)).unwrap();
    }
    log.advance_high_water_mark(log.log_end_offset());

    let outcome = log.retention_sweep(at(0)).unwrap();
    assert!(!outcome.is_empty());
    assert!(log.size_bytes() <= 4096);
    for base in &outcome.deleted_segments {
        assert!(!log_dir.join(segment_file_name(*base)).exists());
    }
    assert!(log_dir
        .join(segment_file_name(outcome.log_start_offset))
        .exists());
}

#[test]
fn test_delete_removes_directory() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("orders-1");
    let mut log = PartitionLog::open(tp(), config(256), LogStorage::Directory(log_dir.clone()), at(0)).unwrap();
    log.append(Record::new("x"), at(0)).unwrap();

    log.delete().unwrap();
    assert!(!log_dir.exists());
}

fn open_group(data_dir: &Path, now: i64) -> ReplicationGroup {
    ReplicationGroup::new(
        tp(),
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
        config(512),
        Some(data_dir),
        ReplicationConfig::default(),
        at(now),
    )
    .unwrap()
}

fn batch(prefix: &str, range: std::ops::Range<u32>) -> Vec<Record> {
    range.map(|i| Record::new(format!("{prefix}{i}"))).collect()
}

#[test]
fn test_group_restart_after_failover_keeps_new_leader() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut group = open_group(dir.path(), 0);
        group.append(batch("v", 0..10), AckMode::All, at(1)).unwrap();
        group.replicate_all(at(2));
        assert_eq!(group.high_water_mark(), Offset::new(10));

        let change = group
            .set_replica_online(NodeId::new(1), false, at(3))
            .unwrap()
            .unwrap();
        assert_eq!(change.leader, NodeId::new(2));

        group.append(batch("v", 10..15), AckMode::All, at(4)).unwrap();
        group.replicate_all(at(5));
        assert_eq!(group.high_water_mark(), Offset::new(15));
        group.flush().unwrap();
    }

    let checkpoint_path = dir.path().join(tp().to_string()).join(CHECKPOINT_FILE_NAME);
    let checkpoint = LeaderCheckpoint::read(&checkpoint_path).unwrap().unwrap();
    assert_eq!(checkpoint.leader, NodeId::new(2));
    assert_eq!(checkpoint.high_water_mark, Offset::new(15));

    let mut group = open_group(dir.path(), 10);
    assert_eq!(group.leader(), Some(NodeId::new(2)));
    assert_eq!(group.leader_epoch(), 1);
    assert_eq!(group.high_water_mark(), Offset::new(15));
    let fetched = group.fetch(Offset::ZERO, u64::MAX).unwrap();
    assert_eq!(fetched.records.len(), 15);
    assert_eq!(fetched.records[14].value.as_ref(), b"v14");

    // The replica that was offline catches up from the recovered leader.
    group.replicate_all(at(11));
    assert_eq!(
        group.replica_log(NodeId::new(1)).unwrap().log_end_offset(),
        Offset::new(15)
    );
    assert_eq!(group.in_sync_replicas().len(), 3);
}

#[test]
fn test_group_restart_drops_uncommitted_tail_of_old_leader() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut group = open_group(dir.path(), 0);
        group.append(batch("v", 0..10), AckMode::All, at(1)).unwrap();
        group.replicate_all(at(2));
        // Never replicated before broker 1 goes away.
        group.append(batch("lost", 10..13), AckMode::Leader, at(3)).unwrap();
        group.set_replica_online(NodeId::new(1), false, at(4)).unwrap();
        group.append(batch("new", 10..12), AckMode::All, at(5)).unwrap();
        group.replicate_all(at(6));
        assert_eq!(group.high_water_mark(), Offset::new(12));
        // No flush: the checkpoint still carries the mark from the election.
    }

    let mut group = open_group(dir.path(), 10);
    assert_eq!(group.leader(), Some(NodeId::new(2)));
    assert_eq!(
        group.replica_log(NodeId::new(1)).unwrap().log_end_offset(),
        Offset::new(10)
    );
    assert!(group.high_water_mark() >= Offset::new(10));

    group.replicate_all(at(11));
    for broker in [1, 2, 3] {
        let log = group.replica_log(NodeId::new(broker)).unwrap();
        let records = log
            .fetch(Offset::new(10), u64::MAX, FetchIsolation::LogEnd)
            .unwrap()
            .records;
        let values: Vec<&[u8]> = records.iter().map(|r| r.value.as_ref()).collect();
        assert_eq!(values, vec![&b"new10"[..], &b"new11"[..]], "broker {broker}");
    }
    assert_eq!(group.high_water_mark(), Offset::new(12));
}

#[test]
fn test_group_delete_removes_partition_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = open_group(dir.path(), 0);
    group.append(batch("v", 0..3), AckMode::Leader, at(1)).unwrap();
    let partition_dir = dir.path().join(tp().to_string());
    assert!(partition_dir.join(CHECKPOINT_FILE_NAME).exists());

    group.delete().unwrap();
    assert!(!partition_dir.exists());
}
