//! Partition selection for produce requests without an explicit partition.

use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::PartitionId;

/// Chooses partitions for records.
///
/// Keyed records hash to a fixed partition (`crc32(key) % partitions`), so
/// all records with one key stay in order within one partition. Unkeyed
/// records rotate round-robin.
#[derive(Debug, Default)]
pub struct Partitioner {
    round_robin_counter: AtomicU64,
}

impl Partitioner {
    /// Creates a partitioner starting at partition 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            round_robin_counter: AtomicU64::new(0),
        }
    }

    /// Selects a partition for a record with the given key.
    ///
    /// # Panics
    /// Panics if `partition_count` is zero.
    #[must_use]
    pub fn select(&self, key: Option<&[u8]>, partition_count: u32) -> PartitionId {
        assert!(partition_count > 0, "topic has no partitions");
        let count = u64::from(partition_count);
        match key {
            Some(key) => PartitionId::new(u64::from(crc32fast::hash(key)) % count),
            None => {
                let next = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                PartitionId::new(next % count)
            }
        }
    }
}
