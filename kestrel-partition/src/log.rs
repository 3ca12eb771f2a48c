//! Partition logs.
//!
//! A partition log is the totally ordered record stream of one replica of a
//! partition. It is a chain of segments keyed by base offset: closed segments
//! plus exactly one active segment that takes appends. Offsets are dense; the
//! log spans `[log_start_offset, log_end_offset)`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use kestrel_core::{Offset, Record, Timestamp, TopicPartition};
use tracing::{debug, info, warn};

use crate::error::{PartitionError, PartitionResult};
use crate::retention::{select_expired, RetentionOutcome, RetentionPolicy, SegmentSummary};
use crate::segment::{parse_segment_file_name, Segment, SegmentConfig, FRAME_HEADER_BYTES};

/// Configuration for a partition log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Segment rolling and indexing.
    pub segment: SegmentConfig,
    /// Head-of-log retention.
    pub retention: RetentionPolicy,
}

impl LogConfig {
    /// Sets the segment configuration.
    #[must_use]
    pub const fn with_segment(mut self, segment: SegmentConfig) -> Self {
        self.segment = segment;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub const fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if any part is invalid.
    pub fn validate(&self) -> PartitionResult<()> {
        self.segment.validate()?;
        if self.retention.max_bytes == Some(0) {
            return Err(PartitionError::InvalidConfig {
                message: "retention max_bytes must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Where a log keeps its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStorage {
    /// Segments live only in memory.
    Memory,
    /// Segments are mirrored to files in this directory.
    Directory(PathBuf),
}

/// Upper bound of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchIsolation {
    /// Only committed records (below the high-water mark). Consumers read this way.
    HighWaterMark,
    /// Everything up to the log end. Followers replicate this way.
    LogEnd,
}

/// Records returned by a fetch, with the offsets a reader needs to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Records in offset order.
    pub records: Vec<Record>,
    /// Offset to fetch from next.
    pub next_offset: Offset,
    /// High-water mark at fetch time.
    pub high_water_mark: Offset,
    /// First retained offset at fetch time.
    pub log_start_offset: Offset,
}

/// Point-in-time description of a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMetadata {
    /// Which partition this log belongs to.
    pub topic_partition: TopicPartition,
    /// First retained offset.
    pub log_start_offset: Offset,
    /// Next offset to be assigned.
    pub log_end_offset: Offset,
    /// Committed offset bound.
    pub high_water_mark: Offset,
    /// Number of segments, including the active one.
    pub segment_count: usize,
    /// Base offset of the active segment.
    pub active_segment_base: Offset,
    /// Total stored bytes.
    pub size_bytes: u64,
}

/// One replica's record stream for a partition.
#[derive(Debug)]
pub struct PartitionLog {
    topic_partition: TopicPartition,
    config: LogConfig,
    storage: LogStorage,
    /// Closed segments keyed by base offset.
    closed: BTreeMap<Offset, Segment>,
    /// The only segment that accepts appends.
    active: Segment,
    high_water_mark: Offset,
}

impl PartitionLog {
    /// Opens a log, recovering any segments already in `storage`.
    ///
    /// A recovered log starts with its high-water mark at the log start; the
    /// replication group re-establishes it.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a bad config, `Corrupt` if recovered
    /// segments fail integrity checks, and `Io` on file errors.
    pub fn open(
        topic_partition: TopicPartition,
        config: LogConfig,
        storage: LogStorage,
        now: Timestamp,
    ) -> PartitionResult<Self> {
        config.validate()?;

        let (closed, active) = match &storage {
            LogStorage::Memory => (BTreeMap::new(), Segment::new(Offset::ZERO, config.segment)),
            LogStorage::Directory(dir) => Self::recover(&topic_partition, dir, config.segment, now)?,
        };

        let high_water_mark = closed
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| active.base_offset());

        let log = Self {
            topic_partition,
            config,
            storage,
            closed,
            active,
            high_water_mark,
        };
        log.check_invariants();
        Ok(log)
    }

    /// Creates an empty in-memory log.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a bad config.
    pub fn in_memory(topic_partition: TopicPartition, config: LogConfig) -> PartitionResult<Self> {
        Self::open(topic_partition, config, LogStorage::Memory, Timestamp::now())
    }

    fn recover(
        topic_partition: &TopicPartition,
        dir: &Path,
        segment_config: SegmentConfig,
        now: Timestamp,
    ) -> PartitionResult<(BTreeMap<Offset, Segment>, Segment)> {
        fs::create_dir_all(dir).map_err(|e| PartitionError::io("log create dir", &e))?;

        let mut paths: Vec<(Offset, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| PartitionError::io("log list", &e))? {
            let path = entry.map_err(|e| PartitionError::io("log list", &e))?.path();
            if let Some(base) = parse_segment_file_name(&path) {
                paths.push((base, path));
            }
        }
        paths.sort_by_key(|(base, _)| *base);

        let Some((_, last_path)) = paths.pop() else {
            let active = Segment::create(dir, Offset::ZERO, segment_config)?;
            return Ok((BTreeMap::new(), active));
        };

        let mut closed = BTreeMap::new();
        let mut expected: Option<Offset> = None;
        for (base, path) in &paths {
            let mut segment = Segment::open(path, segment_config, false, now)?;
            Self::check_contiguous(expected, &segment)?;
            expected = Some(segment.next_offset());
            segment.close()?;
            closed.insert(*base, segment);
        }

        // Only the last segment can hold an interrupted write.
        let active = Segment::open(&last_path, segment_config, true, now)?;
        Self::check_contiguous(expected, &active)?;

        info!(
            topic_partition = %topic_partition,
            segments = closed.len() + 1,
            log_end_offset = active.next_offset().get(),
            "Recovered partition log"
        );
        Ok((closed, active))
    }

    fn check_contiguous(expected: Option<Offset>, segment: &Segment) -> PartitionResult<()> {
        match expected {
            Some(expected) if expected != segment.base_offset() => Err(PartitionError::Corrupt {
                base_offset: segment.base_offset(),
                position: 0,
                reason: format!("segment chain gap: expected base offset {expected}"),
            }),
            _ => Ok(()),
        }
    }

    fn check_invariants(&self) {
        debug_assert!(!self.active.is_closed());
        debug_assert!(self.high_water_mark >= self.log_start_offset());
        debug_assert!(self.high_water_mark <= self.log_end_offset());
        debug_assert!(self
            .closed
            .values()
            .all(|s| s.is_closed() && s.next_offset() <= self.active.base_offset()));
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Returns the partition this log belongs to.
    #[must_use]
    pub const fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Returns the log configuration.
    #[must_use]
    pub const fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Returns the first retained offset.
    #[must_use]
    pub fn log_start_offset(&self) -> Offset {
        self.closed
            .values()
            .next()
            .map_or_else(|| self.active.base_offset(), Segment::base_offset)
    }

    /// Returns the next offset to be assigned.
    #[must_use]
    pub const fn log_end_offset(&self) -> Offset {
        self.active.next_offset()
    }

    /// Returns the high-water mark.
    #[must_use]
    pub const fn high_water_mark(&self) -> Offset {
        self.high_water_mark
    }

    /// Returns the number of segments, including the active one.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.closed.len() + 1
    }

    /// Returns the total stored bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.closed.values().map(Segment::size_bytes).sum::<u64>() + self.active.size_bytes()
    }

    /// Returns a point-in-time description of the log.
    #[must_use]
    pub fn metadata(&self) -> LogMetadata {
        LogMetadata {
            topic_partition: self.topic_partition.clone(),
            log_start_offset: self.log_start_offset(),
            log_end_offset: self.log_end_offset(),
            high_water_mark: self.high_water_mark,
            segment_count: self.segment_count(),
            active_segment_base: self.active.base_offset(),
            size_bytes: self.size_bytes(),
        }
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Appends a record, assigning it the next offset.
    ///
    /// Rolls the active segment first if the record would pass its size
    /// threshold or the segment has reached its age threshold.
    ///
    /// # Errors
    /// Returns `Io` if the segment cannot be written or rolled.
    pub fn append(&mut self, record: Record, now: Timestamp) -> PartitionResult<Offset> {
        self.maybe_roll(record.encoded_len(), now)?;
        let offset = self.active.append(record, now)?;

        // Postcondition: the record landed at the end of the log.
        debug_assert_eq!(offset.next(), self.log_end_offset());
        Ok(offset)
    }

    /// Appends records in order, returning the offset of the first.
    ///
    /// An empty batch returns the log end offset and writes nothing.
    ///
    /// # Errors
    /// Same as [`PartitionLog::append`]. Records before the failing one stay
    /// appended.
    pub fn append_batch(&mut self, records: Vec<Record>, now: Timestamp) -> PartitionResult<Offset> {
        let base_offset = self.log_end_offset();
        for record in records {
            self.append(record, now)?;
        }
        Ok(base_offset)
    }

    /// Appends records copied from the leader, keeping their offsets.
    ///
    /// # Errors
    /// Returns `NonContiguousAppend` if the first record is not at the log end
    /// or the records have gaps.
    pub fn append_replicated(&mut self, records: &[Record], now: Timestamp) -> PartitionResult<()> {
        for record in records {
            self.maybe_roll(record.encoded_len(), now)?;
            self.active.append_replicated(record, now)?;
        }
        Ok(())
    }

    fn maybe_roll(&mut self, record_len: usize, now: Timestamp) -> PartitionResult<()> {
        let incoming = (record_len + FRAME_HEADER_BYTES) as u64;
        if self.active.should_roll(incoming, now) {
            self.roll()?;
        }
        Ok(())
    }

    /// Closes the active segment and starts a new one at the log end.
    ///
    /// Does nothing if the active segment is empty. Either the roll completes
    /// or the old segment stays active.
    ///
    /// # Errors
    /// Returns `Io` if the new segment cannot be created or the old one
    /// cannot be synced.
    pub fn roll(&mut self) -> PartitionResult<()> {
        if self.active.is_empty() {
            return Ok(());
        }

        let base_offset = self.log_end_offset();
        let next = self.new_segment(base_offset)?;
        if let Err(err) = self.active.close() {
            if let Err(cleanup) = next.delete() {
                warn!(topic_partition = %self.topic_partition, error = %cleanup, "Failed to discard new segment");
            }
            return Err(err);
        }

        let old = std::mem::replace(&mut self.active, next);
        debug!(
            topic_partition = %self.topic_partition,
            closed_base = old.base_offset().get(),
            closed_bytes = old.size_bytes(),
            new_base = base_offset.get(),
            "Rolled segment"
        );
        self.closed.insert(old.base_offset(), old);

        self.check_invariants();
        Ok(())
    }

    fn new_segment(&self, base_offset: Offset) -> PartitionResult<Segment> {
        match &self.storage {
            LogStorage::Memory => Ok(Segment::new(base_offset, self.config.segment)),
            LogStorage::Directory(dir) => Segment::create(dir, base_offset, self.config.segment),
        }
    }

    /// Moves the high-water mark forward to `candidate`, capped at the log
    /// end. Never moves it backwards. Returns the resulting mark.
    pub fn advance_high_water_mark(&mut self, candidate: Offset) -> Offset {
        let capped = candidate.min(self.log_end_offset());
        if capped > self.high_water_mark {
            self.high_water_mark = capped;
        }
        self.high_water_mark
    }

    /// Removes every record at or after `offset`.
    ///
    /// # Errors
    /// Returns `InvalidTruncation` if `offset` is below the high-water mark.
    pub fn truncate_to(&mut self, offset: Offset) -> PartitionResult<()> {
        if offset < self.high_water_mark {
            return Err(PartitionError::InvalidTruncation {
                offset,
                high_water_mark: self.high_water_mark,
            });
        }
        if offset >= self.log_end_offset() {
            return Ok(());
        }

        let from = self.log_end_offset();
        if offset >= self.active.base_offset() {
            self.active.truncate(offset)?;
        } else {
            // The truncation point is inside a closed segment, which becomes
            // the active one. Everything after it goes.
            let mut doomed = self.closed.split_off(&offset);
            let reopened = match self.closed.pop_last() {
                Some((_, segment)) => segment,
                None => match doomed.pop_first() {
                    Some((_, segment)) => segment,
                    None => {
                        return Err(PartitionError::InvalidTruncation {
                            offset,
                            high_water_mark: self.high_water_mark,
                        })
                    }
                },
            };
            let old_active = std::mem::replace(&mut self.active, reopened);
            self.active.truncate(offset)?;
            for segment in doomed.into_values().chain(std::iter::once(old_active)) {
                segment.delete()?;
            }
        }

        info!(
            topic_partition = %self.topic_partition,
            from = from.get(),
            to = offset.get(),
            "Truncated partition log"
        );
        self.check_invariants();
        Ok(())
    }

    /// Discards every record and restarts the log empty at `offset`.
    ///
    /// Used when a replica has fallen behind the leader's retained range.
    ///
    /// # Errors
    /// Returns `Io` if segments cannot be deleted or created.
    pub fn reset_to(&mut self, offset: Offset) -> PartitionResult<()> {
        let fresh = Segment::new(offset, self.config.segment);
        let old_active = std::mem::replace(&mut self.active, fresh);
        let closed = std::mem::take(&mut self.closed);
        for segment in closed.into_values().chain(std::iter::once(old_active)) {
            segment.delete()?;
        }
        self.active = self.new_segment(offset)?;
        self.high_water_mark = offset;

        warn!(
            topic_partition = %self.topic_partition,
            offset = offset.get(),
            "Reset partition log"
        );
        self.check_invariants();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Reads records from `start`, up to `max_bytes` of frames.
    ///
    /// At least one record is returned whenever one is visible. Reading at
    /// the visible end returns no records.
    ///
    /// # Errors
    /// Returns `OutOfRange` if `start` is below the log start or past the log
    /// end, and `Corrupt` if a frame fails its checksum.
    pub fn fetch(
        &self,
        start: Offset,
        max_bytes: u64,
        isolation: FetchIsolation,
    ) -> PartitionResult<FetchResult> {
        let log_start = self.log_start_offset();
        let log_end = self.log_end_offset();
        if start < log_start || start > log_end {
            return Err(PartitionError::OutOfRange {
                offset: start,
                log_start,
                log_end,
            });
        }

        let upper = match isolation {
            FetchIsolation::HighWaterMark => self.high_water_mark,
            FetchIsolation::LogEnd => log_end,
        };

        let mut records = Vec::new();
        let mut position = start;
        let mut budget = max_bytes;
        for segment in self.segments_from(start) {
            if position >= upper {
                break;
            }
            if segment.next_offset() <= position {
                continue;
            }
            let (batch, used) = segment.read_range(position, upper, budget, records.is_empty())?;
            budget = budget.saturating_sub(used);
            let Some(last) = batch.last() else { break };
            position = last.offset.next();
            records.extend(batch);
            // A short read means the budget ran out inside this segment.
            if position < segment.next_offset().min(upper) {
                break;
            }
        }

        Ok(FetchResult {
            next_offset: position.max(start),
            records,
            high_water_mark: self.high_water_mark,
            log_start_offset: log_start,
        })
    }

    /// Segments that may hold `offset` or anything after it, in order.
    fn segments_from(&self, offset: Offset) -> impl Iterator<Item = &Segment> {
        let first_base = self
            .closed
            .range(..=offset)
            .next_back()
            .map_or(offset, |(base, _)| *base);
        self.closed
            .range(first_base..)
            .map(|(_, segment)| segment)
            .chain(std::iter::once(&self.active))
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Applies the retention policy.
    ///
    /// Deletes closed segments from the head of the log that are past the
    /// age limit or keep the log over the size limit. The active segment and
    /// anything at or above the high-water mark are never deleted.
    ///
    /// # Errors
    /// Returns `Io` if a segment file cannot be removed.
    pub fn retention_sweep(&mut self, now: Timestamp) -> PartitionResult<RetentionOutcome> {
        let summaries: Vec<SegmentSummary> = self
            .closed
            .values()
            .map(|s| SegmentSummary {
                base_offset: s.base_offset(),
                next_offset: s.next_offset(),
                size_bytes: s.size_bytes(),
                last_append_at: s.last_append_at(),
            })
            .collect();
        let selected = select_expired(
            &summaries,
            self.size_bytes(),
            self.high_water_mark,
            &self.config.retention,
            now,
        );

        let mut outcome = RetentionOutcome::default();
        for base in selected {
            if let Some(segment) = self.closed.remove(&base) {
                outcome.deleted_bytes += segment.size_bytes();
                segment.delete()?;
                outcome.deleted_segments.push(base);
            }
        }
        outcome.log_start_offset = self.log_start_offset();

        if !outcome.is_empty() {
            info!(
                topic_partition = %self.topic_partition,
                segments = outcome.deleted_segments.len(),
                bytes = outcome.deleted_bytes,
                log_start_offset = outcome.log_start_offset.get(),
                "Retention deleted segments"
            );
        }
        self.check_invariants();
        Ok(outcome)
    }

    /// Syncs the active segment to stable storage.
    ///
    /// # Errors
    /// Returns `Io` if the sync fails.
    pub fn flush(&self) -> PartitionResult<()> {
        self.active.sync()
    }

    /// Deletes every segment and, for file-backed logs, the log directory.
    ///
    /// # Errors
    /// Returns `Io` if files cannot be removed.
    pub fn delete(self) -> PartitionResult<()> {
        for segment in self.closed.into_values().chain(std::iter::once(self.active)) {
            segment.delete()?;
        }
        if let LogStorage::Directory(dir) = &self.storage {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PartitionError::io("log delete dir", &e)),
            }
        }
        info!(topic_partition = %self.topic_partition, "Deleted partition log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::PartitionId;

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", PartitionId::new(0))
    }

    fn at(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn small_segments() -> LogConfig {
        LogConfig::default()
            .with_segment(SegmentConfig::default().with_max_size_bytes(256))
            .with_retention(RetentionPolicy::unlimited())
    }

    fn fill(log: &mut PartitionLog, count: usize) {
        for i in 0..count {
            log.append(Record::new(format!("record-{i:04}")), at(0)).unwrap();
        }
    }

    #[test]
    fn test_log_append_and_offsets() {
        let mut log = PartitionLog::in_memory(tp(), LogConfig::default()).unwrap();
        assert_eq!(log.log_end_offset(), Offset::ZERO);

        let first = log.append(Record::new("a"), at(0)).unwrap();
        let base = log
            .append_batch(vec![Record::new("b"), Record::new("c")], at(0))
            .unwrap();

        assert_eq!(first, Offset::new(0));
        assert_eq!(base, Offset::new(1));
        assert_eq!(log.log_end_offset(), Offset::new(3));
        assert_eq!(log.high_water_mark(), Offset::ZERO);
    }

    #[test]
    fn test_log_rolls_on_size() {
        let mut log = PartitionLog::in_memory(tp(), small_segments()).unwrap();
        fill(&mut log, 40);
        assert!(log.segment_count() > 1);

        // Reads span segment boundaries.
        let result = log.fetch(Offset::ZERO, u64::MAX, FetchIsolation::LogEnd).unwrap();
        assert_eq!(result.records.len(), 40);
        for (i, record) in result.records.iter().enumerate() {
            assert_eq!(record.offset, Offset::new(i as u64));
        }
        assert_eq!(result.next_offset, Offset::new(40));
    }

    #[test]
    fn test_log_rolls_on_age() {
        let config = LogConfig::default().with_segment(SegmentConfig::default().with_max_age_ms(1_000));
        let mut log = PartitionLog::in_memory(tp(), config).unwrap();
        log.append(Record::new("old"), at(0)).unwrap();
        log.append(Record::new("still"), at(999)).unwrap();
        assert_eq!(log.segment_count(), 1);

        log.append(Record::new("new"), at(1_000)).unwrap();
        assert_eq!(log.segment_count(), 2);
        assert_eq!(log.metadata().active_segment_base, Offset::new(2));
    }

    #[test]
    fn test_log_fetch_bounded_by_high_water_mark() {
        let mut log = PartitionLog::in_memory(tp(), LogConfig::default()).unwrap();
        fill(&mut log, 10);
        log.advance_high_water_mark(Offset::new(6));

        let committed = log
            .fetch(Offset::new(4), u64::MAX, FetchIsolation::HighWaterMark)
            .unwrap();
        assert_eq!(committed.records.len(), 2);
        assert_eq!(committed.next_offset, Offset::new(6));
        assert_eq!(committed.high_water_mark, Offset::new(6));

        // At the high-water mark: nothing yet.
        let empty = log
            .fetch(Offset::new(6), u64::MAX, FetchIsolation::HighWaterMark)
            .unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.next_offset, Offset::new(6));

        let err = log
            .fetch(Offset::new(11), u64::MAX, FetchIsolation::LogEnd)
            .unwrap_err();
        assert!(matches!(err, PartitionError::OutOfRange { .. }));
    }

    #[test]
    fn test_log_fetch_returns_one_oversized_record() {
        let mut log = PartitionLog::in_memory(tp(), small_segments()).unwrap();
        fill(&mut log, 20);

        let result = log.fetch(Offset::new(5), 1, FetchIsolation::LogEnd).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.next_offset, Offset::new(6));
    }

    #[test]
    fn test_high_water_mark_is_monotonic_and_capped() {
        let mut log = PartitionLog::in_memory(tp(), LogConfig::default()).unwrap();
        fill(&mut log, 5);

        assert_eq!(log.advance_high_water_mark(Offset::new(3)), Offset::new(3));
        assert_eq!(log.advance_high_water_mark(Offset::new(1)), Offset::new(3));
        assert_eq!(log.advance_high_water_mark(Offset::new(99)), Offset::new(5));
    }

    #[test]
    fn test_log_truncate_across_segments() {
        let mut log = PartitionLog::in_memory(tp(), small_segments()).unwrap();
        fill(&mut log, 40);
        log.advance_high_water_mark(Offset::new(5));
        let segments_before = log.segment_count();

        log.truncate_to(Offset::new(7)).unwrap();
        assert_eq!(log.log_end_offset(), Offset::new(7));
        assert!(log.segment_count() < segments_before);

        let offset = log.append(Record::new("after"), at(0)).unwrap();
        assert_eq!(offset, Offset::new(7));

        let err = log.truncate_to(Offset::new(4)).unwrap_err();
        assert_eq!(
            err,
            PartitionError::InvalidTruncation {
                offset: Offset::new(4),
                high_water_mark: Offset::new(5),
            }
        );
    }

    #[test]
    fn test_log_truncate_to_start() {
        let mut log = PartitionLog::in_memory(tp(), small_segments()).unwrap();
        fill(&mut log, 40);

        log.truncate_to(Offset::ZERO).unwrap();
        assert_eq!(log.log_end_offset(), Offset::ZERO);
        assert_eq!(log.segment_count(), 1);
    }

    #[test]
    fn test_log_retention_by_size() {
        let config = small_segments().with_retention(RetentionPolicy::unlimited().with_max_bytes(600));
        let mut log = PartitionLog::in_memory(tp(), config).unwrap();
        fill(&mut log, 60);
        log.advance_high_water_mark(log.log_end_offset());
        let before = log.size_bytes();

        let outcome = log.retention_sweep(at(0)).unwrap();
        assert!(!outcome.is_empty());
        assert!(log.size_bytes() <= 600 || log.segment_count() == 1);
        assert!(log.size_bytes() < before);
        assert_eq!(outcome.log_start_offset, log.log_start_offset());

        let err = log
            .fetch(Offset::ZERO, u64::MAX, FetchIsolation::HighWaterMark)
            .unwrap_err();
        assert!(matches!(err, PartitionError::OutOfRange { .. }));
    }

    #[test]
    fn test_log_retention_keeps_unreplicated() {
        let config = small_segments().with_retention(RetentionPolicy::unlimited().with_max_bytes(1));
        let mut log = PartitionLog::in_memory(tp(), config).unwrap();
        fill(&mut log, 60);

        // Nothing is committed, so nothing may go.
        let outcome = log.retention_sweep(at(0)).unwrap();
        assert!(outcome.is_empty());
        assert_eq!(log.log_start_offset(), Offset::ZERO);
    }

    #[test]
    fn test_log_replicated_append_requires_contiguity() {
        let mut leader = PartitionLog::in_memory(tp(), LogConfig::default()).unwrap();
        fill(&mut leader, 3);
        let records = leader
            .fetch(Offset::new(1), u64::MAX, FetchIsolation::LogEnd)
            .unwrap()
            .records;

        let mut follower = PartitionLog::in_memory(tp(), LogConfig::default()).unwrap();
        let err = follower.append_replicated(&records, at(0)).unwrap_err();
        assert_eq!(
            err,
            PartitionError::NonContiguousAppend {
                expected: Offset::ZERO,
                actual: Offset::new(1),
            }
        );
    }

    #[test]
    fn test_log_reset_to() {
        let mut log = PartitionLog::in_memory(tp(), small_segments()).unwrap();
        fill(&mut log, 20);

        log.reset_to(Offset::new(100)).unwrap();
        assert_eq!(log.log_start_offset(), Offset::new(100));
        assert_eq!(log.log_end_offset(), Offset::new(100));
        assert_eq!(log.high_water_mark(), Offset::new(100));
    }

    #[test]
    fn test_log_refetch_is_byte_identical_across_roll_and_reopen() {
        fn encoded(result: &FetchResult) -> bytes::BytesMut {
            let mut buf = bytes::BytesMut::new();
            for record in &result.records {
                record.encode(&mut buf);
            }
            buf
        }

        let dir = tempfile::tempdir().unwrap();
        let storage = LogStorage::Directory(dir.path().join("orders-0"));
        let mut log = PartitionLog::open(tp(), small_segments(), storage.clone(), at(0)).unwrap();
        for i in 0..40i64 {
            let record = Record::with_key(format!("k{i}"), format!("record-{i:04}"))
                .with_timestamp(at(1_000 + i))
                .with_header("trace", format!("t{i}"));
            log.append(record, at(i)).unwrap();
        }
        log.advance_high_water_mark(log.log_end_offset());
        assert!(log.segment_count() > 1);
        let second_segment = log.metadata().active_segment_base;
        let start = Offset::new(second_segment.get().saturating_sub(3));

        let first = log.fetch(start, 1024, FetchIsolation::HighWaterMark).unwrap();
        assert!(first.records.len() > 3, "range must cross a segment roll");
        let again = log.fetch(start, 1024, FetchIsolation::HighWaterMark).unwrap();
        assert_eq!(encoded(&first), encoded(&again));
        assert_eq!(first.next_offset, again.next_offset);

        log.flush().unwrap();
        drop(log);
        let mut reopened = PartitionLog::open(tp(), small_segments(), storage, at(100)).unwrap();
        reopened.advance_high_water_mark(Offset::new(40));
        let recovered = reopened.fetch(start, 1024, FetchIsolation::HighWaterMark).unwrap();
        assert_eq!(encoded(&first), encoded(&recovered));
        assert_eq!(first.next_offset, recovered.next_offset);
        assert_eq!(
            recovered.next_offset,
            start.add(recovered.records.len() as u64)
        );
    }
}
