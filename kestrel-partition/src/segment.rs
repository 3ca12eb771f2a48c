//! Log segments.
//!
//! A segment is a contiguous run of records starting at its base offset.
//! Records are stored as checksummed frames:
//!
//! ```text
//! +-----------+-----------+--------------------+
//! | crc32 u32 | len u32   | record (len bytes) |
//! +-----------+-----------+--------------------+
//! ```
//!
//! The CRC covers the encoded record. A file-backed segment mirrors every
//! frame to `<base_offset:020>.log`; the in-memory copy serves reads. Once
//! closed, a segment only changes through truncation or deletion.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use kestrel_core::{Offset, Record, Timestamp};
use tracing::{debug, warn};

use crate::error::{PartitionError, PartitionResult};

/// Size of the frame header: CRC32 + record length.
pub const FRAME_HEADER_BYTES: usize = 8;

/// File extension of segment files.
pub const SEGMENT_FILE_EXTENSION: &str = "log";

/// Configuration for log segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Roll the active segment once it would grow past this many bytes.
    pub max_size_bytes: u64,
    /// Roll the active segment once its first record is this old (milliseconds).
    pub max_age_ms: u64,
    /// Bytes of frames between sparse index entries.
    pub index_interval_bytes: u64,
}

impl SegmentConfig {
    /// Creates a config with default thresholds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_size_bytes: 1024 * 1024 * 1024,  // 1 GB
            max_age_ms: 7 * 24 * 60 * 60 * 1000, // 7 days
            index_interval_bytes: 4096,
        }
    }

    /// Sets the size threshold.
    #[must_use]
    pub const fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    /// Sets the age threshold.
    #[must_use]
    pub const fn with_max_age_ms(mut self, ms: u64) -> Self {
        self.max_age_ms = ms;
        self
    }

    /// Sets the sparse index interval.
    #[must_use]
    pub const fn with_index_interval_bytes(mut self, bytes: u64) -> Self {
        self.index_interval_bytes = bytes;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a threshold is zero.
    pub fn validate(&self) -> PartitionResult<()> {
        if self.max_size_bytes == 0 {
            return Err(PartitionError::InvalidConfig {
                message: "segment max_size_bytes must be positive".to_string(),
            });
        }
        if self.max_age_ms == 0 {
            return Err(PartitionError::InvalidConfig {
                message: "segment max_age_ms must be positive".to_string(),
            });
        }
        if self.index_interval_bytes == 0 {
            return Err(PartitionError::InvalidConfig {
                message: "segment index_interval_bytes must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the file name of the segment with the given base offset.
#[must_use]
pub fn segment_file_name(base_offset: Offset) -> String {
    format!("{:020}.{SEGMENT_FILE_EXTENSION}", base_offset.get())
}

/// Parses the base offset out of a segment file path.
#[must_use]
pub fn parse_segment_file_name(path: &Path) -> Option<Offset> {
    if path.extension()? != SEGMENT_FILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<u64>().ok().map(Offset::new)
}

/// Index entry for fast offset lookups.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Offset of the indexed record.
    offset: Offset,
    /// Byte position of its frame.
    position: usize,
}

/// Why a frame could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameError {
    /// The data ends inside the frame.
    Torn,
    /// The stored CRC does not match.
    Checksum,
    /// The CRC matched but the record did not decode.
    Malformed,
}

impl FrameError {
    const fn reason(self) -> &'static str {
        match self {
            Self::Torn => "incomplete frame",
            Self::Checksum => "checksum mismatch",
            Self::Malformed => "undecodable record",
        }
    }
}

/// Reads the frame at `position`. `Ok(None)` marks the clean end of data.
fn read_frame(data: &[u8], position: usize) -> Result<Option<(Record, usize)>, FrameError> {
    let remaining = &data[position..];
    if remaining.is_empty() {
        return Ok(None);
    }
    if remaining.len() < FRAME_HEADER_BYTES {
        return Err(FrameError::Torn);
    }

    let mut header = &remaining[..FRAME_HEADER_BYTES];
    let expected_crc = header.get_u32_le();
    let len = header.get_u32_le() as usize;
    if remaining.len() - FRAME_HEADER_BYTES < len {
        return Err(FrameError::Torn);
    }

    let body = &remaining[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + len];
    if crc32fast::hash(body) != expected_crc {
        return Err(FrameError::Checksum);
    }

    let mut cursor = body;
    match Record::decode(&mut cursor) {
        Some(record) if !cursor.has_remaining() => {
            Ok(Some((record, position + FRAME_HEADER_BYTES + len)))
        }
        _ => Err(FrameError::Malformed),
    }
}

/// Encodes a record as a checksummed frame.
#[allow(clippy::cast_possible_truncation)] // Record sizes are bounded by `Limits`.
fn encode_frame(record: &Record) -> BytesMut {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_BYTES + record.encoded_len());
    frame.put_u64_le(0);
    record.encode(&mut frame);

    let body_len = (frame.len() - FRAME_HEADER_BYTES) as u32;
    let crc = crc32fast::hash(&frame[FRAME_HEADER_BYTES..]);
    frame[0..4].copy_from_slice(&crc.to_le_bytes());
    frame[4..8].copy_from_slice(&body_len.to_le_bytes());
    frame
}

/// Backing file of a segment.
#[derive(Debug)]
struct SegmentFile {
    path: PathBuf,
    handle: File,
}

/// A single log segment.
#[derive(Debug)]
pub struct Segment {
    /// First offset in this segment.
    base_offset: Offset,
    /// Next offset to be written.
    next_offset: Offset,
    config: SegmentConfig,
    /// Encoded frames.
    data: BytesMut,
    /// Sparse index; the first entry always points at the first frame.
    index: Vec<IndexEntry>,
    bytes_since_index: u64,
    /// Append time of the first record, for age-based rolling.
    first_append_at: Option<Timestamp>,
    /// Append time of the newest record, for age-based retention.
    last_append_at: Option<Timestamp>,
    closed: bool,
    file: Option<SegmentFile>,
}

impl Segment {
    /// Creates an empty in-memory segment.
    #[must_use]
    pub fn new(base_offset: Offset, config: SegmentConfig) -> Self {
        Self {
            base_offset,
            next_offset: base_offset,
            config,
            data: BytesMut::new(),
            index: Vec::new(),
            bytes_since_index: 0,
            first_append_at: None,
            last_append_at: None,
            closed: false,
            file: None,
        }
    }

    /// Creates an empty file-backed segment in `dir`.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be created.
    pub fn create(dir: &Path, base_offset: Offset, config: SegmentConfig) -> PartitionResult<Self> {
        let path = dir.join(segment_file_name(base_offset));
        let handle = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| PartitionError::io("segment create", &e))?;
        handle
            .set_len(0)
            .map_err(|e| PartitionError::io("segment create", &e))?;

        debug!(path = %path.display(), base_offset = base_offset.get(), "Created segment file");

        let mut segment = Self::new(base_offset, config);
        segment.file = Some(SegmentFile { path, handle });
        Ok(segment)
    }

    /// Opens an existing segment file, rebuilding the index from its frames.
    ///
    /// A torn final frame is cut off when `repair_torn_tail` is set (the last
    /// segment of a log, interrupted mid-write). Anywhere else, and for any
    /// checksum failure, the segment is reported as corrupt.
    ///
    /// # Errors
    /// Returns `Corrupt` on integrity failures and `Io` on file errors.
    pub fn open(
        path: &Path,
        config: SegmentConfig,
        repair_torn_tail: bool,
        now: Timestamp,
    ) -> PartitionResult<Self> {
        let base_offset = parse_segment_file_name(path).ok_or_else(|| PartitionError::Corrupt {
            base_offset: Offset::ZERO,
            position: 0,
            reason: format!("unrecognized segment file name {}", path.display()),
        })?;

        let mut handle = OpenOptions::new()
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| PartitionError::io("segment open", &e))?;
        let mut raw = Vec::new();
        handle
            .read_to_end(&mut raw)
            .map_err(|e| PartitionError::io("segment read", &e))?;

        let mut segment = Self::new(base_offset, config);
        let mut position = 0;
        let mut newest: Option<Timestamp> = None;
        loop {
            match read_frame(&raw, position) {
                Ok(None) => break,
                Ok(Some((record, next_position))) => {
                    if record.offset != segment.next_offset {
                        return Err(PartitionError::Corrupt {
                            base_offset,
                            position: position as u64,
                            reason: format!(
                                "expected offset {}, found {}",
                                segment.next_offset, record.offset
                            ),
                        });
                    }
                    segment.track_index(record.offset, position, (next_position - position) as u64);
                    segment.next_offset = record.offset.next();
                    newest = newest.max(Some(record.timestamp));
                    position = next_position;
                }
                Err(FrameError::Torn) if repair_torn_tail => {
                    warn!(
                        path = %path.display(),
                        position,
                        discarded = raw.len() - position,
                        "Truncating torn segment tail"
                    );
                    handle
                        .set_len(position as u64)
                        .map_err(|e| PartitionError::io("segment repair", &e))?;
                    break;
                }
                Err(err) => {
                    return Err(PartitionError::Corrupt {
                        base_offset,
                        position: position as u64,
                        reason: err.reason().to_string(),
                    });
                }
            }
        }

        raw.truncate(position);
        segment.data = BytesMut::from(&raw[..]);
        if !segment.is_empty() {
            // Recovered segments age from their newest record, never from the future.
            let aged_from = newest.map_or(now, |ts| ts.min(now));
            segment.first_append_at = Some(aged_from);
            segment.last_append_at = Some(aged_from);
        }
        segment.file = Some(SegmentFile {
            path: path.to_path_buf(),
            handle,
        });
        Ok(segment)
    }

    /// Returns the base offset of this segment.
    #[must_use]
    pub const fn base_offset(&self) -> Offset {
        self.base_offset
    }

    /// Returns the next offset that will be written.
    #[must_use]
    pub const fn next_offset(&self) -> Offset {
        self.next_offset
    }

    /// Returns the last offset in this segment, or `None` if empty.
    #[must_use]
    pub const fn last_offset(&self) -> Option<Offset> {
        if self.next_offset.get() > self.base_offset.get() {
            self.next_offset.prev()
        } else {
            None
        }
    }

    /// Returns the number of records in this segment.
    #[must_use]
    pub const fn record_count(&self) -> u64 {
        self.base_offset.distance_to(self.next_offset)
    }

    /// Returns true if the segment holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Returns the size of the stored frames in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns true once the segment is closed for appends.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the append time of the newest record.
    #[must_use]
    pub const fn last_append_at(&self) -> Option<Timestamp> {
        self.last_append_at
    }

    /// Returns the backing file path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Returns true if appending `incoming_bytes` at `now` should first roll
    /// this segment. Empty segments never roll.
    #[must_use]
    pub fn should_roll(&self, incoming_bytes: u64, now: Timestamp) -> bool {
        if self.is_empty() {
            return false;
        }
        let too_big = self.size_bytes() + incoming_bytes > self.config.max_size_bytes;
        let too_old = self
            .first_append_at
            .is_some_and(|first| now.millis_since(first) >= self.config.max_age_ms);
        too_big || too_old
    }

    /// Appends a record, assigning it the next offset.
    ///
    /// # Errors
    /// Returns `SegmentClosed` if the segment is closed, or `Io` if the frame
    /// could not be written to the backing file.
    pub fn append(&mut self, mut record: Record, now: Timestamp) -> PartitionResult<Offset> {
        record.offset = self.next_offset;
        self.write_frame(&record, now)?;
        Ok(record.offset)
    }

    /// Appends a record copied from another replica, keeping its offset.
    ///
    /// # Errors
    /// Returns `NonContiguousAppend` if the record's offset is not the next
    /// offset, plus the errors of [`Segment::append`].
    pub fn append_replicated(&mut self, record: &Record, now: Timestamp) -> PartitionResult<()> {
        if record.offset != self.next_offset {
            return Err(PartitionError::NonContiguousAppend {
                expected: self.next_offset,
                actual: record.offset,
            });
        }
        self.write_frame(record, now)
    }

    fn write_frame(&mut self, record: &Record, now: Timestamp) -> PartitionResult<()> {
        if self.closed {
            return Err(PartitionError::SegmentClosed {
                base_offset: self.base_offset,
            });
        }

        let frame = encode_frame(record);
        let position = self.data.len();

        if let Some(file) = &mut self.file {
            if let Err(err) = file.handle.write_all(&frame) {
                // Drop whatever part of the frame reached the file.
                if let Err(rollback) = file.handle.set_len(position as u64) {
                    warn!(path = %file.path.display(), error = %rollback, "Failed to roll back partial frame");
                }
                return Err(PartitionError::io("segment append", &err));
            }
        }

        self.track_index(record.offset, position, frame.len() as u64);
        self.data.extend_from_slice(&frame);
        self.next_offset = record.offset.next();
        self.first_append_at.get_or_insert(now);
        self.last_append_at = Some(now);

        // Postcondition: offsets are dense within the segment.
        debug_assert_eq!(
            self.base_offset.distance_to(self.next_offset),
            self.record_count()
        );
        Ok(())
    }

    fn track_index(&mut self, offset: Offset, position: usize, frame_len: u64) {
        if self.index.is_empty() || self.bytes_since_index >= self.config.index_interval_bytes {
            self.index.push(IndexEntry { offset, position });
            self.bytes_since_index = 0;
        }
        self.bytes_since_index += frame_len;
    }

    /// Finds the frame position to start scanning from for `offset`.
    fn find_position(&self, offset: Offset) -> usize {
        let idx = self.index.partition_point(|e| e.offset <= offset);
        if idx == 0 {
            0
        } else {
            self.index[idx - 1].position
        }
    }

    /// Reads records starting at `start`.
    ///
    /// Returns records in offset order until adding the next one would pass
    /// `max_bytes`. The first record is always returned, even if it alone is
    /// larger than `max_bytes`.
    ///
    /// # Errors
    /// Returns `OutOfRange` if `start` is before the base offset or after the
    /// last offset, and `Corrupt` if a frame fails its checksum.
    pub fn read(&self, start: Offset, max_bytes: u64) -> PartitionResult<Vec<Record>> {
        self.read_range(start, self.next_offset, max_bytes, true)
            .map(|(records, _)| records)
    }

    /// Reads records in `[start, end)` within a byte budget.
    ///
    /// Returns the records and the frame bytes they occupied.
    pub(crate) fn read_range(
        &self,
        start: Offset,
        end: Offset,
        max_bytes: u64,
        at_least_one: bool,
    ) -> PartitionResult<(Vec<Record>, u64)> {
        if start < self.base_offset || start >= self.next_offset {
            return Err(PartitionError::OutOfRange {
                offset: start,
                log_start: self.base_offset,
                log_end: self.next_offset,
            });
        }

        let mut position = self.find_position(start);
        let mut records = Vec::new();
        let mut used = 0u64;
        loop {
            match read_frame(&self.data, position) {
                Ok(None) => break,
                Ok(Some((record, next_position))) => {
                    let frame_len = (next_position - position) as u64;
                    position = next_position;
                    if record.offset < start {
                        continue;
                    }
                    if record.offset >= end {
                        break;
                    }
                    let first = records.is_empty() && at_least_one;
                    if !first && used + frame_len > max_bytes {
                        break;
                    }
                    used += frame_len;
                    records.push(record);
                }
                Err(err) => {
                    return Err(PartitionError::Corrupt {
                        base_offset: self.base_offset,
                        position: position as u64,
                        reason: err.reason().to_string(),
                    });
                }
            }
        }
        Ok((records, used))
    }

    /// Flushes the backing file to stable storage.
    ///
    /// # Errors
    /// Returns `Io` if the sync fails.
    pub fn sync(&self) -> PartitionResult<()> {
        if let Some(file) = &self.file {
            file.handle
                .sync_data()
                .map_err(|e| PartitionError::io("segment sync", &e))?;
        }
        Ok(())
    }

    /// Closes the segment for appends. Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns `Io` if the final sync fails; the segment stays open.
    pub fn close(&mut self) -> PartitionResult<()> {
        if self.closed {
            return Ok(());
        }
        self.sync()?;
        self.closed = true;
        debug!(
            base_offset = self.base_offset.get(),
            records = self.record_count(),
            bytes = self.size_bytes(),
            "Closed segment"
        );
        Ok(())
    }

    /// Removes every record at or after `from`, reopening the segment for
    /// appends.
    ///
    /// # Errors
    /// Returns `Io` if the backing file cannot be shortened.
    pub fn truncate(&mut self, from: Offset) -> PartitionResult<()> {
        if from >= self.next_offset {
            return Ok(());
        }

        let position = if from <= self.base_offset {
            0
        } else {
            self.frame_position(from)?
        };

        if let Some(file) = &mut self.file {
            file.handle
                .set_len(position as u64)
                .map_err(|e| PartitionError::io("segment truncate", &e))?;
        }

        self.data.truncate(position);
        self.index.retain(|e| e.offset < from);
        self.bytes_since_index = self
            .index
            .last()
            .map_or(0, |e| (position - e.position) as u64);
        self.next_offset = from.max(self.base_offset);
        self.closed = false;
        if self.is_empty() {
            self.first_append_at = None;
            self.last_append_at = None;
        }
        Ok(())
    }

    /// Byte position of the frame holding `offset`.
    fn frame_position(&self, offset: Offset) -> PartitionResult<usize> {
        let mut position = self.find_position(offset);
        loop {
            match read_frame(&self.data, position) {
                Ok(Some((record, _))) if record.offset >= offset => return Ok(position),
                Ok(Some((_, next_position))) => position = next_position,
                Ok(None) => return Ok(position),
                Err(err) => {
                    return Err(PartitionError::Corrupt {
                        base_offset: self.base_offset,
                        position: position as u64,
                        reason: err.reason().to_string(),
                    });
                }
            }
        }
    }

    /// Deletes the segment and its backing file.
    ///
    /// # Errors
    /// Returns `Io` if the file exists but cannot be removed.
    pub fn delete(self) -> PartitionResult<()> {
        if let Some(SegmentFile { path, handle }) = self.file {
            drop(handle);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PartitionError::io("segment delete", &e)),
            }
            debug!(path = %path.display(), "Deleted segment file");
        }
        Ok(())
    }
}
