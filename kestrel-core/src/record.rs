//! Offsets, timestamps and records, plus the byte layout records take
//! inside segment frames.
//!
//! A record carries an optional key, a value and ordered headers. Its offset
//! is zero until the partition leader appends it, and fixed from then on.
//!
//! # Layout
//!
//! ```text
//! flags u8 | offset u64 | timestamp i64 | [key_len u32 | key] | value_len u32 | value
//!          | header_count u16 | (name_len u16 | name | value_len u32 | value)*
//! ```
//!
//! Bit 0 of `flags` marks a present key. Integers are big-endian.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::limits::Limits;

const FLAG_HAS_KEY: u8 = 0b0000_0001;

/// flags + offset + timestamp + value_len + header_count.
const FIXED_LEN: usize = 1 + 8 + 8 + 4 + 2;

/// Offset of a record within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// The first offset of every partition.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw position.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw position.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The offset right after this one.
    ///
    /// # Panics
    /// Panics if the offset space is exhausted.
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < u64::MAX, "offset overflow");
        Self(self.0 + 1)
    }

    /// Returns the offset `count` positions after this one.
    #[must_use]
    pub const fn add(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Returns the previous offset, or `None` at offset zero.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns the number of offsets in `[self, end)`.
    #[must_use]
    pub const fn distance_to(self, end: Self) -> u64 {
        end.0.saturating_sub(self.0)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Record timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Wraps epoch milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Epoch milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Wall-clock now. A clock before the epoch reads as zero.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        Self(millis)
    }

    /// Milliseconds elapsed from `earlier` to `self` (zero if `earlier` is later).
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // Checked non-negative.
    pub const fn millis_since(self, earlier: Self) -> u64 {
        let diff = self.0 - earlier.0;
        if diff < 0 {
            0
        } else {
            diff as u64
        }
    }
}

/// Named opaque metadata attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// UTF-8 name; duplicates are allowed and order is kept.
    pub name: String,
    /// Raw value.
    pub value: Bytes,
}

impl Header {
    /// Builds a header.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        2 + self.name.len() + 4 + self.value.len()
    }
}

/// A single record in a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Position in the partition, assigned on append.
    pub offset: Offset,
    /// Producer or append time.
    pub timestamp: Timestamp,
    /// Partitioning key.
    pub key: Option<Bytes>,
    /// Payload.
    pub value: Bytes,
    /// Ordered headers.
    pub headers: Vec<Header>,
}

impl Record {
    /// An unkeyed record stamped with the current time.
    #[must_use]
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            offset: Offset::ZERO,
            timestamp: Timestamp::now(),
            key: None,
            value: value.into(),
            headers: Vec::new(),
        }
    }

    /// A keyed record stamped with the current time.
    #[must_use]
    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        let mut record = Self::new(value);
        record.key = Some(key.into());
        record
    }

    /// Replaces the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds a header after the existing ones.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Bytes [`Record::encode`] will write.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_LEN
            + self.key.as_ref().map_or(0, |key| 4 + key.len())
            + self.value.len()
            + self.headers.iter().map(Header::encoded_len).sum::<usize>()
    }

    /// Checks key, value and header sizes against `limits`.
    ///
    /// # Errors
    /// Returns the first [`RecordError`] found, checking the key, then the
    /// value, then the header count, then each header in order.
    pub fn validate(&self, limits: &Limits) -> Result<(), RecordError> {
        let key_len = self.key.as_ref().map_or(0, Bytes::len);
        let checks = [
            (RecordPart::Key, key_len, limits.max_key_bytes),
            (RecordPart::Value, self.value.len(), limits.max_value_bytes),
            (RecordPart::Headers, self.headers.len(), limits.max_headers),
        ];
        for (part, actual, max) in checks {
            let max = max as usize;
            if actual > max {
                return Err(RecordError { part, actual, max });
            }
        }
        // Names have a u16 length prefix.
        let max_name = usize::from(u16::MAX);
        let max_value = limits.max_header_value_bytes as usize;
        for header in &self.headers {
            if header.name.len() > max_name {
                return Err(RecordError {
                    part: RecordPart::HeaderName,
                    actual: header.name.len(),
                    max: max_name,
                });
            }
            if header.value.len() > max_value {
                return Err(RecordError {
                    part: RecordPart::HeaderValue,
                    actual: header.value.len(),
                    max: max_value,
                });
            }
        }
        Ok(())
    }

    /// Appends the record to `buf`.
    ///
    /// Lengths are written as `u32`/`u16`; callers validate against
    /// [`Limits`] first, which keeps every length within its prefix.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(if self.key.is_some() { FLAG_HAS_KEY } else { 0 });
        buf.put_u64(self.offset.get());
        buf.put_i64(self.timestamp.as_millis());
        if let Some(key) = &self.key {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key);
        }
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(&self.value);
        buf.put_u16(self.headers.len() as u16);
        for header in &self.headers {
            buf.put_u16(header.name.len() as u16);
            buf.put_slice(header.name.as_bytes());
            buf.put_u32(header.value.len() as u32);
            buf.put_slice(&header.value);
        }
    }

    /// Reads one record from the front of `buf`.
    ///
    /// Returns `None` on truncated input, unknown flag bits or a header name
    /// that is not UTF-8.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 + 8 + 8 {
            return None;
        }
        let flags = buf.get_u8();
        if flags & !FLAG_HAS_KEY != 0 {
            return None;
        }
        let offset = Offset::new(buf.get_u64());
        let timestamp = Timestamp::from_millis(buf.get_i64());
        let key = if flags & FLAG_HAS_KEY == 0 {
            None
        } else {
            Some(take_prefixed_u32(buf)?)
        };
        let value = take_prefixed_u32(buf)?;

        if buf.remaining() < 2 {
            return None;
        }
        let count = buf.get_u16();
        let mut headers = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            if buf.remaining() < 2 {
                return None;
            }
            let name_len = usize::from(buf.get_u16());
            if buf.remaining() < name_len {
                return None;
            }
            let name = String::from_utf8(buf.copy_to_bytes(name_len).to_vec()).ok()?;
            headers.push(Header {
                name,
                value: take_prefixed_u32(buf)?,
            });
        }

        Some(Self {
            offset,
            timestamp,
            key,
            value,
            headers,
        })
    }
}

fn take_prefixed_u32(buf: &mut impl Buf) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    (buf.remaining() >= len).then(|| buf.copy_to_bytes(len))
}

/// The part of a record that broke a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPart {
    /// Key bytes.
    Key,
    /// Value bytes.
    Value,
    /// Header count.
    Headers,
    /// Bytes of one header name.
    HeaderName,
    /// Bytes of one header value.
    HeaderValue,
}

impl std::fmt::Display for RecordPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Key => "key bytes",
            Self::Value => "value bytes",
            Self::Headers => "header count",
            Self::HeaderName => "header name bytes",
            Self::HeaderValue => "header value bytes",
        })
    }
}

/// A record over one of its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordError {
    /// What was too big.
    pub part: RecordPart,
    /// Measured size or count.
    pub actual: usize,
    /// Allowed maximum.
    pub max: usize,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "record {} {} over limit {}", self.part, self.actual, self.max)
    }
}

impl std::error::Error for RecordError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_codec_keeps_header_order() {
        let original = Record::with_key("customer-17", "created")
            .with_timestamp(Timestamp::from_millis(1_700_000_000_000))
            .with_header("trace-id", "abc")
            .with_header("trace-id", "def");

        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(buf.len(), original.encoded_len());

        let decoded = Record::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.headers[1].value, Bytes::from("def"));
    }

    #[test]
    fn test_record_codec_absent_key_is_not_empty_key() {
        let mut buf = BytesMut::new();
        Record::new("v").encode(&mut buf);
        Record::with_key("", "v").encode(&mut buf);

        let mut bytes = buf.freeze();
        assert_eq!(Record::decode(&mut bytes).unwrap().key, None);
        assert_eq!(Record::decode(&mut bytes).unwrap().key, Some(Bytes::new()));
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_record_decode_rejects_truncation_and_bad_flags() {
        let mut buf = BytesMut::new();
        Record::new("payload").with_header("h", "v").encode(&mut buf);
        let mut truncated = buf.clone();
        truncated.truncate(buf.len() - 1);
        assert!(Record::decode(&mut truncated.freeze()).is_none());

        buf[0] = 0x80;
        assert!(Record::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn test_record_validate_reports_part() {
        let limits = Limits {
            max_value_bytes: 4,
            ..Limits::new()
        };
        let err = Record::new("too long").validate(&limits).unwrap_err();
        assert_eq!(
            err,
            RecordError {
                part: RecordPart::Value,
                actual: 8,
                max: 4
            }
        );
        assert_eq!(err.to_string(), "record value bytes 8 over limit 4");
        assert!(Record::new("ok").validate(&limits).is_ok());
    }

    #[test]
    fn test_record_validate_bounds_each_header() {
        let limits = Limits {
            max_header_value_bytes: 8,
            ..Limits::new()
        };
        let record = Record::new("v")
            .with_header("small", "ok")
            .with_header("big", vec![0u8; 9]);
        assert_eq!(
            record.validate(&limits),
            Err(RecordError {
                part: RecordPart::HeaderValue,
                actual: 9,
                max: 8
            })
        );

        let long_name = "n".repeat(usize::from(u16::MAX) + 1);
        let err = Record::new("v").with_header(long_name, "x").validate(&limits).unwrap_err();
        assert_eq!(err.part, RecordPart::HeaderName);
        assert!(Record::new("v").with_header("small", "12345678").validate(&limits).is_ok());
    }

    #[test]
    fn test_offset_arithmetic() {
        let offset = Offset::new(42);
        assert_eq!(offset.next(), Offset::new(43));
        assert_eq!(offset.add(8), Offset::new(50));
        assert_eq!(Offset::ZERO.prev(), None);
        assert_eq!(offset.distance_to(Offset::new(50)), 8);
        assert_eq!(Offset::new(50).distance_to(offset), 0);
    }

    #[test]
    fn test_timestamp_millis_since() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(1_250);
        assert_eq!(b.millis_since(a), 250);
        assert_eq!(a.millis_since(b), 0);
    }
}
