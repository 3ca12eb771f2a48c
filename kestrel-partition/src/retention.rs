//! Retention policy and segment selection.
//!
//! Retention removes whole closed segments from the head of a log, oldest
//! first. Selection stops at the first segment that must stay, so the
//! retained log is always a contiguous suffix.

use kestrel_core::{Offset, Timestamp};

/// Limits on how much of a partition log is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Delete segments whose newest record was appended longer ago than this.
    pub max_age_ms: Option<u64>,
    /// Delete oldest segments while the log exceeds this many bytes.
    pub max_bytes: Option<u64>,
}

impl RetentionPolicy {
    /// A policy that retains everything.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_age_ms: None,
            max_bytes: None,
        }
    }

    /// Sets the age limit.
    #[must_use]
    pub const fn with_max_age_ms(mut self, ms: u64) -> Self {
        self.max_age_ms = Some(ms);
        self
    }

    /// Sets the size limit.
    #[must_use]
    pub const fn with_max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    /// Returns true if no limit is set.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_age_ms.is_none() && self.max_bytes.is_none()
    }
}

impl Default for RetentionPolicy {
    /// Seven days, unbounded size.
    fn default() -> Self {
        Self::unlimited().with_max_age_ms(7 * 24 * 60 * 60 * 1000)
    }
}

/// What retention needs to know about a closed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// First offset in the segment.
    pub base_offset: Offset,
    /// Offset after the segment's last record.
    pub next_offset: Offset,
    /// Stored size.
    pub size_bytes: u64,
    /// Append time of the newest record.
    pub last_append_at: Option<Timestamp>,
}

/// Result of a retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Base offsets of the deleted segments, oldest first.
    pub deleted_segments: Vec<Offset>,
    /// Bytes reclaimed.
    pub deleted_bytes: u64,
    /// First retained offset after the sweep.
    pub log_start_offset: Offset,
}

impl RetentionOutcome {
    /// Returns true if the sweep deleted anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted_segments.is_empty()
    }
}

/// Selects which closed segments to delete, oldest first.
///
/// `closed` must be ordered by base offset. `total_bytes` is the size of the
/// whole log including the active segment. A segment holding any offset at
/// or above `high_water_mark` is never selected.
#[must_use]
pub fn select_expired(
    closed: &[SegmentSummary],
    total_bytes: u64,
    high_water_mark: Offset,
    policy: &RetentionPolicy,
    now: Timestamp,
) -> Vec<Offset> {
    let mut remaining = total_bytes;
    let mut selected = Vec::new();

    for segment in closed {
        // Unreplicated records are never removed.
        if segment.next_offset > high_water_mark {
            break;
        }

        let expired_by_age = match (policy.max_age_ms, segment.last_append_at) {
            (Some(max_age), Some(last)) => now.millis_since(last) > max_age,
            _ => false,
        };
        let over_size = policy.max_bytes.is_some_and(|max| remaining > max);

        if !(expired_by_age || over_size) {
            break;
        }
        remaining = remaining.saturating_sub(segment.size_bytes);
        selected.push(segment.base_offset);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(base: u64, next: u64, size: u64, appended_at: i64) -> SegmentSummary {
        SegmentSummary {
            base_offset: Offset::new(base),
            next_offset: Offset::new(next),
            size_bytes: size,
            last_append_at: Some(Timestamp::from_millis(appended_at)),
        }
    }

    #[test]
    fn test_select_by_size_keeps_newest() {
        let closed = [
            summary(0, 10, 400, 0),
            summary(10, 20, 400, 0),
            summary(20, 30, 400, 0),
        ];
        // 1200 closed + 100 active; limit 600 drops the first two.
        let policy = RetentionPolicy::unlimited().with_max_bytes(600);
        let selected = select_expired(&closed, 1300, Offset::new(30), &policy, Timestamp::from_millis(0));
        assert_eq!(selected, vec![Offset::new(0), Offset::new(10)]);
    }

    #[test]
    fn test_select_by_age() {
        let closed = [summary(0, 10, 10, 1_000), summary(10, 20, 10, 5_000)];
        let policy = RetentionPolicy::unlimited().with_max_age_ms(2_000);
        let selected = select_expired(&closed, 20, Offset::new(20), &policy, Timestamp::from_millis(4_000));
        assert_eq!(selected, vec![Offset::new(0)]);
    }

    #[test]
    fn test_select_never_passes_high_water_mark() {
        let closed = [summary(0, 10, 500, 0), summary(10, 20, 500, 0)];
        let policy = RetentionPolicy::unlimited().with_max_bytes(1);
        let selected = select_expired(&closed, 1000, Offset::new(15), &policy, Timestamp::from_millis(0));
        assert_eq!(selected, vec![Offset::new(0)]);
    }

    #[test]
    fn test_select_unlimited_keeps_all() {
        let closed = [summary(0, 10, 500, 0)];
        let policy = RetentionPolicy::unlimited();
        assert!(policy.is_unlimited());
        let selected = select_expired(&closed, 500, Offset::new(10), &policy, Timestamp::from_millis(i64::MAX));
        assert!(selected.is_empty());
    }
}
