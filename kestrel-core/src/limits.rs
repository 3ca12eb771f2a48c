//! System limits and configuration bounds.
//!
//! Every record, topic and fetch has an explicit maximum so that a single
//! request cannot grow broker memory without bound.

/// System-wide limits for Kestrel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Record limits.
    /// Maximum size of a record value in bytes.
    pub max_value_bytes: u32,
    /// Maximum size of a record key in bytes.
    pub max_key_bytes: u32,
    /// Maximum number of headers on a record. At most `u16::MAX`.
    pub max_headers: u32,
    /// Maximum size of one header value in bytes.
    pub max_header_value_bytes: u32,

    // Topic limits.
    /// Maximum number of partitions in a topic.
    pub max_partitions_per_topic: u32,
    /// Maximum replication factor of a topic.
    pub max_replication_factor: u32,
    /// Maximum length of a topic name.
    pub max_topic_name_len: u32,

    // Request limits.
    /// Maximum bytes returned by a single fetch.
    pub max_fetch_bytes: u32,
    /// Maximum records accepted by a single produce request.
    pub max_records_per_produce: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Records: 1MB value, 64KB key, 64 headers of up to 64KB.
            max_value_bytes: 1024 * 1024,
            max_key_bytes: 64 * 1024,
            max_headers: 64,
            max_header_value_bytes: 64 * 1024,

            // Topics: 1024 partitions, 7 replicas, 249-char names.
            max_partitions_per_topic: 1024,
            max_replication_factor: 7,
            max_topic_name_len: 249,

            // Requests: 50MB fetch, 10k records per produce.
            max_fetch_bytes: 50 * 1024 * 1024,
            max_records_per_produce: 10_000,
        }
    }

    /// Checks that the limits can be satisfied together.
    ///
    /// # Errors
    /// Returns `InvalidLimit` for the first unusable field.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |field, reason| Err(crate::Error::InvalidLimit { field, reason });

        let positive = [
            ("max_value_bytes", self.max_value_bytes),
            ("max_partitions_per_topic", self.max_partitions_per_topic),
            ("max_replication_factor", self.max_replication_factor),
            ("max_topic_name_len", self.max_topic_name_len),
            ("max_records_per_produce", self.max_records_per_produce),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return invalid(*field, "must be positive");
        }
        // The header count is written as a u16.
        if self.max_headers > u32::from(u16::MAX) {
            return invalid("max_headers", "must fit the u16 header count");
        }
        // One maximum-size record must fit in a fetch response.
        if self.max_fetch_bytes < self.max_value_bytes {
            return invalid("max_fetch_bytes", "must be at least max_value_bytes");
        }
        Ok(())
    }

    /// Checks a topic shape against the topic limits.
    ///
    /// # Errors
    /// Returns `TopicOutOfBounds` for the first quantity over its limit.
    pub fn check_topic(&self, name: &str, partitions: u32, replication_factor: u32) -> crate::Result<()> {
        let bounds = [
            ("name length", name.len() as u64, self.max_topic_name_len),
            ("partitions", u64::from(partitions), self.max_partitions_per_topic),
            ("replication factor", u64::from(replication_factor), self.max_replication_factor),
        ];
        match bounds.into_iter().find(|&(_, requested, max)| requested > u64::from(max)) {
            Some((quantity, requested, max)) => Err(crate::Error::TopicOutOfBounds {
                topic: name.to_string(),
                quantity,
                requested,
                max: u64::from(max),
            }),
            None => Ok(()),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
