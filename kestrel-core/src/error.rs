//! Errors raised while checking limits.

use std::fmt;

/// Result alias for core checks.
pub type Result<T> = std::result::Result<T, Error>;

/// A limit was misconfigured or a topic shape falls outside the limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A `Limits` field has an unusable value.
    InvalidLimit {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A topic asks for more than the limits allow.
    TopicOutOfBounds {
        /// Topic name.
        topic: String,
        /// Which quantity is out of bounds (`"name length"`, `"partitions"`, ...).
        quantity: &'static str,
        /// Requested amount.
        requested: u64,
        /// Allowed maximum.
        max: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLimit { field, reason } => write!(f, "limit {field} {reason}"),
            Self::TopicOutOfBounds {
                topic,
                quantity,
                requested,
                max,
            } => write!(f, "topic {topic:?}: {quantity} {requested} exceeds limit {max}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_out_of_bounds_names_the_topic() {
        let err = Error::TopicOutOfBounds {
            topic: "orders".to_string(),
            quantity: "partitions",
            requested: 2048,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "topic \"orders\": partitions 2048 exceeds limit 1024"
        );
    }
}
