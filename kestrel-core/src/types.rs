//! Strongly-typed identifiers for Kestrel entities.
//!
//! Explicit types keep broker ids and partition indexes from being mixed up.

use std::fmt;
use std::sync::Arc;

/// Declares a `u64` newtype id that prints as `<label>-<n>`.
macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident => $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw id.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw id.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "-{}"), self.0)
            }
        }

        // Same text as Display.
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

numeric_id! {
    /// A broker in the cluster.
    NodeId => "broker"
}

numeric_id! {
    /// Zero-based partition index within a topic, fixed when the topic is created.
    PartitionId => "partition"
}

impl PartitionId {
    /// Returns the partition index as a `usize` for slice indexing.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Partition counts are bounded by `Limits`.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A (topic, partition) pair.
///
/// Topic names are shared (`Arc<str>`) since the same name is carried by every
/// request, committed offset and assignment that touches the topic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: Arc<str>,
    /// Partition index within the topic.
    pub partition: PartitionId,
}

impl TopicPartition {
    /// Creates a new topic-partition pair.
    #[must_use]
    pub fn new(topic: impl Into<Arc<str>>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Debug for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition.get())
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_print_with_label() {
        assert_eq!(NodeId::new(42).to_string(), "broker-42");
        assert_eq!(format!("{:?}", PartitionId::new(3)), "partition-3");
    }

    #[test]
    fn test_ids_order_numerically() {
        let mut nodes = vec![NodeId::new(10), NodeId::new(2), NodeId::from(7)];
        nodes.sort();
        assert_eq!(nodes, vec![NodeId::new(2), NodeId::new(7), NodeId::new(10)]);
        assert_eq!(PartitionId::new(7).index(), 7);
    }

    #[test]
    fn test_topic_partition_ordering() {
        let a = TopicPartition::new("orders", PartitionId::new(1));
        let b = TopicPartition::new("orders", PartitionId::new(2));
        let c = TopicPartition::new("billing", PartitionId::new(9));

        let mut all = vec![b.clone(), a.clone(), c.clone()];
        all.sort();
        assert_eq!(all, vec![c, a, b]);
    }

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("orders", PartitionId::new(2));
        assert_eq!(tp.to_string(), "orders-2");
        assert_eq!(format!("{tp:?}"), "orders/2");
    }
}
