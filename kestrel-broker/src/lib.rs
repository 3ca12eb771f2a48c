//! Kestrel broker: topic routing and the produce, fetch, admin and group APIs
//! over replicated partitions.
//!
//! A [`Cluster`] hosts every broker in one process. It owns the topic table,
//! broker availability and the consumer group coordinator, and is set up with
//! [`Cluster::open`] or [`Cluster::start`] and torn down with
//! [`Cluster::shutdown`]. A [`Broker`] handle serves produce and fetch
//! requests for the partitions that broker leads.
//!
//! # Example
//!
//! ```ignore
//! let cluster = Cluster::start(ClusterConfig::with_broker_count(3)).await?;
//! cluster.create_topic("orders", 3, 3, RetentionPolicy::default()).await?;
//!
//! let broker = cluster.broker(NodeId::new(1)).await?;
//! let produced = broker.produce("orders", Some(PartitionId::new(0)), record, AckMode::All).await?;
//! let fetched = broker.fetch("orders", PartitionId::new(0), Offset::ZERO, 1 << 20).await?;
//!
//! cluster.shutdown().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod cluster;
mod config;
mod error;
mod partitioner;
mod tasks;
mod topic;

pub use broker::{Broker, OffsetSpec, ProduceResponse};
pub use cluster::{Cluster, ClusterCoordinator, OFFSETS_DIR, OFFSETS_FILE};
pub use config::ClusterConfig;
pub use error::{BrokerError, BrokerResult};
pub use partitioner::Partitioner;
pub use tasks::BackgroundTasks;
pub use topic::{
    place_replicas, validate_topic, PartitionHandle, Topic, TopicDescription,
    INTERNAL_TOPIC_PREFIX,
};
