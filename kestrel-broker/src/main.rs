//! Kestrel broker binary.
//!
//! Hosts a cluster of brokers in one process, pre-creates topics and runs
//! replication, retention and session expiry until interrupted.
//!
//! ```bash
//! kestrel-broker --brokers 3 --data-dir /var/lib/kestrel \
//!     --topic orders:3:3 --topic audit:1:2 \
//!     --segment-bytes 1073741824 --retention-ms 604800000
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use clap::Parser;
use kestrel_broker::{BrokerError, Cluster, ClusterConfig};
use kestrel_partition::{LogConfig, RetentionPolicy, SegmentConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Kestrel partitioned log broker.
#[derive(Parser, Debug)]
#[command(name = "kestrel-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of brokers to host (ids 1..=N).
    #[arg(long, default_value = "3")]
    brokers: u64,

    /// Data directory for segments and committed offsets.
    /// If not specified, uses in-memory storage.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Topic to create at startup in format `name:partitions:replication`.
    /// Can be specified multiple times.
    #[arg(long = "topic", value_parser = parse_topic)]
    topics: Vec<TopicSpec>,

    /// Roll segments after this many bytes.
    #[arg(long, default_value = "1073741824")]
    segment_bytes: u64,

    /// Delete segments older than this many milliseconds.
    #[arg(long, default_value = "604800000")]
    retention_ms: u64,

    /// Keep at most this many bytes per partition.
    #[arg(long)]
    retention_bytes: Option<u64>,

    /// Produce acknowledgment timeout in milliseconds.
    #[arg(long, default_value = "30000")]
    ack_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Topic specification for pre-creation.
#[derive(Debug, Clone)]
struct TopicSpec {
    /// Topic name.
    name: String,
    /// Number of partitions.
    partitions: u32,
    /// Replication factor.
    replication_factor: u32,
}

/// Parses a topic specification in format `name:partitions:replication`.
fn parse_topic(s: &str) -> Result<TopicSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(format!(
            "invalid topic format '{s}', expected 'name:partitions:replication'"
        ));
    }

    let name = parts[0].to_string();
    if name.is_empty() {
        return Err("topic name cannot be empty".to_string());
    }

    let partitions: u32 = parts[1]
        .parse()
        .map_err(|_| format!("invalid partition count '{}' in topic '{s}'", parts[1]))?;
    let replication_factor: u32 = parts[2]
        .parse()
        .map_err(|_| format!("invalid replication factor '{}' in topic '{s}'", parts[2]))?;

    Ok(TopicSpec {
        name,
        partitions,
        replication_factor,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Log to stderr; stdout is left to callers.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut retention = RetentionPolicy::unlimited().with_max_age_ms(args.retention_ms);
    if let Some(bytes) = args.retention_bytes {
        retention = retention.with_max_bytes(bytes);
    }
    let log = LogConfig::default()
        .with_segment(SegmentConfig::default().with_max_size_bytes(args.segment_bytes))
        .with_retention(retention);

    let mut config = ClusterConfig::with_broker_count(args.brokers)
        .with_log(log)
        .with_ack_timeout_ms(args.ack_timeout_ms);
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir);
    }

    info!(
        brokers = args.brokers,
        data_dir = ?args.data_dir,
        topics = args.topics.len(),
        "Starting Kestrel"
    );
    let cluster = Cluster::start(config).await?;

    for topic in &args.topics {
        match cluster
            .create_topic(&topic.name, topic.partitions, topic.replication_factor, retention)
            .await
        {
            Ok(description) => {
                info!(
                    topic = %topic.name,
                    partitions = description.partitions.len(),
                    replication_factor = topic.replication_factor,
                    "Pre-created topic"
                );
            }
            Err(BrokerError::TopicAlreadyExists { .. }) => {
                info!(topic = %topic.name, "Topic already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cluster.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic() {
        let spec = parse_topic("orders:3:2").unwrap();
        assert_eq!(spec.name, "orders");
        assert_eq!(spec.partitions, 3);
        assert_eq!(spec.replication_factor, 2);

        assert!(parse_topic("orders:3").is_err());
        assert!(parse_topic(":3:1").is_err());
        assert!(parse_topic("orders:x:1").is_err());
    }
}
