//! Kestrel Partition - segmented partition logs and their replication.
//!
//! A partition is an append-only, totally ordered sequence of records. Every
//! replica of a partition keeps its own copy as a chain of segments; a
//! replication group keeps the copies in step and decides which records are
//! committed.
//!
//! # Layers
//!
//! - [`Segment`]: checksummed record frames with a sparse offset index,
//!   optionally mirrored to a file
//! - [`PartitionLog`]: a chain of segments with rolling, fetch isolation,
//!   truncation and retention
//! - [`ReplicationGroup`]: one log per replica, leader election, in-sync
//!   tracking and the high-water mark
//! - [`LeaderCheckpoint`]: the last leader and high-water mark of a
//!   file-backed group, read back on restart
//!
//! # Invariants
//!
//! - Offsets are dense: the log holds exactly `[log_start, log_end)`
//! - The high-water mark never decreases and never passes the log end
//! - Retention never deletes the active segment or uncommitted records
//! - Only in-sync replicas are elected leader

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checkpoint;
mod error;
mod log;
mod replica;
mod replication;
mod retention;
mod segment;

pub use checkpoint::{LeaderCheckpoint, CHECKPOINT_FILE_NAME};
pub use error::{PartitionError, PartitionResult, ReplicationError, ReplicationResult};
pub use log::{FetchIsolation, FetchResult, LogConfig, LogMetadata, LogStorage, PartitionLog};
pub use replica::ReplicaState;
pub use replication::{
    AckMode, AppendOutcome, HighWaterMarkPolicy, LeadershipChange, PartitionStatus, ReplicaFetch,
    ReplicationConfig, ReplicationGroup,
};
pub use retention::{RetentionOutcome, RetentionPolicy};
pub use segment::{segment_file_name, Segment, SegmentConfig};
