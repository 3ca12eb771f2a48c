//! Kestrel Core - identifiers, records and limits shared by every Kestrel crate.
//!
//! # Contents
//!
//! - **Identifiers**: `NodeId` (broker), `PartitionId`, `TopicPartition`
//! - **Records**: `Record`, `Header`, `Offset`, `Timestamp` and the record codec
//! - **Limits**: explicit upper bounds for records, topics and requests

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod record;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use record::{Header, Offset, Record, RecordError, RecordPart, Timestamp};
pub use types::{NodeId, PartitionId, TopicPartition};
