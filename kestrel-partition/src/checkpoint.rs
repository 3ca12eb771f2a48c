//! Leader checkpoint for a file-backed replication group.
//!
//! Records which replica last led the partition, its epoch and the last
//! known high-water mark. Written on every election and flush so a restarted
//! group resumes from the log that holds every committed record.

use std::fs;
use std::io::Write;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use kestrel_core::{NodeId, Offset};

use crate::error::{PartitionError, PartitionResult};

/// File name of the checkpoint inside the partition directory.
pub const CHECKPOINT_FILE_NAME: &str = "leader.checkpoint";

const MAGIC: &[u8; 4] = b"KLCP";
const VERSION: u16 = 1;
// magic + version + leader + epoch + hwm + crc
const ENCODED_BYTES: usize = 4 + 2 + 8 + 8 + 8 + 4;

/// Leadership and commit state that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderCheckpoint {
    /// Most recently elected leader.
    pub leader: NodeId,
    /// Its leader epoch.
    pub leader_epoch: u64,
    /// High-water mark at the time of writing. Never ahead of the real mark.
    pub high_water_mark: Offset,
}

impl LeaderCheckpoint {
    /// Reads the checkpoint at `path`. Returns `None` if the file is absent.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read and `CorruptCheckpoint` if it
    /// fails validation.
    pub fn read(path: &Path) -> PartitionResult<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PartitionError::io("checkpoint read", &e)),
        };
        Self::decode(&bytes).map(Some)
    }

    /// Writes the checkpoint to `path` through a temporary file and rename.
    ///
    /// # Errors
    /// Returns `Io` if any file operation fails.
    pub fn write(&self, path: &Path) -> PartitionResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PartitionError::io("checkpoint create dir", &e))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file =
            fs::File::create(&tmp).map_err(|e| PartitionError::io("checkpoint create", &e))?;
        file.write_all(&self.encode())
            .map_err(|e| PartitionError::io("checkpoint write", &e))?;
        file.sync_all()
            .map_err(|e| PartitionError::io("checkpoint sync", &e))?;
        drop(file);
        fs::rename(&tmp, path).map_err(|e| PartitionError::io("checkpoint rename", &e))
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ENCODED_BYTES);
        buf.put_slice(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u64(self.leader.get());
        buf.put_u64(self.leader_epoch);
        buf.put_u64(self.high_water_mark.get());
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    fn decode(bytes: &[u8]) -> PartitionResult<Self> {
        if bytes.len() != ENCODED_BYTES {
            return Err(corrupt(format!("expected {ENCODED_BYTES} bytes, found {}", bytes.len())));
        }
        let (body, mut trailer) = bytes.split_at(ENCODED_BYTES - 4);
        if crc32fast::hash(body) != trailer.get_u32() {
            return Err(corrupt("checksum mismatch"));
        }

        let mut buf = body;
        if &buf[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        buf.advance(4);
        let version = buf.get_u16();
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        Ok(Self {
            leader: NodeId::new(buf.get_u64()),
            leader_epoch: buf.get_u64(),
            high_water_mark: Offset::new(buf.get_u64()),
        })
    }
}

fn corrupt(reason: impl Into<String>) -> PartitionError {
    PartitionError::CorruptCheckpoint {
        reason: reason.into(),
    }
}
