//! Committed offset storage.
//!
//! Provides the `OffsetStore` trait, an in-memory store for tests and a
//! file-backed store that survives restarts independently of partition logs.
//!
//! # Snapshot format
//!
//! `FileOffsetStore` rewrites the whole table on every change:
//!
//! ```text
//! magic "KOFS" | version u16 | count u32 | entries... | crc32 u32
//! entry: group_len u16 | group | topic_len u16 | topic | partition u64 | offset u64
//! ```
//!
//! The snapshot is written to a temporary file, synced and renamed over the
//! previous one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use kestrel_core::{Offset, PartitionId, TopicPartition};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GroupError, GroupResult};
use crate::types::{CommittedOffset, GroupId};

type OffsetTable = BTreeMap<(GroupId, TopicPartition), Offset>;

// -----------------------------------------------------------------------------
// Offset Store Trait
// -----------------------------------------------------------------------------

/// Durable storage for committed offsets.
///
/// Implementations must make a successful `save` visible to a later `load`,
/// including after a process restart for durable stores.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Loads every committed offset.
    async fn load(&self) -> GroupResult<Vec<CommittedOffset>>;

    /// Stores an offset, replacing any previous value.
    async fn save(&self, group: &GroupId, topic_partition: &TopicPartition, offset: Offset) -> GroupResult<()>;

    /// Removes all offsets of a group. No-op if none exist.
    async fn remove_group(&self, group: &GroupId) -> GroupResult<()>;

    /// Removes all offsets for a topic across groups. No-op if none exist.
    async fn remove_topic(&self, topic: &str) -> GroupResult<()>;
}

#[async_trait]
impl<T: OffsetStore + ?Sized> OffsetStore for Box<T> {
    async fn load(&self) -> GroupResult<Vec<CommittedOffset>> {
        (**self).load().await
    }

    async fn save(&self, group: &GroupId, topic_partition: &TopicPartition, offset: Offset) -> GroupResult<()> {
        (**self).save(group, topic_partition, offset).await
    }

    async fn remove_group(&self, group: &GroupId) -> GroupResult<()> {
        (**self).remove_group(group).await
    }

    async fn remove_topic(&self, topic: &str) -> GroupResult<()> {
        (**self).remove_topic(topic).await
    }
}

fn to_committed(table: &OffsetTable) -> Vec<CommittedOffset> {
    table
        .iter()
        .map(|((group, tp), offset)| CommittedOffset {
            group: group.clone(),
            topic_partition: tp.clone(),
            offset: *offset,
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Memory Store
// -----------------------------------------------------------------------------

/// In-memory offset store.
///
/// Supports one-shot save failures for exercising error paths.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<OffsetTable>,
    fail_next_save: AtomicBool,
}

impl MemoryOffsetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `save` fail with an I/O error.
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    /// Returns the stored offset for a group and partition.
    pub async fn get(&self, group: &GroupId, topic_partition: &TopicPartition) -> Option<Offset> {
        self.offsets
            .lock()
            .await
            .get(&(group.clone(), topic_partition.clone()))
            .copied()
    }

    /// Returns the number of stored offsets.
    pub async fn len(&self) -> usize {
        self.offsets.lock().await.len()
    }

    /// Returns true if no offsets are stored.
    pub async fn is_empty(&self) -> bool {
        self.offsets.lock().await.is_empty()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self) -> GroupResult<Vec<CommittedOffset>> {
        Ok(to_committed(&*self.offsets.lock().await))
    }

    async fn save(&self, group: &GroupId, topic_partition: &TopicPartition, offset: Offset) -> GroupResult<()> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(GroupError::Io {
                operation: "save",
                message: "simulated failure (forced)".into(),
            });
        }
        self.offsets
            .lock()
            .await
            .insert((group.clone(), topic_partition.clone()), offset);
        Ok(())
    }

    async fn remove_group(&self, group: &GroupId) -> GroupResult<()> {
        self.offsets.lock().await.retain(|(g, _), _| g != group);
        Ok(())
    }

    async fn remove_topic(&self, topic: &str) -> GroupResult<()> {
        self.offsets.lock().await.retain(|(_, tp), _| &*tp.topic != topic);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// File Store
// -----------------------------------------------------------------------------

const SNAPSHOT_MAGIC: &[u8; 4] = b"KOFS";
const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_HEADER_BYTES: usize = 4 + 2 + 4;
const SNAPSHOT_CRC_BYTES: usize = 4;

/// File-backed offset store.
///
/// Keeps the table in memory and rewrites the snapshot file on every
/// mutation. A mutation is applied in memory only after its snapshot is
/// durable.
#[derive(Debug)]
pub struct FileOffsetStore {
    path: PathBuf,
    offsets: Mutex<OffsetTable>,
}

impl FileOffsetStore {
    /// Opens the store at `path`, loading the snapshot if one exists.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read or its directory created, and
    /// `Corrupt` if the snapshot fails validation.
    pub async fn open(path: impl AsRef<Path>) -> GroupResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GroupError::io("create offset store directory", &e))?;
        }

        let offsets = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_snapshot(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OffsetTable::new(),
            Err(e) => return Err(GroupError::io("read offset snapshot", &e)),
        };

        info!(path = %path.display(), offsets = offsets.len(), "Opened offset store");
        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &OffsetTable) -> GroupResult<()> {
        let bytes = encode_snapshot(table)?;
        let tmp = self.path.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| GroupError::io("create offset snapshot", &e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| GroupError::io("write offset snapshot", &e))?;
        file.sync_all()
            .await
            .map_err(|e| GroupError::io("sync offset snapshot", &e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| GroupError::io("rename offset snapshot", &e))?;
        debug!(path = %self.path.display(), offsets = table.len(), "Persisted offset snapshot");
        Ok(())
    }

    async fn update(&self, mutate: impl FnOnce(&mut OffsetTable) + Send) -> GroupResult<()> {
        let mut offsets = self.offsets.lock().await;
        let mut next = offsets.clone();
        mutate(&mut next);
        if next == *offsets {
            return Ok(());
        }
        self.persist(&next).await?;
        *offsets = next;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self) -> GroupResult<Vec<CommittedOffset>> {
        Ok(to_committed(&*self.offsets.lock().await))
    }

    async fn save(&self, group: &GroupId, topic_partition: &TopicPartition, offset: Offset) -> GroupResult<()> {
        let key = (group.clone(), topic_partition.clone());
        self.update(move |table| {
            table.insert(key, offset);
        })
        .await
    }

    async fn remove_group(&self, group: &GroupId) -> GroupResult<()> {
        let group = group.clone();
        self.update(move |table| table.retain(|(g, _), _| *g != group))
            .await
    }

    async fn remove_topic(&self, topic: &str) -> GroupResult<()> {
        let topic = topic.to_string();
        self.update(move |table| table.retain(|(_, tp), _| *tp.topic != *topic))
            .await
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> GroupResult<()> {
    let len = u16::try_from(name.len()).map_err(|_| GroupError::InvalidName {
        name: name.to_string(),
        reason: "name exceeds snapshot limit",
    })?;
    buf.put_u16(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn encode_snapshot(table: &OffsetTable) -> GroupResult<BytesMut> {
    let count = u32::try_from(table.len()).map_err(|_| GroupError::Corrupt {
        reason: "offset table too large".to_string(),
    })?;

    let mut buf = BytesMut::new();
    buf.put_slice(SNAPSHOT_MAGIC);
    buf.put_u16(SNAPSHOT_VERSION);
    buf.put_u32(count);
    for ((group, tp), offset) in table {
        put_name(&mut buf, group.as_str())?;
        put_name(&mut buf, &tp.topic)?;
        buf.put_u64(tp.partition.get());
        buf.put_u64(offset.get());
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);
    Ok(buf)
}

fn corrupt(reason: impl Into<String>) -> GroupError {
    GroupError::Corrupt {
        reason: reason.into(),
    }
}

fn take_name(buf: &mut &[u8]) -> GroupResult<Arc<str>> {
    if buf.remaining() < 2 {
        return Err(corrupt("truncated name length"));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(corrupt("truncated name"));
    }
    let name = std::str::from_utf8(&buf[..len]).map_err(|_| corrupt("name is not utf-8"))?;
    let name = Arc::from(name);
    buf.advance(len);
    Ok(name)
}

fn decode_snapshot(bytes: &[u8]) -> GroupResult<OffsetTable> {
    if bytes.len() < SNAPSHOT_HEADER_BYTES + SNAPSHOT_CRC_BYTES {
        return Err(corrupt("snapshot shorter than header"));
    }
    let (body, mut trailer) = bytes.split_at(bytes.len() - SNAPSHOT_CRC_BYTES);
    let expected = trailer.get_u32();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(corrupt(format!(
            "checksum mismatch (expected {expected:#010x}, got {actual:#010x})"
        )));
    }

    let mut buf = body;
    if &buf[..4] != SNAPSHOT_MAGIC {
        return Err(corrupt("bad magic"));
    }
    buf.advance(4);
    let version = buf.get_u16();
    if version != SNAPSHOT_VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }
    let count = buf.get_u32();

    let mut table = OffsetTable::new();
    for _ in 0..count {
        let group = GroupId::new(take_name(&mut buf)?);
        let topic = take_name(&mut buf)?;
        if buf.remaining() < 16 {
            return Err(corrupt("truncated entry"));
        }
        let partition = PartitionId::new(buf.get_u64());
        let offset = Offset::new(buf.get_u64());
        table.insert((group, TopicPartition::new(topic, partition)), offset);
    }
    if buf.has_remaining() {
        return Err(corrupt("trailing bytes after entries"));
    }
    Ok(table)
}
