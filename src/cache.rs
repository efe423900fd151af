//! Resumable cache stream.
//!
//! A cache is an ordered, append-only sequence of [`CacheRecord`]s: opaque
//! payloads (the raw bytes of one network call) interleaved with checkpoint
//! markers that delimit multi-step items. A later run can replay the stream
//! with [`CacheReplay`] and reassemble exactly the same items without
//! touching the network.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/
//!   items/cache.jsonl      # live stream, one JSON record per line
//!   recovery/cache.jsonl   # last backup, restored by `recover()`
//! ```
//!
//! Each line carries an explicit `type` discriminant, so a payload that
//! happens to look like a marker can never be mistaken for one.

use std::collections::{BTreeSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{HarvestError, Result};

const ITEMS_DIR: &str = "items";
const RECOVERY_DIR: &str = "recovery";
const STREAM_FILE: &str = "cache.jsonl";

/// Structural marker kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// All dependent lookups of the current item have been written.
    EndOfItem,
    /// The current batch (page) of primary records is complete.
    EndOfBatch,
}

/// One entry of the cache stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheRecord {
    Payload {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Checkpoint { kind: CheckpointKind },
}

impl CacheRecord {
    pub fn payload(data: impl Into<Vec<u8>>) -> Self {
        CacheRecord::Payload { data: data.into() }
    }

    pub fn checkpoint(kind: CheckpointKind) -> Self {
        CacheRecord::Checkpoint { kind }
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Directory-backed cache stream with backup and recovery.
#[derive(Debug, Clone)]
pub struct Cache {
    cache_path: PathBuf,
    items_path: PathBuf,
    recovery_path: PathBuf,
}

impl Cache {
    /// Open (creating if needed) the cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_path = dir.into();
        let items_path = cache_path.join(ITEMS_DIR);
        let recovery_path = cache_path.join(RECOVERY_DIR);

        fs::create_dir_all(&items_path)?;
        fs::create_dir_all(&recovery_path)?;

        Ok(Self {
            cache_path,
            items_path,
            recovery_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    pub fn items_path(&self) -> &Path {
        &self.items_path
    }

    pub fn recovery_path(&self) -> &Path {
        &self.recovery_path
    }

    /// Append `records` in order with a single write.
    pub fn store(&self, records: &[CacheRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stream_file())?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Read back every record in storage order.
    ///
    /// A final line without its terminating newline is a torn write and is
    /// reported as corruption.
    pub fn retrieve(&self) -> Result<Vec<CacheRecord>> {
        let path = self.stream_file();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        if !content.is_empty() && !content.ends_with('\n') {
            return Err(HarvestError::CacheCorrupted(format!(
                "incomplete record at the end of {}",
                path.display()
            )));
        }

        content
            .lines()
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    HarvestError::CacheCorrupted(format!("invalid record at line {}: {}", n + 1, e))
                })
            })
            .collect()
    }

    /// Start a replay over the current contents.
    pub fn replay(&self) -> Result<CacheReplay> {
        Ok(CacheReplay::new(self.retrieve()?))
    }

    /// Copy the live stream to the recovery area, replacing any previous backup.
    pub fn backup(&self) -> Result<()> {
        reset_dir(&self.recovery_path)?;
        copy_dir(&self.items_path, &self.recovery_path)
    }

    /// Empty the live stream. Its contents are backed up first unless
    /// `erase` is set, in which case the backup is wiped too.
    pub fn clean(&self, erase: bool) -> Result<()> {
        if erase {
            reset_dir(&self.recovery_path)?;
        } else {
            self.backup()?;
        }
        reset_dir(&self.items_path)
    }

    /// Replace the live stream with the recovery backup.
    pub fn recover(&self) -> Result<()> {
        reset_dir(&self.items_path)?;
        copy_dir(&self.recovery_path, &self.items_path)
    }

    fn stream_file(&self) -> PathBuf {
        self.items_path.join(STREAM_FILE)
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| HarvestError::Cache(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| HarvestError::Cache(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// In-memory queue of records for the item being assembled.
///
/// Records only reach the cache on [`flush`](CacheQueue::flush), in one
/// append, so an interrupted item never leaves half its lookups behind.
#[derive(Debug)]
pub struct CacheQueue {
    cache: Cache,
    pending: Vec<CacheRecord>,
}

impl CacheQueue {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            pending: Vec::new(),
        }
    }

    pub fn push_payload(&mut self, data: impl Into<Vec<u8>>) {
        self.pending.push(CacheRecord::payload(data));
    }

    pub fn push_checkpoint(&mut self, kind: CheckpointKind) {
        self.pending.push(CacheRecord::checkpoint(kind));
    }

    /// Write every pending record and clear the queue.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.store(&self.pending)?;
        debug!("Flushed {} cache record(s)", self.pending.len());
        self.pending.clear();
        Ok(())
    }

    /// Drop pending records without writing them.
    pub fn purge(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// What the replay produced next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEntry {
    Payload(Vec<u8>),
    Checkpoint(CheckpointKind),
    /// The stream ended cleanly at a record boundary.
    End,
}

/// Cursor over a stored cache stream that enforces the checkpoint protocol.
#[derive(Debug)]
pub struct CacheReplay {
    records: VecDeque<CacheRecord>,
    consumed: usize,
}

impl CacheReplay {
    pub fn new(records: Vec<CacheRecord>) -> Self {
        Self {
            records: records.into(),
            consumed: 0,
        }
    }

    pub fn next_entry(&mut self) -> ReplayEntry {
        match self.records.pop_front() {
            Some(record) => {
                self.consumed += 1;
                match record {
                    CacheRecord::Payload { data } => ReplayEntry::Payload(data),
                    CacheRecord::Checkpoint { kind } => ReplayEntry::Checkpoint(kind),
                }
            }
            None => ReplayEntry::End,
        }
    }

    /// Peek whether the stream is exhausted.
    pub fn is_finished(&self) -> bool {
        self.records.is_empty()
    }

    /// Take the next entry, which the protocol says must be a payload.
    pub fn expect_payload(&mut self) -> Result<Vec<u8>> {
        let position = self.consumed;
        match self.next_entry() {
            ReplayEntry::Payload(data) => Ok(data),
            ReplayEntry::Checkpoint(kind) => Err(HarvestError::CacheCorrupted(format!(
                "expected payload at entry {}, found checkpoint {:?}",
                position, kind
            ))),
            ReplayEntry::End => Err(HarvestError::CacheCorrupted(format!(
                "stream ended at entry {} while a payload was expected",
                position
            ))),
        }
    }

    /// Take the next entry, which the protocol says must be `kind`.
    pub fn expect_checkpoint(&mut self, kind: CheckpointKind) -> Result<()> {
        let position = self.consumed;
        match self.next_entry() {
            ReplayEntry::Checkpoint(found) if found == kind => Ok(()),
            ReplayEntry::Checkpoint(found) => Err(HarvestError::CacheCorrupted(format!(
                "expected checkpoint {:?} at entry {}, found {:?}",
                kind, position, found
            ))),
            ReplayEntry::Payload(_) => Err(HarvestError::CacheCorrupted(format!(
                "expected checkpoint {:?} at entry {}, found payload",
                kind, position
            ))),
            ReplayEntry::End => Err(HarvestError::CacheCorrupted(format!(
                "stream ended at entry {} while checkpoint {:?} was expected",
                position, kind
            ))),
        }
    }

    /// Collect payloads until `kind` is reached.
    pub fn payloads_until(&mut self, kind: CheckpointKind) -> Result<Vec<Vec<u8>>> {
        let mut payloads = Vec::new();
        loop {
            let position = self.consumed;
            match self.next_entry() {
                ReplayEntry::Payload(data) => payloads.push(data),
                ReplayEntry::Checkpoint(found) if found == kind => return Ok(payloads),
                ReplayEntry::Checkpoint(found) => {
                    return Err(HarvestError::CacheCorrupted(format!(
                        "expected checkpoint {:?} at entry {}, found {:?}",
                        kind, position, found
                    )))
                }
                ReplayEntry::End => {
                    return Err(HarvestError::CacheCorrupted(format!(
                        "stream ended at entry {} while checkpoint {:?} was expected",
                        position, kind
                    )))
                }
            }
        }
    }
}

/// Order in which dependent lookups must be issued so that live fetches and
/// replays agree on the payload sequence: sorted, without duplicates.
pub fn stable_lookup_order<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter()
        .map(Into::into)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}
