//! Sync cursor, its persisted form and where it is kept between runs.
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    clock::ReplicaId,
    error::{Result, SyncError},
    ids::SourceKey,
};

pub const CURSOR_LEN: usize = 8;
const MAX_SOURCE_KEY_LEN: usize = 1024;

/// Resumable position in the remote change feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub sync_id: u32,
    pub change_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawCursor {
    sync_id: [u8; 4],
    change_id: [u8; 4],
}
unsafe impl Zeroable for RawCursor {}
unsafe impl Pod for RawCursor {}

impl SyncCursor {
    pub fn new(sync_id: u32, change_id: u32) -> Self {
        SyncCursor { sync_id, change_id }
    }

    /// Two little-endian u32s, sync id first.
    pub fn encode(&self) -> [u8; CURSOR_LEN] {
        let raw = RawCursor {
            sync_id: self.sync_id.to_le_bytes(),
            change_id: self.change_id.to_le_bytes(),
        };
        let mut out = [0u8; CURSOR_LEN];
        out.copy_from_slice(bytemuck::bytes_of(&raw));
        out
    }

    /// Reads the first 8 bytes; anything after them is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(SyncState::decode(bytes)?.cursor)
    }
}

/// A change already handled under the current cursor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessedChange {
    pub change_id: u32,
    pub source_key: SourceKey,
}

/// Decoded sync state stream: the cursor plus an optional list of changes
/// already processed under it (written by partially completed runs).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    pub cursor: SyncCursor,
    pub processed: BTreeSet<ProcessedChange>,
}

impl SyncState {
    /// Empty input is the zero cursor. Fewer than 8 bytes, a truncated list or
    /// a source key over 1024 bytes is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(SyncState::default());
        }
        if bytes.len() < CURSOR_LEN {
            return Err(SyncError::InvalidArgument(format!(
                "sync state of {} bytes",
                bytes.len()
            )));
        }
        let raw: RawCursor = bytemuck::pod_read_unaligned(&bytes[..CURSOR_LEN]);
        let cursor = SyncCursor {
            sync_id: u32::from_le_bytes(raw.sync_id),
            change_id: u32::from_le_bytes(raw.change_id),
        };

        let mut processed = BTreeSet::new();
        let mut reader = Reader::new(&bytes[CURSOR_LEN..]);
        if let Some(count) = reader.u32() {
            for _ in 0..count {
                let change_id = reader.u32().ok_or_else(truncated)?;
                let len = reader.u32().ok_or_else(truncated)? as usize;
                if len > MAX_SOURCE_KEY_LEN {
                    return Err(SyncError::InvalidArgument(format!(
                        "source key of {len} bytes in sync state"
                    )));
                }
                let key = reader.take(len).ok_or_else(truncated)?;
                processed.insert(ProcessedChange {
                    change_id,
                    source_key: SourceKey(key.to_vec()),
                });
            }
        }
        Ok(SyncState { cursor, processed })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.cursor.encode().to_vec();
        if self.processed.is_empty() {
            return out;
        }
        out.extend_from_slice(&(self.processed.len() as u32).to_le_bytes());
        for change in &self.processed {
            out.extend_from_slice(&change.change_id.to_le_bytes());
            out.extend_from_slice(&(change.source_key.0.len() as u32).to_le_bytes());
            out.extend_from_slice(&change.source_key.0);
        }
        out
    }

    pub fn is_processed(&self, change_id: u32, source_key: &SourceKey) -> bool {
        self.processed.contains(&ProcessedChange {
            change_id,
            source_key: source_key.clone(),
        })
    }
}

fn truncated() -> SyncError {
    SyncError::InvalidArgument("truncated processed change list".into())
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Reader { rest }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.rest.len() < n {
            return None;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Persistence for cursors, one per replica.
pub trait CursorStore: Send {
    fn load_cursor(&self, replica: &ReplicaId) -> Result<Option<SyncCursor>>;
    fn save_cursor(&self, replica: &ReplicaId, cursor: SyncCursor) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<ReplicaId, SyncCursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load_cursor(&self, replica: &ReplicaId) -> Result<Option<SyncCursor>> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| SyncError::Io("cursor store lock poisoned".into()))?;
        Ok(cursors.get(replica).copied())
    }

    fn save_cursor(&self, replica: &ReplicaId, cursor: SyncCursor) -> Result<()> {
        self.cursors
            .lock()
            .map_err(|_| SyncError::Io("cursor store lock poisoned".into()))?
            .insert(*replica, cursor);
        Ok(())
    }
}

/// One `<replica>.cursor` file per replica under a directory.
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "cursor store opened");
        Ok(FileCursorStore { dir })
    }

    fn path_for(&self, replica: &ReplicaId) -> PathBuf {
        self.dir.join(format!("{replica}.cursor"))
    }
}

impl CursorStore for FileCursorStore {
    fn load_cursor(&self, replica: &ReplicaId) -> Result<Option<SyncCursor>> {
        let path = self.path_for(replica);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(SyncCursor::decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_cursor(&self, replica: &ReplicaId, cursor: SyncCursor) -> Result<()> {
        let path = self.path_for(replica);
        let tmp = path.with_extension("cursor.tmp");
        fs::write(&tmp, cursor.encode())?;
        fs::rename(&tmp, &path)?;
        debug!(%replica, ?cursor, "cursor saved");
        Ok(())
    }
}
