//! Change keys and causal histories.
//!
//! A change key is the last `(replica, sequence)` written against an object. A
//! causal history (predecessor change list) records, per replica, the highest
//! sequence the object's state already reflects.
//!
//! Wire format of a history: a run of entries, each a length byte `L` followed
//! by `L` bytes. An `L <= 16` ends the run. Entries this crate produces are 20
//! bytes: the replica id followed by the little-endian sequence.
use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const REPLICA_ID_LEN: usize = 16;
pub const CHANGE_KEY_LEN: usize = 20;

#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(pub [u8; REPLICA_ID_LEN]);
unsafe impl Zeroable for ReplicaId {}
unsafe impl Pod for ReplicaId {}

impl ReplicaId {
    pub fn random() -> Self {
        ReplicaId(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; REPLICA_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({self})")
    }
}

/// On-wire layout of a change key.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawChangeKey {
    replica: [u8; REPLICA_ID_LEN],
    sequence: [u8; 4],
}
unsafe impl Zeroable for RawChangeKey {}
unsafe impl Pod for RawChangeKey {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<u8>", try_from = "Vec<u8>")]
pub struct ChangeKey {
    pub replica: ReplicaId,
    pub sequence: u32,
}

impl ChangeKey {
    pub fn new(replica: ReplicaId, sequence: u32) -> Self {
        ChangeKey { replica, sequence }
    }

    pub fn to_bytes(&self) -> [u8; CHANGE_KEY_LEN] {
        let raw = RawChangeKey {
            replica: self.replica.0,
            sequence: self.sequence.to_le_bytes(),
        };
        let mut out = [0u8; CHANGE_KEY_LEN];
        out.copy_from_slice(bytemuck::bytes_of(&raw));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let raw: RawChangeKey = bytemuck::try_pod_read_unaligned(bytes).map_err(|_| {
            SyncError::InvalidArgument(format!(
                "change key must be {CHANGE_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(ChangeKey {
            replica: ReplicaId(raw.replica),
            sequence: u32::from_le_bytes(raw.sequence),
        })
    }
}

impl From<ChangeKey> for Vec<u8> {
    fn from(key: ChangeKey) -> Self {
        key.to_bytes().to_vec()
    }
}

impl TryFrom<Vec<u8>> for ChangeKey {
    type Error = SyncError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        ChangeKey::from_bytes(&bytes)
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.sequence)
    }
}

/// One history entry exactly as a peer sent it (always longer than 16 bytes).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HistoryEntry {
    raw: Vec<u8>,
}

impl HistoryEntry {
    pub fn replica(&self) -> ReplicaId {
        let mut id = [0u8; REPLICA_ID_LEN];
        id.copy_from_slice(&self.raw[..REPLICA_ID_LEN]);
        ReplicaId(id)
    }

    /// Sequence number, only for entries in the 20 byte change key shape.
    pub fn sequence(&self) -> Option<u32> {
        if self.raw.len() != CHANGE_KEY_LEN {
            return None;
        }
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&self.raw[REPLICA_ID_LEN..]);
        Some(u32::from_le_bytes(seq))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn matches_exactly(&self, key: &ChangeKey) -> bool {
        self.raw.as_slice() == key.to_bytes().as_slice()
    }
}

impl From<ChangeKey> for HistoryEntry {
    fn from(key: ChangeKey) -> Self {
        HistoryEntry {
            raw: key.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence() {
            Some(seq) => write!(f, "{}:{}", self.replica(), seq),
            None => write!(f, "{}+{}b", self.replica(), self.raw.len() - REPLICA_ID_LEN),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<u8>", from = "Vec<u8>")]
pub struct CausalHistory {
    entries: Vec<HistoryEntry>,
}

impl CausalHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: impl IntoIterator<Item = ChangeKey>) -> Self {
        let mut history = CausalHistory::new();
        for key in keys {
            history.merge_key(key);
        }
        history
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn sequence_for(&self, replica: &ReplicaId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.replica() == *replica)
            .and_then(HistoryEntry::sequence)
    }

    /// Folds `key` in, keeping the highest sequence seen per replica.
    pub fn merge_key(&mut self, key: ChangeKey) {
        match self.entries.iter_mut().find(|e| e.replica() == key.replica) {
            Some(entry) => match entry.sequence() {
                Some(seq) if seq >= key.sequence => {}
                _ => *entry = key.into(),
            },
            None => self.entries.push(key.into()),
        }
    }

    pub fn union(&mut self, other: &CausalHistory) {
        for entry in &other.entries {
            match entry.sequence() {
                Some(seq) => self.merge_key(ChangeKey::new(entry.replica(), seq)),
                None => {
                    if !self.entries.iter().any(|e| e.replica() == entry.replica()) {
                        self.entries.push(entry.clone());
                    }
                }
            }
        }
    }

    pub fn is_known(&self, key: &ChangeKey) -> bool {
        is_known(self, key)
    }
}

impl From<CausalHistory> for Vec<u8> {
    fn from(history: CausalHistory) -> Self {
        history.encode()
    }
}

impl From<Vec<u8>> for CausalHistory {
    fn from(bytes: Vec<u8>) -> Self {
        CausalHistory::decode(&bytes)
    }
}

pub fn encode(history: &CausalHistory) -> Vec<u8> {
    let mut out = Vec::with_capacity(history.entries.len() * (CHANGE_KEY_LEN + 1));
    for entry in &history.entries {
        // decode only admits entries of 17..=255 bytes
        out.push(entry.raw.len() as u8);
        out.extend_from_slice(&entry.raw);
    }
    out
}

/// Never fails: a short length byte or a truncated entry ends the scan and the
/// entries read so far are returned.
pub fn decode(bytes: &[u8]) -> CausalHistory {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let len = bytes[pos] as usize;
        pos += 1;
        if len <= REPLICA_ID_LEN || pos + len > bytes.len() {
            break;
        }
        entries.push(HistoryEntry {
            raw: bytes[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    CausalHistory { entries }
}

/// True iff this exact change key already appears in `history`.
pub fn is_known(history: &CausalHistory, key: &ChangeKey) -> bool {
    history.entries.iter().any(|e| e.matches_exactly(key))
}

/// True if the remote has not seen our latest local change.
///
/// A replica absent from `remote` is a conflict. A present entry conflicts when
/// the local sequence is newer, or when its shape hides the sequence.
pub fn conflicts_with(local: &ChangeKey, remote: &CausalHistory) -> bool {
    let mut found = false;
    for entry in remote.entries.iter().filter(|e| e.replica() == local.replica) {
        found = true;
        let newer = match entry.sequence() {
            Some(seq) => local.sequence > seq,
            None => true,
        };
        if newer {
            return true;
        }
    }
    !found
}
