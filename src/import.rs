//! Drives batches of remote changes into the local store.
//!
//! Every change is resolved by source key, checked against the local causal
//! history (already applied? conflicting?), applied through an `ObjectTree`
//! and saved. The cursor only moves once a whole batch went through, so an
//! interrupted batch is redelivered and the items that did land come back as
//! `Ignored`.
use std::{collections::BTreeSet, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    clock::{CausalHistory, ChangeKey, ReplicaId},
    config::Config,
    conflict::{ConflictCopy, ConflictFolderIds, ConflictFolderStore, ConflictResolver},
    cursor::{CursorStore, ProcessedChange, SyncCursor, SyncState},
    error::{Result, SyncError},
    ids::{EntryId, SourceKey},
    session::{Connection, Request, Response, SaveFlags, SyncSession},
    tags,
    transfer::{Handle, Sink, StreamTransferPipeline},
    tree::{ObjectKind, ObjectTree, PropTag, PropertyValue, Value},
};

/// Per-change flags as sent by the exporter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags(pub u32);

impl ChangeFlags {
    pub const SOFT_DELETE: ChangeFlags = ChangeFlags(0x01);
    pub const EXPIRY: ChangeFlags = ChangeFlags(0x02);
    pub const ASSOCIATED: ChangeFlags = ChangeFlags(0x10);
    pub const NEW_MESSAGE: ChangeFlags = ChangeFlags(0x800);

    pub fn contains(self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    New,
    Modified,
    SoftDeleted,
    Expired,
}

/// One remote change. An empty `source_key` means the exporter did not send
/// one; such a change can only create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    /// Exporter's change number, matched against a resumed processed list.
    #[serde(default)]
    pub change_id: Option<u32>,
    pub flags: ChangeFlags,
    pub source_key: SourceKey,
    pub parent_source_key: Option<SourceKey>,
    pub change_type: ChangeType,
    pub change_key: Option<ChangeKey>,
    pub causal_history: Option<CausalHistory>,
    pub properties: Vec<PropertyValue>,
}

impl ChangeDescriptor {
    pub fn is_new(&self) -> bool {
        self.change_type == ChangeType::New
            || self.flags.contains(ChangeFlags::NEW_MESSAGE)
            || self.source_key.is_empty()
    }

    pub fn is_soft_delete(&self) -> bool {
        self.change_type == ChangeType::SoftDeleted || self.flags.contains(ChangeFlags::SOFT_DELETE)
    }

    pub fn is_associated(&self) -> bool {
        if self.flags.contains(ChangeFlags::ASSOCIATED) {
            return true;
        }
        self.properties.iter().any(|p| match (p.tag, &p.value) {
            (tags::MESSAGE_FLAGS, Value::Long(f)) => f & tags::MSGFLAG_ASSOCIATED != 0,
            (tags::ASSOCIATED, Value::Boolean(b)) => *b,
            _ => false,
        })
    }

    fn passed_entry_id(&self) -> Option<EntryId> {
        self.properties.iter().find_map(|p| match (p.tag, &p.value) {
            (tags::ENTRYID, Value::Binary(id)) if !id.is_empty() => Some(EntryId(id.clone())),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied {
        entry: EntryId,
        conflict: Option<ConflictCopy>,
    },
    /// Already part of the local history.
    Ignored,
    /// The local object is gone; nothing to apply.
    ObjectDeleted,
    Failed(SyncError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<Outcome>,
    /// Set when every item went through and the cursor was persisted.
    pub committed: Option<SyncCursor>,
}

pub enum StreamImport {
    Ignored,
    ObjectDeleted,
    Started {
        sink: Sink,
        handle: Handle,
        conflict: Option<ConflictCopy>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportState {
    Unconfigured,
    Configured(SyncCursor),
    Processing(SyncCursor),
    Failed,
}

/// Which folder changes land in, and the store root holding the conflict
/// folder ids.
#[derive(Clone, Debug)]
pub struct ImportTarget {
    pub folder: EntryId,
    pub folder_key: SourceKey,
    pub store_root: EntryId,
}

pub struct ImportCoordinator {
    conn: Arc<Connection>,
    target: ImportTarget,
    replica: ReplicaId,
    cursors: Arc<dyn CursorStore>,
    resolver: ConflictResolver,
    pipeline: StreamTransferPipeline,
    state: ImportState,
    /// Changes a previous run already landed under the current cursor.
    processed: BTreeSet<ProcessedChange>,
}

/// Where an incoming change will land once the checks passed.
struct Prepared {
    session: SyncSession,
    tree: ObjectTree,
    conflict: Option<ConflictCopy>,
    associated: bool,
}

enum Preflight {
    Ready(Box<Prepared>),
    Ignored,
    ObjectDeleted,
}

impl ImportCoordinator {
    pub fn new(
        conn: Arc<Connection>,
        target: ImportTarget,
        replica: ReplicaId,
        cursors: Arc<dyn CursorStore>,
        config: &Config,
    ) -> Self {
        ImportCoordinator {
            conn,
            target,
            replica,
            cursors,
            resolver: ConflictResolver::new(),
            pipeline: StreamTransferPipeline::new(config.transfer.clone()),
            state: ImportState::Unconfigured,
            processed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ImportState {
        self.state
    }

    /// `None` (or a zero sync id) asks the remote for a fresh sync id.
    #[instrument(skip(self), fields(replica = %self.replica))]
    pub fn configure(&mut self, cursor: Option<SyncCursor>) -> Result<SyncCursor> {
        let start = cursor.unwrap_or_default();
        let cursor = if start.sync_id == 0 {
            match self.conn.call(&Request::SetSyncStatus {
                folder: self.target.folder_key.clone(),
                sync_id: 0,
                change_id: start.change_id,
            })? {
                Response::SyncStatus { sync_id } => SyncCursor::new(sync_id, start.change_id),
                other => {
                    return Err(SyncError::Inconsistent(format!(
                        "unexpected answer to sync status: {other:?}"
                    )));
                }
            }
        } else {
            start
        };
        info!(sync_id = cursor.sync_id, change_id = cursor.change_id, "import configured");
        self.state = ImportState::Configured(cursor);
        self.processed.clear();
        Ok(cursor)
    }

    /// Configures from a decoded sync-state stream. Changes on its processed
    /// list come back as `Ignored` without touching the store until the next
    /// cursor commit.
    pub fn configure_with_state(&mut self, state: SyncState) -> Result<SyncCursor> {
        let cursor = self.configure(Some(state.cursor))?;
        debug!(processed = state.processed.len(), "resuming partially processed batch");
        self.processed = state.processed;
        Ok(cursor)
    }

    /// Configures from the persisted cursor for this replica, if any.
    pub fn resume(&mut self) -> Result<SyncCursor> {
        let stored = self.cursors.load_cursor(&self.replica)?;
        self.configure(stored)
    }

    fn cursor(&self) -> Result<SyncCursor> {
        match self.state {
            ImportState::Configured(cursor) | ImportState::Processing(cursor) => Ok(cursor),
            ImportState::Unconfigured | ImportState::Failed => Err(SyncError::InvalidArgument(
                "import coordinator is not configured".into(),
            )),
        }
    }

    pub fn apply_change(&mut self, change: &ChangeDescriptor) -> Outcome {
        let cursor = match self.cursor() {
            Ok(cursor) => cursor,
            Err(err) => return Outcome::Failed(err),
        };
        self.state = ImportState::Processing(cursor);
        let outcome = match self.try_apply(change, cursor.sync_id) {
            Ok(outcome) => outcome,
            Err(SyncError::NotFound) => Outcome::ObjectDeleted,
            Err(err) => Outcome::Failed(err),
        };
        self.settle(cursor, &outcome);
        outcome
    }

    fn settle(&mut self, cursor: SyncCursor, outcome: &Outcome) {
        self.state = match outcome {
            Outcome::Failed(err) => {
                warn!(%err, "change failed, batch halted");
                ImportState::Failed
            }
            _ => ImportState::Configured(cursor),
        };
    }

    fn try_apply(&mut self, change: &ChangeDescriptor, sync_id: u32) -> Result<Outcome> {
        let mut prepared = match self.preflight(change, sync_id)? {
            Preflight::Ready(prepared) => prepared,
            Preflight::Ignored => return Ok(Outcome::Ignored),
            Preflight::ObjectDeleted => return Ok(Outcome::ObjectDeleted),
        };
        apply_properties(&mut prepared.tree, change)?;
        let flags = if prepared.associated {
            SaveFlags::ASSOCIATED
        } else {
            SaveFlags::NONE
        };
        prepared.session.save(&mut prepared.tree, flags)?;
        let entry = prepared
            .session
            .entry()
            .cloned()
            .ok_or_else(|| SyncError::Inconsistent("save returned no entry id".into()))?;
        debug!(%entry, source_key = %change.source_key, "change applied");
        Ok(Outcome::Applied {
            entry,
            conflict: prepared.conflict,
        })
    }

    /// Resolution, idempotence and conflict handling shared by both import paths.
    fn preflight(&mut self, change: &ChangeDescriptor, sync_id: u32) -> Result<Preflight> {
        if let Some(change_id) = change.change_id {
            if self.processed.contains(&ProcessedChange {
                change_id,
                source_key: change.source_key.clone(),
            }) {
                debug!(change_id, source_key = %change.source_key, "processed before resume");
                return Ok(Preflight::Ignored);
            }
        }
        let associated = change.is_associated();
        let existing = if change.source_key.is_empty() {
            None
        } else {
            self.resolve(&change.source_key)?
        };

        let Some(entry) = existing else {
            if !change.is_new() {
                debug!(source_key = %change.source_key, "changed object no longer exists locally");
                return Ok(Preflight::ObjectDeleted);
            }
            let session = SyncSession::new(
                self.conn.clone(),
                self.target.folder.clone(),
                change.passed_entry_id(),
            )
            .with_sync_id(sync_id);
            return Ok(Preflight::Ready(Box::new(Prepared {
                session,
                tree: ObjectTree::new(ObjectKind::Message),
                conflict: None,
                associated,
            })));
        };

        let session = SyncSession::new(self.conn.clone(), self.target.folder.clone(), Some(entry.clone()))
            .with_sync_id(sync_id);
        let mut tree = match session.load(&entry) {
            Ok(tree) => tree,
            // source key still known but the object is gone (soft deleted)
            Err(SyncError::NotFound) => return Ok(Preflight::ObjectDeleted),
            Err(err) => return Err(err),
        };

        let local_history = local_history(&tree);
        if let Some(remote_key) = &change.change_key {
            if self.resolver.is_already_applied(&local_history, remote_key) {
                debug!(%remote_key, "change already applied");
                return Ok(Preflight::Ignored);
            }
        }

        let mut conflict = None;
        if let (Some(local_key), Some(remote_history)) = (local_change_key(&tree), &change.causal_history) {
            if self.resolver.detect(&local_key, remote_history, associated) {
                let mut store = RemoteConflictStore::new(self.conn.clone(), self.target.store_root.clone());
                match self.resolver.materialize_conflict(&entry, &mut tree, &mut store) {
                    Ok(copy) => conflict = Some(copy),
                    Err(err) => warn!(%err, %entry, "could not preserve conflicting local state"),
                }
            }
        }

        Ok(Preflight::Ready(Box::new(Prepared {
            session,
            tree,
            conflict,
            associated,
        })))
    }

    fn resolve(&self, source_key: &SourceKey) -> Result<Option<EntryId>> {
        let request = Request::EntryIdFromSourceKey {
            folder: self.target.folder_key.clone(),
            source_key: source_key.clone(),
        };
        match self.conn.call(&request) {
            Ok(Response::EntryId(entry)) => Ok(Some(entry)),
            Ok(other) => Err(SyncError::Inconsistent(format!(
                "unexpected answer to source key lookup: {other:?}"
            ))),
            Err(SyncError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Applies `changes` in order, stopping at the first failure. The cursor
    /// is committed only when every item was processed.
    pub fn apply_batch(&mut self, changes: &[ChangeDescriptor], next: SyncCursor) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for change in changes {
            let outcome = self.apply_change(change);
            let failed = matches!(outcome, Outcome::Failed(_));
            report.outcomes.push(outcome);
            if failed {
                return Ok(report);
            }
        }
        self.commit_cursor(next)?;
        report.committed = Some(next);
        Ok(report)
    }

    /// Deletes every resolvable key in one request; unknown keys are skipped.
    pub fn apply_deletion(&mut self, source_keys: &[SourceKey], soft: bool) -> Result<usize> {
        let cursor = self.cursor()?;
        let mut entries = Vec::with_capacity(source_keys.len());
        for key in source_keys {
            match self.resolve(key)? {
                Some(entry) => entries.push(entry),
                None => debug!(source_key = %key, "deletion of unknown object skipped"),
            }
        }
        if entries.is_empty() {
            return Ok(0);
        }
        let count = entries.len();
        self.conn.call(&Request::DeleteObjects {
            entries,
            soft,
            sync_id: cursor.sync_id,
        })?;
        debug!(count, soft, "objects deleted");
        Ok(count)
    }

    /// Sets or clears the read flag per source key; unknown keys are skipped.
    pub fn apply_read_state(&mut self, states: &[(SourceKey, bool)]) -> Result<usize> {
        let cursor = self.cursor()?;
        let mut applied = 0;
        for (key, read) in states {
            let Some(entry) = self.resolve(key)? else {
                continue;
            };
            match self.conn.call(&Request::SetReadFlag {
                entry,
                read: *read,
                sync_id: cursor.sync_id,
            }) {
                Ok(_) => applied += 1,
                Err(SyncError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(applied)
    }

    /// Moves are expressed by the exporter as delete plus create.
    pub fn apply_move(&mut self, _source_keys: &[SourceKey]) -> Result<()> {
        Err(SyncError::Unsupported("moving objects between folders"))
    }

    pub fn commit_cursor(&mut self, cursor: SyncCursor) -> Result<()> {
        self.cursor()?;
        self.cursors.save_cursor(&self.replica, cursor)?;
        info!(sync_id = cursor.sync_id, change_id = cursor.change_id, "cursor committed");
        self.state = ImportState::Configured(cursor);
        self.processed.clear();
        Ok(())
    }

    /// Like `apply_change`, but the new content arrives as a serialized
    /// stream of `size` bytes written by the caller into the returned sink.
    pub fn apply_change_as_stream(&mut self, change: &ChangeDescriptor, size: u64) -> Result<StreamImport> {
        let cursor = self.cursor()?;
        self.state = ImportState::Processing(cursor);
        let started = self.start_stream(change, size, cursor.sync_id);
        self.state = match &started {
            Err(SyncError::NotFound) | Ok(_) => ImportState::Configured(cursor),
            Err(_) => ImportState::Failed,
        };
        match started {
            Err(SyncError::NotFound) => Ok(StreamImport::ObjectDeleted),
            other => other,
        }
    }

    fn start_stream(&mut self, change: &ChangeDescriptor, size: u64, sync_id: u32) -> Result<StreamImport> {
        let mut prepared = match self.preflight(change, sync_id)? {
            Preflight::Ready(prepared) => prepared,
            Preflight::Ignored => return Ok(StreamImport::Ignored),
            Preflight::ObjectDeleted => return Ok(StreamImport::ObjectDeleted),
        };
        let flags = if prepared.associated {
            SaveFlags::ASSOCIATED
        } else {
            SaveFlags::NONE
        };
        if prepared.conflict.is_some() {
            // the stream replaces the content, so the back-reference goes out first
            prepared.session.save(&mut prepared.tree, flags)?;
        }
        let (sink, handle) = prepared.session.import_stream(&self.pipeline, size, flags)?;
        Ok(StreamImport::Started {
            sink,
            handle,
            conflict: prepared.conflict,
        })
    }
}

fn local_history(tree: &ObjectTree) -> CausalHistory {
    tree.get_property(tree.root(), tags::PREDECESSOR_CHANGE_LIST)
        .and_then(Value::as_binary)
        .map(CausalHistory::decode)
        .unwrap_or_default()
}

fn local_change_key(tree: &ObjectTree) -> Option<ChangeKey> {
    tree.get_property(tree.root(), tags::CHANGE_KEY)
        .and_then(Value::as_binary)
        .and_then(|b| ChangeKey::from_bytes(b).ok())
}

/// Incoming properties win; the change key and history are rewritten so the
/// object's history includes the change just applied.
fn apply_properties(tree: &mut ObjectTree, change: &ChangeDescriptor) -> Result<()> {
    let root = tree.root();
    let mut history = local_history(tree);
    for prop in &change.properties {
        if prop.tag == tags::ENTRYID {
            continue;
        }
        tree.set_property(root, prop.tag, prop.value.clone())?;
    }
    if !change.source_key.is_empty() && !tree.has_property(root, tags::SOURCE_KEY) {
        tree.set_property(root, tags::SOURCE_KEY, Value::Binary(change.source_key.0.clone()))?;
    }
    if let Some(parent) = &change.parent_source_key {
        tree.set_property(root, tags::PARENT_SOURCE_KEY, Value::Binary(parent.0.clone()))?;
    }
    if let Some(remote) = &change.causal_history {
        history.union(remote);
    }
    if let Some(key) = change.change_key {
        history.merge_key(key);
        tree.set_property(root, tags::CHANGE_KEY, Value::Binary(key.to_bytes().to_vec()))?;
    }
    if !history.is_empty() {
        tree.set_property(root, tags::PREDECESSOR_CHANGE_LIST, Value::Binary(history.encode()))?;
    }
    Ok(())
}

/// Conflict folders kept in the remote store; ids persist on the store root.
pub struct RemoteConflictStore {
    conn: Arc<Connection>,
    root: EntryId,
}

impl RemoteConflictStore {
    pub fn new(conn: Arc<Connection>, root: EntryId) -> Self {
        RemoteConflictStore { conn, root }
    }

    fn root_session(&self) -> SyncSession {
        SyncSession::new(self.conn.clone(), EntryId::default(), Some(self.root.clone()))
    }
}

impl ConflictFolderStore for RemoteConflictStore {
    fn load_folder_ids(&mut self) -> Result<ConflictFolderIds> {
        let root = self.root_session().load(&self.root)?;
        let slots = match root.get_property(root.root(), tags::ADDITIONAL_REN_ENTRYIDS) {
            Some(Value::MultiBinary(ids)) => ids.iter().map(|id| EntryId(id.clone())).collect(),
            _ => Vec::new(),
        };
        Ok(ConflictFolderIds::from_slots(slots))
    }

    fn folder_exists(&mut self, folder: &EntryId) -> Result<bool> {
        match self.conn.call(&Request::OpenFolder {
            entry: folder.clone(),
        }) {
            Ok(_) => Ok(true),
            Err(SyncError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn create_folder(&mut self, parent: Option<&EntryId>, name: &str) -> Result<EntryId> {
        match self.conn.call(&Request::CreateFolder {
            parent: parent.cloned(),
            name: name.to_string(),
        })? {
            Response::EntryId(entry) => Ok(entry),
            other => Err(SyncError::Inconsistent(format!(
                "unexpected answer to folder creation: {other:?}"
            ))),
        }
    }

    fn store_folder_ids(&mut self, ids: &ConflictFolderIds) -> Result<()> {
        let mut session = self.root_session();
        let mut root = session.load(&self.root)?;
        let node = root.root();
        let slots = ids.slots().iter().map(|id| id.0.clone()).collect();
        root.set_property(node, tags::ADDITIONAL_REN_ENTRYIDS, Value::MultiBinary(slots))?;
        session.save(&mut root, SaveFlags::NONE)
    }

    fn save_copy(&mut self, folder: &EntryId, copy: &mut ObjectTree) -> Result<EntryId> {
        let mut session = SyncSession::new(self.conn.clone(), folder.clone(), None);
        session.save(copy, SaveFlags::NONE)?;
        session
            .entry()
            .cloned()
            .ok_or_else(|| SyncError::Inconsistent("save returned no entry id".into()))
    }

    fn load_value(&mut self, entry: &EntryId, server_id: u32, tag: PropTag) -> Result<Value> {
        let session = SyncSession::new(self.conn.clone(), EntryId::default(), Some(entry.clone()));
        Ok(session.load_property(entry, server_id, tag)?.value)
    }
}
