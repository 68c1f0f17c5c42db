//! Request/response plumbing to the remote store and the save round trip.
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RpcError, SyncError},
    ids::{EntryId, SourceKey},
    transfer::{Handle, Sink, StreamChannel, StreamTransferPipeline},
    tree::{ObjectTree, PropTag, PropertyValue, WireObject},
};

/// Object flags passed along with a save.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFlags(pub u32);

impl SaveFlags {
    pub const NONE: SaveFlags = SaveFlags(0);
    pub const ASSOCIATED: SaveFlags = SaveFlags(0x40);

    pub fn contains(self, other: SaveFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    SaveObject {
        parent: EntryId,
        entry: Option<EntryId>,
        object: WireObject,
        flags: SaveFlags,
        sync_id: u32,
    },
    LoadObject {
        entry: EntryId,
    },
    LoadProperty {
        entry: EntryId,
        server_id: u32,
        tag: PropTag,
    },
    EntryIdFromSourceKey {
        folder: SourceKey,
        source_key: SourceKey,
    },
    /// Asks for a sync id; `sync_id == 0` requests a fresh one.
    SetSyncStatus {
        folder: SourceKey,
        sync_id: u32,
        change_id: u32,
    },
    DeleteObjects {
        entries: Vec<EntryId>,
        soft: bool,
        sync_id: u32,
    },
    SetReadFlag {
        entry: EntryId,
        read: bool,
        sync_id: u32,
    },
    OpenFolder {
        entry: EntryId,
    },
    /// `parent == None` places the folder at the top of the visible hierarchy.
    CreateFolder {
        parent: Option<EntryId>,
        name: String,
    },
    ImportMessageStream {
        parent: EntryId,
        entry: Option<EntryId>,
        flags: SaveFlags,
        sync_id: u32,
        size: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Saved { entry: EntryId, object: WireObject },
    Loaded(WireObject),
    Property(PropertyValue),
    EntryId(EntryId),
    SyncStatus { sync_id: u32 },
    Done,
}

/// The transport this crate consumes. Implementations frame and encode
/// requests however they like.
pub trait RpcChannel: Send {
    fn request(&mut self, request: &Request) -> std::result::Result<Response, RpcError>;

    fn reauthenticate(&mut self) -> std::result::Result<(), RpcError>;

    fn open_stream(
        &mut self,
        request: &Request,
    ) -> std::result::Result<Box<dyn StreamChannel>, RpcError>;
}

/// One connection to the remote store; a single request in flight at a time.
pub struct Connection {
    channel: Mutex<Box<dyn RpcChannel>>,
}

impl Connection {
    pub fn new(channel: Box<dyn RpcChannel>) -> Arc<Self> {
        Arc::new(Connection {
            channel: Mutex::new(channel),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Box<dyn RpcChannel>>> {
        self.channel
            .lock()
            .map_err(|_| SyncError::Rpc("connection lock poisoned".into()))
    }

    /// Issues `request`, re-authenticating once on a stale session.
    pub fn call(&self, request: &Request) -> Result<Response> {
        let mut channel = self.lock()?;
        match channel.request(request) {
            Err(RpcError::StaleSession) => {
                warn!("stale session, re-authenticating");
                channel.reauthenticate()?;
                Ok(channel.request(request)?)
            }
            other => Ok(other?),
        }
    }

    pub(crate) fn open_stream(&self, request: &Request) -> Result<Box<dyn StreamChannel>> {
        let mut channel = self.lock()?;
        match channel.open_stream(request) {
            Err(RpcError::StaleSession) => {
                warn!("stale session, re-authenticating");
                channel.reauthenticate()?;
                Ok(channel.open_stream(request)?)
            }
            other => Ok(other?),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingResponse,
    Retrying,
    Applied,
    Failed,
}

/// Saves and loads one object under `parent`.
pub struct SyncSession {
    conn: Arc<Connection>,
    parent: EntryId,
    entry: Option<EntryId>,
    sync_id: u32,
    state: SessionState,
}

impl SyncSession {
    /// `entry == None` means the object does not exist remotely yet.
    pub fn new(conn: Arc<Connection>, parent: EntryId, entry: Option<EntryId>) -> Self {
        SyncSession {
            conn,
            parent,
            entry,
            sync_id: 0,
            state: SessionState::Idle,
        }
    }

    /// Tags saves so the remote does not echo them back to this sync.
    pub fn with_sync_id(mut self, sync_id: u32) -> Self {
        self.sync_id = sync_id;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn entry(&self) -> Option<&EntryId> {
        self.entry.as_ref()
    }

    pub fn parent(&self) -> &EntryId {
        &self.parent
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Sends everything dirty in `tree` and merges the server's answer.
    ///
    /// One unknown-instance resend and one stale-session retry at most, both
    /// under the same connection lock.
    pub fn save(&mut self, tree: &mut ObjectTree, flags: SaveFlags) -> Result<()> {
        let conn = self.conn.clone();
        let mut channel = conn.lock()?;
        self.state = SessionState::AwaitingResponse;

        let outcome = self.round_trip(&mut **channel, tree, flags);
        drop(channel);
        let (entry, object) = match outcome {
            Ok(saved) => saved,
            Err(err) => {
                self.state = SessionState::Failed;
                return Err(err);
            }
        };
        if let Err(err) = tree.merge_response(&object) {
            self.state = SessionState::Failed;
            return Err(err);
        }
        debug!(%entry, server_id = object.server_id, "saved");
        self.entry = Some(entry);
        self.state = SessionState::Applied;
        Ok(())
    }

    fn round_trip(
        &mut self,
        channel: &mut dyn RpcChannel,
        tree: &mut ObjectTree,
        flags: SaveFlags,
    ) -> Result<(EntryId, WireObject)> {
        let mut request = self.save_request(tree, flags)?;
        let mut inlined = false;
        let mut reauthenticated = false;
        loop {
            match channel.request(&request) {
                Ok(Response::Saved { entry, object }) => return Ok((entry, object)),
                Ok(other) => {
                    return Err(SyncError::Inconsistent(format!(
                        "unexpected answer to save: {other:?}"
                    )));
                }
                Err(RpcError::UnknownInstance) if !inlined => {
                    inlined = true;
                    self.state = SessionState::Retrying;
                    if !tree.inline_instances()? {
                        return Err(SyncError::UnknownInstance);
                    }
                    info!("remote lost an instance, resending with bodies inline");
                    request = self.save_request(tree, flags)?;
                }
                Err(RpcError::StaleSession) if !reauthenticated => {
                    reauthenticated = true;
                    self.state = SessionState::Retrying;
                    warn!("stale session during save, re-authenticating");
                    channel.reauthenticate()?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn save_request(&self, tree: &ObjectTree, flags: SaveFlags) -> Result<Request> {
        Ok(Request::SaveObject {
            parent: self.parent.clone(),
            entry: self.entry.clone(),
            object: tree.to_wire()?,
            flags,
            sync_id: self.sync_id,
        })
    }

    /// Fetches a fresh, clean tree for `entry`.
    pub fn load(&self, entry: &EntryId) -> Result<ObjectTree> {
        match self.conn.call(&Request::LoadObject {
            entry: entry.clone(),
        })? {
            Response::Loaded(wire) => ObjectTree::from_wire(&wire),
            other => Err(SyncError::Inconsistent(format!(
                "unexpected answer to load: {other:?}"
            ))),
        }
    }

    /// One property of the (sub)object `server_id` inside `entry`.
    pub fn load_property(&self, entry: &EntryId, server_id: u32, tag: PropTag) -> Result<PropertyValue> {
        match self.conn.call(&Request::LoadProperty {
            entry: entry.clone(),
            server_id,
            tag,
        })? {
            Response::Property(prop) if prop.tag == tag => Ok(prop),
            other => Err(SyncError::Inconsistent(format!(
                "unexpected answer to property load: {other:?}"
            ))),
        }
    }

    /// Streams a serialized object of `size` bytes into `parent`.
    pub fn import_stream(
        &self,
        pipeline: &StreamTransferPipeline,
        size: u64,
        flags: SaveFlags,
    ) -> Result<(Sink, Handle)> {
        let stream = self.conn.open_stream(&Request::ImportMessageStream {
            parent: self.parent.clone(),
            entry: self.entry.clone(),
            flags,
            sync_id: self.sync_id,
            size,
        })?;
        pipeline.start_transfer(size, stream)
    }
}
