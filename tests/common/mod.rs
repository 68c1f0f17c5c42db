//! In-memory remote store speaking the request/response protocol.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use crossbeam::channel::{Receiver, Sender, unbounded};
use icsync::{
    RpcError,
    ids::{EntryId, InstanceId, SourceKey},
    import::ImportTarget,
    session::{Connection, Request, Response, RpcChannel},
    tags,
    transfer::StreamChannel,
    tree::{InstanceRef, ObjectKind, PropTag, PropertyValue, Value, WireObject},
};

pub const LAST_MODIFIED: PropTag = 0x3008_0003;

#[derive(Clone, Debug)]
pub struct Stored {
    pub parent: EntryId,
    pub object: WireObject,
    pub soft_deleted: bool,
}

#[derive(Default)]
pub struct State {
    pub objects: BTreeMap<EntryId, Stored>,
    pub folders: BTreeMap<EntryId, (Option<EntryId>, String)>,
    pub known_instances: HashSet<InstanceId>,
    pub requests: Vec<Request>,
    pub faults: VecDeque<RpcError>,
    pub logins: u32,
    pub next_id: u32,
    pub next_sync: u32,
    pub streams: Vec<Vec<u8>>,
    /// Lookups of these keys fail as if the store were unreachable.
    pub broken_keys: HashSet<SourceKey>,
    /// Loads report these tags as available without sending their value.
    pub withheld: HashSet<PropTag>,
}

#[derive(Clone)]
pub struct RemoteStore {
    pub state: Arc<Mutex<State>>,
    pub folder: EntryId,
    pub folder_key: SourceKey,
    pub root: EntryId,
}

impl RemoteStore {
    pub fn new() -> Self {
        let folder = EntryId(vec![0xF0, 0x00]);
        let root = EntryId(vec![0xF0, 0xFF]);
        let mut state = State {
            next_id: 100,
            next_sync: 40,
            ..State::default()
        };
        state
            .folders
            .insert(folder.clone(), (None, "Inbox".to_string()));
        state.objects.insert(
            root.clone(),
            Stored {
                parent: EntryId::default(),
                object: WireObject::new(ObjectKind::Folder, 0, 1),
                soft_deleted: false,
            },
        );
        RemoteStore {
            state: Arc::new(Mutex::new(state)),
            folder,
            folder_key: SourceKey(vec![0x5F, 0x00]),
            root,
        }
    }

    pub fn connection(&self) -> Arc<Connection> {
        Connection::new(Box::new(Channel {
            state: self.state.clone(),
        }))
    }

    pub fn target(&self) -> ImportTarget {
        ImportTarget {
            folder: self.folder.clone(),
            folder_key: self.folder_key.clone(),
            store_root: self.root.clone(),
        }
    }

    /// Puts a message straight into the folder, bypassing the protocol.
    pub fn seed_message(&self, source_key: &[u8], props: Vec<PropertyValue>) -> EntryId {
        let mut state = self.state.lock().unwrap();
        let server_id = state.alloc();
        let entry = EntryId(server_id.to_le_bytes().to_vec());
        let mut object = WireObject::new(ObjectKind::Message, 0, server_id);
        object.properties.push(PropertyValue::new(
            tags::SOURCE_KEY,
            Value::Binary(source_key.to_vec()),
        ));
        object.properties.extend(props);
        state.objects.insert(
            entry.clone(),
            Stored {
                parent: self.folder.clone(),
                object,
                soft_deleted: false,
            },
        );
        entry
    }

    /// Adds an attachment whose body the server holds as a known instance.
    pub fn seed_attachment(&self, entry: &EntryId, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let server_id = state.alloc();
        let id = InstanceId::for_content(body);
        state.known_instances.insert(id.clone());
        let stored = state.objects.get_mut(entry).unwrap();
        let mut attachment = WireObject::new(ObjectKind::Attachment, 0, server_id);
        attachment.properties.push(PropertyValue::new(
            tags::ATTACH_DATA_BIN,
            Value::Binary(body.to_vec()),
        ));
        attachment.instance = Some(InstanceRef {
            tag: tags::ATTACH_DATA_BIN,
            id,
        });
        stored.object.children.push(attachment);
    }

    pub fn object(&self, entry: &EntryId) -> WireObject {
        self.state.lock().unwrap().objects[entry].object.clone()
    }

    pub fn property(&self, entry: &EntryId, tag: PropTag) -> Option<Value> {
        self.object(entry).property(tag).map(|p| p.value.clone())
    }

    pub fn exists(&self, entry: &EntryId) -> bool {
        self.state.lock().unwrap().objects.contains_key(entry)
    }

    pub fn objects_in(&self, folder: &EntryId) -> Vec<EntryId> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(_, s)| &s.parent == folder && !s.soft_deleted)
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub fn folder_named(&self, name: &str) -> Option<(EntryId, Option<EntryId>)> {
        self.state
            .lock()
            .unwrap()
            .folders
            .iter()
            .find(|(_, (_, n))| n == name)
            .map(|(id, (parent, _))| (id.clone(), parent.clone()))
    }

    pub fn folder_count(&self) -> usize {
        self.state.lock().unwrap().folders.len()
    }

    pub fn fail_next(&self, err: RpcError) {
        self.state.lock().unwrap().faults.push_back(err);
    }

    /// Large values: loads only announce `tag`, its value needs its own request.
    pub fn withhold(&self, tag: PropTag) {
        self.state.lock().unwrap().withheld.insert(tag);
    }

    pub fn break_key(&self, key: &[u8], broken: bool) {
        let key = SourceKey(key.to_vec());
        let mut state = self.state.lock().unwrap();
        if broken {
            state.broken_keys.insert(key);
        } else {
            state.broken_keys.remove(&key);
        }
    }

    /// Drops every folder except the import target.
    pub fn drop_folders(&self) {
        let folder = self.folder.clone();
        self.state
            .lock()
            .unwrap()
            .folders
            .retain(|id, _| *id == folder);
    }

    pub fn forget_instances(&self) {
        self.state.lock().unwrap().known_instances.clear();
    }

    pub fn count_requests(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| pred(r))
            .count()
    }

    pub fn logins(&self) -> u32 {
        self.state.lock().unwrap().logins
    }
}

struct Channel {
    state: Arc<Mutex<State>>,
}

impl RpcChannel for Channel {
    fn request(&mut self, request: &Request) -> Result<Response, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        state.handle(request)
    }

    fn reauthenticate(&mut self) -> Result<(), RpcError> {
        self.state.lock().unwrap().logins += 1;
        Ok(())
    }

    fn open_stream(&mut self, request: &Request) -> Result<Box<dyn StreamChannel>, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        let (tx, rx) = unbounded();
        Ok(Box::new(Upload {
            state: self.state.clone(),
            buf: Vec::new(),
            tx: Some(tx),
            rx,
        }))
    }
}

impl State {
    fn alloc(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn handle(&mut self, request: &Request) -> Result<Response, RpcError> {
        match request {
            Request::SaveObject {
                parent,
                entry,
                object,
                ..
            } => self.save(parent, entry.as_ref(), object),
            Request::LoadObject { entry } => self
                .objects
                .get(entry)
                .filter(|s| !s.soft_deleted)
                .map(|s| {
                    let mut object = s.object.clone();
                    withhold(&mut object, &self.withheld);
                    Response::Loaded(object)
                })
                .ok_or(RpcError::NotFound),
            Request::LoadProperty {
                entry,
                server_id,
                tag,
            } => {
                let stored = self.objects.get(entry).ok_or(RpcError::NotFound)?;
                find_node(&stored.object, *server_id)
                    .and_then(|n| n.property(*tag).cloned())
                    .map(Response::Property)
                    .ok_or(RpcError::NotFound)
            }
            Request::EntryIdFromSourceKey { source_key, .. } => {
                if self.broken_keys.contains(source_key) {
                    return Err(RpcError::Other("store unreachable".into()));
                }
                let wanted = Value::Binary(source_key.0.clone());
                self.objects
                    .iter()
                    .find(|(_, s)| s.object.property(tags::SOURCE_KEY).map(|p| &p.value) == Some(&wanted))
                    .map(|(e, _)| Response::EntryId(e.clone()))
                    .ok_or(RpcError::NotFound)
            }
            Request::SetSyncStatus { sync_id, .. } => {
                if *sync_id == 0 {
                    self.next_sync += 1;
                    Ok(Response::SyncStatus {
                        sync_id: self.next_sync,
                    })
                } else {
                    Ok(Response::SyncStatus { sync_id: *sync_id })
                }
            }
            Request::DeleteObjects { entries, soft, .. } => {
                for entry in entries {
                    if *soft {
                        if let Some(s) = self.objects.get_mut(entry) {
                            s.soft_deleted = true;
                        }
                    } else {
                        self.objects.remove(entry);
                    }
                }
                Ok(Response::Done)
            }
            Request::SetReadFlag { entry, read, .. } => {
                let stored = self
                    .objects
                    .get_mut(entry)
                    .filter(|s| !s.soft_deleted)
                    .ok_or(RpcError::NotFound)?;
                let flags = stored
                    .object
                    .property(tags::MESSAGE_FLAGS)
                    .and_then(|p| p.value.as_long())
                    .unwrap_or(0);
                let flags = if *read {
                    flags | tags::MSGFLAG_READ
                } else {
                    flags & !tags::MSGFLAG_READ
                };
                upsert(&mut stored.object, PropertyValue::new(tags::MESSAGE_FLAGS, Value::Long(flags)));
                Ok(Response::Done)
            }
            Request::OpenFolder { entry } => {
                if self.folders.contains_key(entry) {
                    Ok(Response::Done)
                } else {
                    Err(RpcError::NotFound)
                }
            }
            Request::CreateFolder { parent, name } => {
                let id = EntryId(self.alloc().to_le_bytes().to_vec());
                self.folders.insert(id.clone(), (parent.clone(), name.clone()));
                Ok(Response::EntryId(id))
            }
            Request::ImportMessageStream { .. } => {
                Err(RpcError::Other("streams are opened, not requested".into()))
            }
        }
    }

    fn save(&mut self, parent: &EntryId, entry: Option<&EntryId>, sent: &WireObject) -> Result<Response, RpcError> {
        self.check_instances(sent)?;
        let entry = match entry {
            Some(entry) => entry.clone(),
            None if !self.folders.contains_key(parent) => return Err(RpcError::NotFound),
            None => EntryId(self.alloc().to_le_bytes().to_vec()),
        };
        let mut stored = match self.objects.remove(&entry) {
            Some(stored) if stored.soft_deleted => {
                self.objects.insert(entry, stored);
                return Err(RpcError::NotFound);
            }
            Some(stored) => stored,
            None => Stored {
                parent: parent.clone(),
                object: WireObject::new(sent.kind, 0, 0),
                soft_deleted: false,
            },
        };
        let echo = merge(&mut stored.object, sent, &mut self.next_id);
        self.objects.insert(entry.clone(), stored);
        Ok(Response::Saved {
            entry,
            object: echo,
        })
    }

    fn check_instances(&mut self, sent: &WireObject) -> Result<(), RpcError> {
        if let Some(PropertyValue {
            value: Value::Binary(body),
            ..
        }) = sent.property(tags::ATTACH_DATA_BIN)
        {
            self.known_instances.insert(InstanceId::for_content(body));
        }
        if let Some(instance) = &sent.instance {
            if !self.known_instances.contains(&instance.id) {
                return Err(RpcError::UnknownInstance);
            }
        }
        for child in &sent.children {
            self.check_instances(child)?;
        }
        Ok(())
    }
}

fn withhold(object: &mut WireObject, withheld: &HashSet<PropTag>) {
    let (kept, held): (Vec<_>, Vec<_>) = object
        .properties
        .drain(..)
        .partition(|p| !withheld.contains(&p.tag));
    object.properties = kept;
    object.available_tags.extend(held.into_iter().map(|p| p.tag));
    for child in &mut object.children {
        withhold(child, withheld);
    }
}

fn find_node(object: &WireObject, server_id: u32) -> Option<&WireObject> {
    if object.server_id == server_id {
        return Some(object);
    }
    object
        .children
        .iter()
        .find_map(|c| find_node(c, server_id))
}

fn upsert(object: &mut WireObject, prop: PropertyValue) {
    object.properties.retain(|p| p.tag != prop.tag);
    object.properties.push(prop);
}

/// Applies `sent` to the stored state and returns what a server answers.
fn merge(stored: &mut WireObject, sent: &WireObject, next_id: &mut u32) -> WireObject {
    if stored.server_id == 0 {
        *next_id += 1;
        stored.server_id = *next_id;
    }
    for tag in &sent.deleted_tags {
        stored.properties.retain(|p| p.tag != *tag);
    }
    for prop in &sent.properties {
        upsert(stored, prop.clone());
    }
    if sent.instance.is_some() {
        stored.instance = sent.instance.clone();
    } else if let Some(PropertyValue {
        value: Value::Binary(body),
        ..
    }) = sent.property(tags::ATTACH_DATA_BIN)
    {
        stored.instance = Some(InstanceRef {
            tag: tags::ATTACH_DATA_BIN,
            id: InstanceId::for_content(body),
        });
    }
    *next_id += 1;
    upsert(stored, PropertyValue::new(LAST_MODIFIED, Value::Long(*next_id)));

    let mut echo = WireObject::new(sent.kind, sent.client_id, stored.server_id);
    echo.instance = stored.instance.clone();
    echo.properties
        .push(PropertyValue::new(LAST_MODIFIED, Value::Long(*next_id)));
    for child in &sent.children {
        if child.deleted {
            stored.children.retain(|c| c.server_id != child.server_id);
            continue;
        }
        let existing = stored
            .children
            .iter()
            .position(|c| child.server_id != 0 && c.server_id == child.server_id);
        let index = match existing {
            Some(i) => i,
            None => {
                stored
                    .children
                    .push(WireObject::new(child.kind, child.client_id, 0));
                stored.children.len() - 1
            }
        };
        echo.children
            .push(merge(&mut stored.children[index], child, next_id));
    }
    echo
}

/// Collects a streamed upload and acknowledges it once the write side closes.
struct Upload {
    state: Arc<Mutex<State>>,
    buf: Vec<u8>,
    tx: Option<Sender<Result<Vec<u8>, RpcError>>>,
    rx: Receiver<Result<Vec<u8>, RpcError>>,
}

impl StreamChannel for Upload {
    fn write(&mut self, chunk: &[u8]) -> Result<(), RpcError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn close_write(&mut self) -> Result<(), RpcError> {
        self.state.lock().unwrap().streams.push(self.buf.clone());
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(b"OK".to_vec()));
        }
        Ok(())
    }

    fn replies(&self) -> Receiver<Result<Vec<u8>, RpcError>> {
        self.rx.clone()
    }

    fn close(&mut self) {
        self.tx = None;
    }
}
