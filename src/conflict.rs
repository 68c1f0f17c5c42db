//! Conflict detection and conflict copies.
//!
//! An incoming change conflicts when the remote's causal history has not seen
//! our latest local edit. The incoming change still wins on the live object;
//! the state it overwrites is preserved as a copy in a dedicated folder.
use tracing::{debug, info, warn};

use crate::{
    clock::{self, CausalHistory, ChangeKey},
    error::{Result, SyncError},
    ids::EntryId,
    tags,
    tree::{ObjectTree, PropTag, Value},
};

pub const CONFLICTS: usize = 0;
pub const SYNC_ISSUES: usize = 1;
pub const LOCAL_FAILURES: usize = 2;
pub const SERVER_FAILURES: usize = 3;
pub const FOLDER_SLOTS: usize = 4;

pub const FOLDER_NAMES: [&str; FOLDER_SLOTS] =
    ["Conflicts", "Sync Issues", "Local Failures", "Server Failures"];

/// Persisted folder ids, slot order as in the constants above. An empty id
/// marks a slot never filled; slots past the fourth belong to others and are
/// carried along untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictFolderIds {
    slots: Vec<EntryId>,
}

impl ConflictFolderIds {
    pub fn from_slots(slots: Vec<EntryId>) -> Self {
        ConflictFolderIds { slots }
    }

    pub fn get(&self, slot: usize) -> Option<&EntryId> {
        self.slots.get(slot).filter(|id| !id.is_empty())
    }

    pub fn set(&mut self, slot: usize, id: EntryId) {
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, EntryId::default());
        }
        self.slots[slot] = id;
    }

    pub fn slots(&self) -> &[EntryId] {
        &self.slots
    }
}

/// Where conflict folders and copies live.
pub trait ConflictFolderStore {
    fn load_folder_ids(&mut self) -> Result<ConflictFolderIds>;

    fn folder_exists(&mut self, folder: &EntryId) -> Result<bool>;

    /// `parent == None` creates at the top of the visible hierarchy.
    fn create_folder(&mut self, parent: Option<&EntryId>, name: &str) -> Result<EntryId>;

    fn store_folder_ids(&mut self, ids: &ConflictFolderIds) -> Result<()>;

    /// Saves `copy` as a new object in `folder`, returning its id.
    fn save_copy(&mut self, folder: &EntryId, copy: &mut ObjectTree) -> Result<EntryId>;

    /// Value of `tag` on the (sub)object `server_id` of `entry`.
    fn load_value(&mut self, entry: &EntryId, server_id: u32, tag: PropTag) -> Result<Value>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictCopy {
    pub entry: EntryId,
    pub folder: EntryId,
}

#[derive(Debug, Default)]
pub struct ConflictResolver {
    conflicts_folder: Option<EntryId>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The exact remote change is already in our history.
    pub fn is_already_applied(&self, local_history: &CausalHistory, remote_key: &ChangeKey) -> bool {
        clock::is_known(local_history, remote_key)
    }

    /// Associated (hidden) messages never conflict; last write wins for them.
    pub fn detect(&self, local_key: &ChangeKey, remote_history: &CausalHistory, associated: bool) -> bool {
        !associated && clock::conflicts_with(local_key, remote_history)
    }

    /// Files a copy of `original` in the conflicts folder and cross-links the two.
    ///
    /// The back-reference on `original` is left pending in the tree; it goes
    /// out with the original's next save.
    pub fn materialize_conflict(
        &mut self,
        original_entry: &EntryId,
        original: &mut ObjectTree,
        store: &mut dyn ConflictFolderStore,
    ) -> Result<ConflictCopy> {
        fetch_unloaded(original_entry, original, store)?;
        let folder = self.conflicts_folder(store)?;
        let (entry, folder) = match self.file_copy(&folder, original_entry, original, store) {
            Err(SyncError::NotFound) => {
                warn!(%folder, "conflicts folder vanished, recreating");
                self.conflicts_folder = None;
                let folder = self.create_folders(store)?;
                (self.file_copy(&folder, original_entry, original, store)?, folder)
            }
            other => (other?, folder),
        };

        let root = original.root();
        let mut links = match original.get_property(root, tags::CONFLICT_ITEMS) {
            Some(Value::MultiBinary(ids)) => ids.clone(),
            _ => Vec::new(),
        };
        links.push(entry.0.clone());
        original.set_property(root, tags::CONFLICT_ITEMS, Value::MultiBinary(links))?;
        info!(original = %original_entry, copy = %entry, "conflict copy created");
        Ok(ConflictCopy { entry, folder })
    }

    fn file_copy(
        &self,
        folder: &EntryId,
        original_entry: &EntryId,
        original: &ObjectTree,
        store: &mut dyn ConflictFolderStore,
    ) -> Result<EntryId> {
        let mut copy = original.unsaved_copy(&tags::CONFLICT_EXCLUDED)?;
        let root = copy.root();
        copy.set_property(
            root,
            tags::CONFLICT_ITEMS,
            Value::MultiBinary(vec![original_entry.0.clone()]),
        )?;
        store.save_copy(folder, &mut copy)
    }

    fn conflicts_folder(&mut self, store: &mut dyn ConflictFolderStore) -> Result<EntryId> {
        if let Some(folder) = &self.conflicts_folder {
            return Ok(folder.clone());
        }
        let ids = store.load_folder_ids()?;
        if let Some(folder) = ids.get(CONFLICTS) {
            if store.folder_exists(folder)? {
                self.conflicts_folder = Some(folder.clone());
                return Ok(folder.clone());
            }
        }
        debug!("no usable conflicts folder");
        self.create_folders(store)
    }

    /// Makes sure all four folders exist, reusing any that still open.
    pub fn create_folders(&mut self, store: &mut dyn ConflictFolderStore) -> Result<EntryId> {
        let mut ids = store.load_folder_ids()?;
        let sync_issues = reuse_or_create(store, &mut ids, SYNC_ISSUES, None)?;
        for slot in [CONFLICTS, LOCAL_FAILURES, SERVER_FAILURES] {
            reuse_or_create(store, &mut ids, slot, Some(&sync_issues))?;
        }
        if ids.slots.len() < FOLDER_SLOTS {
            ids.slots.resize(FOLDER_SLOTS, EntryId::default());
        }
        store.store_folder_ids(&ids)?;
        let conflicts = ids
            .get(CONFLICTS)
            .cloned()
            .ok_or_else(|| SyncError::Inconsistent("conflicts folder not recorded".into()))?;
        self.conflicts_folder = Some(conflicts.clone());
        Ok(conflicts)
    }
}

/// Pulls in every value the copy needs but the tree only knows by tag.
/// Identity tags on the root are skipped; they never reach the copy.
fn fetch_unloaded(
    entry: &EntryId,
    tree: &mut ObjectTree,
    store: &mut dyn ConflictFolderStore,
) -> Result<()> {
    let root = tree.root();
    for (node, server_id, tag) in tree.unloaded_properties()? {
        if node == root && tags::CONFLICT_EXCLUDED.contains(&tag) {
            continue;
        }
        match store.load_value(entry, server_id, tag) {
            Ok(value) => tree.cache_value(node, tag, value)?,
            Err(SyncError::NotFound) => debug!(tag, server_id, "property vanished before copy"),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn reuse_or_create(
    store: &mut dyn ConflictFolderStore,
    ids: &mut ConflictFolderIds,
    slot: usize,
    parent: Option<&EntryId>,
) -> Result<EntryId> {
    if let Some(existing) = ids.get(slot) {
        if store.folder_exists(existing)? {
            return Ok(existing.clone());
        }
    }
    let created = store.create_folder(parent, FOLDER_NAMES[slot])?;
    debug!(name = FOLDER_NAMES[slot], id = %created, "conflict folder created");
    ids.set(slot, created.clone());
    Ok(created)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        clock::ReplicaId,
        tree::{ObjectKind, ObjectNode, PropertyValue, WireObject},
    };

    #[derive(Default)]
    struct MemoryFolders {
        ids: ConflictFolderIds,
        folders: HashMap<EntryId, (Option<EntryId>, String)>,
        copies: Vec<(EntryId, ObjectTree)>,
        remote_values: HashMap<(u32, PropTag), Value>,
        loads: usize,
        next: u8,
    }

    impl ConflictFolderStore for MemoryFolders {
        fn load_folder_ids(&mut self) -> Result<ConflictFolderIds> {
            Ok(self.ids.clone())
        }

        fn folder_exists(&mut self, folder: &EntryId) -> Result<bool> {
            Ok(self.folders.contains_key(folder))
        }

        fn create_folder(&mut self, parent: Option<&EntryId>, name: &str) -> Result<EntryId> {
            self.next += 1;
            let id = EntryId(vec![0xF0, self.next]);
            self.folders
                .insert(id.clone(), (parent.cloned(), name.to_string()));
            Ok(id)
        }

        fn store_folder_ids(&mut self, ids: &ConflictFolderIds) -> Result<()> {
            self.ids = ids.clone();
            Ok(())
        }

        fn save_copy(&mut self, folder: &EntryId, copy: &mut ObjectTree) -> Result<EntryId> {
            if !self.folders.contains_key(folder) {
                return Err(SyncError::NotFound);
            }
            self.next += 1;
            let id = EntryId(vec![0xC0, self.next]);
            self.copies.push((folder.clone(), copy.clone()));
            Ok(id)
        }

        fn load_value(&mut self, _entry: &EntryId, server_id: u32, tag: PropTag) -> Result<Value> {
            self.loads += 1;
            self.remote_values
                .get(&(server_id, tag))
                .cloned()
                .ok_or(SyncError::NotFound)
        }
    }

    fn key(r: u8, seq: u32) -> ChangeKey {
        ChangeKey::new(ReplicaId([r; 16]), seq)
    }

    fn original() -> ObjectTree {
        let mut tree = ObjectTree::new(ObjectKind::Message);
        let root = tree.root();
        tree.set_property(root, tags::DISPLAY_NAME, Value::Text("mine".into()))
            .unwrap();
        tree.set_property(root, tags::CHANGE_KEY, Value::Binary(key(1, 5).to_bytes().to_vec()))
            .unwrap();
        tree.attach_child(root, ObjectNode::new(ObjectKind::Recipient, 0))
            .unwrap();
        tree
    }

    #[test]
    fn associated_messages_never_conflict() {
        let resolver = ConflictResolver::new();
        let remote = CausalHistory::from_keys([key(1, 3)]);
        assert!(resolver.detect(&key(1, 5), &remote, false));
        assert!(!resolver.detect(&key(1, 5), &remote, true));
        let remote = CausalHistory::from_keys([key(1, 5), key(2, 1)]);
        assert!(!resolver.detect(&key(1, 5), &remote, false));
    }

    #[test]
    fn already_applied_is_exact_match() {
        let resolver = ConflictResolver::new();
        let local = CausalHistory::from_keys([key(2, 9)]);
        assert!(resolver.is_already_applied(&local, &key(2, 9)));
        assert!(!resolver.is_already_applied(&local, &key(2, 8)));
    }

    #[test]
    fn first_conflict_creates_folder_hierarchy() {
        let mut store = MemoryFolders::default();
        let mut resolver = ConflictResolver::new();
        let mut tree = original();
        let copy = resolver
            .materialize_conflict(&EntryId(vec![0xAA]), &mut tree, &mut store)
            .unwrap();

        assert_eq!(store.folders.len(), 4);
        let sync_issues = store.ids.get(SYNC_ISSUES).unwrap().clone();
        assert_eq!(store.folders[&sync_issues], (None, "Sync Issues".to_string()));
        for slot in [CONFLICTS, LOCAL_FAILURES, SERVER_FAILURES] {
            let (parent, name) = &store.folders[store.ids.get(slot).unwrap()];
            assert_eq!(parent.as_ref(), Some(&sync_issues));
            assert_eq!(name, FOLDER_NAMES[slot]);
        }
        assert_eq!(Some(&copy.folder), store.ids.get(CONFLICTS));

        let (_, saved) = &store.copies[0];
        let root = saved.root();
        assert!(!saved.has_property(root, tags::CHANGE_KEY));
        assert_eq!(
            saved.get_property(root, tags::DISPLAY_NAME),
            Some(&Value::Text("mine".into()))
        );
        assert_eq!(
            saved.get_property(root, tags::CONFLICT_ITEMS),
            Some(&Value::MultiBinary(vec![vec![0xAA]]))
        );
        assert!(saved.child(root, ObjectKind::Recipient, 0).is_some());
        let root = tree.root();
        assert_eq!(
            tree.get_property(root, tags::CONFLICT_ITEMS),
            Some(&Value::MultiBinary(vec![copy.entry.0.clone()]))
        );
    }

    #[test]
    fn copy_carries_values_only_known_by_tag() {
        const BODY: PropTag = 0x1000_001F;
        let mut wire = WireObject::new(ObjectKind::Message, 0, 40);
        wire.properties
            .push(PropertyValue::new(tags::DISPLAY_NAME, Value::Text("mine".into())));
        wire.available_tags = vec![BODY, tags::SOURCE_KEY];
        let mut recipient = WireObject::new(ObjectKind::Recipient, 0, 41);
        recipient.available_tags = vec![tags::DISPLAY_NAME];
        wire.children.push(recipient);
        let mut tree = ObjectTree::from_wire(&wire).unwrap();

        let mut store = MemoryFolders::default();
        store
            .remote_values
            .insert((40, BODY), Value::Text("a very long body".into()));
        store
            .remote_values
            .insert((41, tags::DISPLAY_NAME), Value::Text("someone".into()));
        let mut resolver = ConflictResolver::new();
        resolver
            .materialize_conflict(&EntryId(vec![0xAA]), &mut tree, &mut store)
            .unwrap();

        // the source key is identity and never fetched
        assert_eq!(store.loads, 2);
        let (_, saved) = &store.copies[0];
        let root = saved.root();
        assert_eq!(
            saved.get_property(root, BODY),
            Some(&Value::Text("a very long body".into()))
        );
        let rcpt = saved.child(root, ObjectKind::Recipient, 0).unwrap();
        assert_eq!(
            saved.get_property(rcpt, tags::DISPLAY_NAME),
            Some(&Value::Text("someone".into()))
        );
        let sent = saved.to_wire().unwrap();
        assert!(sent.property(BODY).is_some());
        // fetched values are cached, only the back-reference is pending
        assert_eq!(tree.root_node().modified_len(), 1);
        assert!(tree.get_property(tree.root(), BODY).is_some());
    }

    #[test]
    fn folders_are_reused_and_links_append() {
        let mut store = MemoryFolders::default();
        let mut resolver = ConflictResolver::new();
        let mut tree = original();
        let first = resolver
            .materialize_conflict(&EntryId(vec![0xAA]), &mut tree, &mut store)
            .unwrap();
        // a fresh resolver finds the persisted ids
        let mut resolver = ConflictResolver::new();
        let second = resolver
            .materialize_conflict(&EntryId(vec![0xAA]), &mut tree, &mut store)
            .unwrap();
        assert_eq!(store.folders.len(), 4);
        assert_eq!(first.folder, second.folder);
        let root = tree.root();
        assert_eq!(
            tree.get_property(root, tags::CONFLICT_ITEMS),
            Some(&Value::MultiBinary(vec![
                first.entry.0.clone(),
                second.entry.0.clone()
            ]))
        );
    }

    #[test]
    fn deleted_conflicts_folder_is_recreated() {
        let mut store = MemoryFolders::default();
        let mut resolver = ConflictResolver::new();
        let mut tree = original();
        let first = resolver
            .materialize_conflict(&EntryId(vec![0xAA]), &mut tree, &mut store)
            .unwrap();
        store.folders.remove(&first.folder);

        let second = resolver
            .materialize_conflict(&EntryId(vec![0xAA]), &mut tree, &mut store)
            .unwrap();
        assert_ne!(first.folder, second.folder);
        assert_eq!(store.ids.get(CONFLICTS), Some(&second.folder));
        assert_eq!(store.folders.len(), 4);
    }

    #[test]
    fn foreign_slots_survive() {
        let mut store = MemoryFolders::default();
        store.ids = ConflictFolderIds::from_slots(vec![
            EntryId::default(),
            EntryId::default(),
            EntryId::default(),
            EntryId::default(),
            EntryId(vec![0x99]),
        ]);
        let mut resolver = ConflictResolver::new();
        resolver.create_folders(&mut store).unwrap();
        assert_eq!(store.ids.slots().len(), 5);
        assert_eq!(store.ids.slots()[4], EntryId(vec![0x99]));
    }
}
