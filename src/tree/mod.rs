//! Dirty-tracking object tree.
//!
//! One hierarchical object (a message with its attachments and recipients, a
//! folder) lives in an arena owned by `ObjectTree`. Nodes are addressed by
//! `NodeId`; children are keyed by `(ObjectKind, client_id)` and the parent
//! link is a side index, so there are no back-pointers.
//!
//! Every node records what changed since the last save (`modified`, the
//! pending delete list, the `changed` flag) next to what is known to exist on
//! the server (`values`, `available_tags`). `to_wire` and `merge_response` in
//! [`wire`] turn that bookkeeping into a save round trip.
pub mod wire;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, SyncError},
    ids::InstanceId,
};
pub use wire::WireObject;

pub type PropTag = u32;

/// Externally encoded property payload. Only the variants the engine has to
/// build itself are distinguished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Binary(Vec<u8>),
    MultiBinary(Vec<Vec<u8>>),
    Long(u32),
    Boolean(bool),
    Text(String),
}

impl Value {
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<u32> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub tag: PropTag,
    pub value: Value,
}

impl PropertyValue {
    pub fn new(tag: PropTag, value: Value) -> Self {
        PropertyValue { tag, value }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Folder,
    Message,
    Attachment,
    Recipient,
}

/// Link to a deduplicated body standing in for property `tag`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub tag: PropTag,
    pub id: InstanceId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

type ChildKey = (ObjectKind, u32);

#[derive(Clone, Debug)]
pub struct ObjectNode {
    kind: ObjectKind,
    client_id: u32,
    server_id: u32,
    deleted: bool,
    changed: bool,
    instance_changed: bool,
    modified: BTreeMap<PropTag, Value>,
    deleted_tags: BTreeSet<PropTag>,
    available_tags: BTreeSet<PropTag>,
    values: BTreeMap<PropTag, Value>,
    instance: Option<InstanceRef>,
    children: BTreeMap<ChildKey, NodeId>,
}

impl ObjectNode {
    pub fn new(kind: ObjectKind, client_id: u32) -> Self {
        ObjectNode {
            kind,
            client_id,
            server_id: 0,
            deleted: false,
            changed: false,
            instance_changed: false,
            modified: BTreeMap::new(),
            deleted_tags: BTreeSet::new(),
            available_tags: BTreeSet::new(),
            values: BTreeMap::new(),
            instance: None,
            children: BTreeMap::new(),
        }
    }

    /// Node whose body is the deduplicated instance `instance`.
    pub fn with_instance(mut self, instance: InstanceRef) -> Self {
        self.available_tags.insert(instance.tag);
        self.instance = Some(instance);
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn instance_changed(&self) -> bool {
        self.instance_changed
    }

    pub fn instance(&self) -> Option<&InstanceRef> {
        self.instance.as_ref()
    }

    pub fn modified(&self) -> impl Iterator<Item = (PropTag, &Value)> {
        self.modified.iter().map(|(t, v)| (*t, v))
    }

    pub fn modified_len(&self) -> usize {
        self.modified.len()
    }

    pub fn deleted_tags(&self) -> impl Iterator<Item = PropTag> + '_ {
        self.deleted_tags.iter().copied()
    }

    pub fn available_tags(&self) -> impl Iterator<Item = PropTag> + '_ {
        self.available_tags.iter().copied()
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub fn get_property(&self, tag: PropTag) -> Option<&Value> {
        self.modified.get(&tag).or_else(|| self.values.get(&tag))
    }

    pub fn has_property(&self, tag: PropTag) -> bool {
        !self.deleted_tags.contains(&tag)
            && (self.modified.contains_key(&tag)
                || self.values.contains_key(&tag)
                || self.available_tags.contains(&tag))
    }

    /// Every property value held locally, pending edits shadowing server state.
    pub fn properties(&self) -> BTreeMap<PropTag, Value> {
        let mut all = self.values.clone();
        all.extend(self.modified.iter().map(|(t, v)| (*t, v.clone())));
        all
    }

    fn key(&self) -> ChildKey {
        (self.kind, self.client_id)
    }
}

/// Arena holding one object and all of its sub-objects.
#[derive(Clone, Debug)]
pub struct ObjectTree {
    nodes: Vec<Option<ObjectNode>>,
    parents: HashMap<NodeId, NodeId>,
    root: NodeId,
}

impl ObjectTree {
    pub fn new(kind: ObjectKind) -> Self {
        ObjectTree::with_root(ObjectNode::new(kind, 0))
    }

    pub fn with_root(root: ObjectNode) -> Self {
        ObjectTree {
            nodes: vec![Some(root)],
            parents: HashMap::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Result<&ObjectNode> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| SyncError::InvalidArgument(format!("no node {}", id.0)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut ObjectNode> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| SyncError::InvalidArgument(format!("no node {}", id.0)))
    }

    pub fn root_node(&self) -> &ObjectNode {
        // the root slot is never freed
        match self.nodes.get(self.root.0).and_then(Option::as_ref) {
            Some(node) => node,
            None => unreachable!("object tree lost its root"),
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(&id).copied()
    }

    pub fn child(&self, parent: NodeId, kind: ObjectKind, client_id: u32) -> Option<NodeId> {
        self.node(parent)
            .ok()
            .and_then(|p| p.children.get(&(kind, client_id)).copied())
    }

    /// Lowest client id above every existing child of `kind`.
    pub fn next_client_id(&self, parent: NodeId, kind: ObjectKind) -> Result<u32> {
        let p = self.node(parent)?;
        Ok(p.children
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, c)| c + 1)
            .max()
            .unwrap_or(0))
    }

    pub fn set_property(&mut self, id: NodeId, tag: PropTag, value: Value) -> Result<()> {
        let node = self.node_mut(id)?;
        node.deleted_tags.remove(&tag);
        node.available_tags.insert(tag);
        if node.instance.as_ref().is_some_and(|i| i.tag == tag) {
            node.instance_changed = true;
        }
        node.modified.insert(tag, value);
        self.mark_changed(id)
    }

    pub fn delete_property(&mut self, id: NodeId, tag: PropTag) -> Result<()> {
        let node = self.node_mut(id)?;
        node.modified.remove(&tag);
        node.values.remove(&tag);
        node.available_tags.remove(&tag);
        node.deleted_tags.insert(tag);
        self.mark_changed(id)
    }

    pub fn get_property(&self, id: NodeId, tag: PropTag) -> Option<&Value> {
        self.node(id).ok().and_then(|n| n.get_property(tag))
    }

    pub fn has_property(&self, id: NodeId, tag: PropTag) -> bool {
        self.node(id).is_ok_and(|n| n.has_property(tag))
    }

    /// Adds `node` under `parent` as a new object to be created on next save.
    pub fn attach_child(&mut self, parent: NodeId, mut node: ObjectNode) -> Result<NodeId> {
        let key = node.key();
        if self.node(parent)?.children.contains_key(&key) {
            return Err(SyncError::InvalidArgument(format!(
                "child {:?}/{} already attached",
                key.0, key.1
            )));
        }
        node.changed = true;
        node.children.clear();
        let id = self.insert(parent, node)?;
        self.mark_changed(parent)?;
        Ok(id)
    }

    /// Unpersisted children vanish; persisted ones are kept as deleted so the
    /// next save can tell the server.
    pub fn detach_child(&mut self, parent: NodeId, kind: ObjectKind, client_id: u32) -> Result<()> {
        let id = self
            .child(parent, kind, client_id)
            .ok_or(SyncError::NotFound)?;
        if self.node(id)?.server_id == 0 {
            debug!(?kind, client_id, "dropping unsaved child");
            self.remove_subtree(id)?;
        } else {
            let child = self.node_mut(id)?;
            child.deleted = true;
        }
        self.mark_changed(parent)
    }

    /// Deep copy of the whole object as a brand-new, unsaved object.
    ///
    /// All known values become pending edits except `excluded` on the root.
    /// Instance links survive so bodies need not be resent.
    pub fn unsaved_copy(&self, excluded: &[PropTag]) -> Result<ObjectTree> {
        let root = self.root_node();
        let mut copy = ObjectTree::with_root(ObjectNode::new(root.kind, root.client_id));
        let to = copy.root;
        self.copy_into(self.root, &mut copy, to, excluded)?;
        Ok(copy)
    }

    /// Properties the server reported as present without sending a value,
    /// as `(node, server_id, tag)`. Deleted subtrees, unsaved nodes and
    /// bodies standing behind an instance link are left out.
    pub fn unloaded_properties(&self) -> Result<Vec<(NodeId, u32, PropTag)>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root];
        while let Some(id) = pending.pop() {
            let node = self.node(id)?;
            if node.deleted {
                continue;
            }
            if node.server_id != 0 {
                let instance_tag = node.instance.as_ref().map(|i| i.tag);
                out.extend(
                    node.available_tags
                        .iter()
                        .filter(|tag| {
                            Some(**tag) != instance_tag
                                && !node.values.contains_key(tag)
                                && !node.modified.contains_key(tag)
                                && !node.deleted_tags.contains(tag)
                        })
                        .map(|tag| (id, node.server_id, *tag)),
                );
            }
            pending.extend(node.children.values().copied());
        }
        Ok(out)
    }

    /// Records a value fetched from the server. Not an edit: nothing is
    /// marked changed.
    pub fn cache_value(&mut self, id: NodeId, tag: PropTag, value: Value) -> Result<()> {
        let node = self.node_mut(id)?;
        node.available_tags.insert(tag);
        node.values.insert(tag, value);
        Ok(())
    }

    fn copy_into(
        &self,
        from: NodeId,
        dest: &mut ObjectTree,
        to: NodeId,
        excluded: &[PropTag],
    ) -> Result<()> {
        let src = self.node(from)?;
        let node = dest.node_mut(to)?;
        for (tag, value) in src.properties() {
            if excluded.contains(&tag) || src.deleted_tags.contains(&tag) {
                continue;
            }
            node.available_tags.insert(tag);
            node.modified.insert(tag, value);
        }
        if let Some(instance) = &src.instance {
            node.available_tags.insert(instance.tag);
            node.instance = Some(instance.clone());
        }
        node.changed = true;
        for child in src.children() {
            let c = self.node(child)?;
            if c.deleted {
                continue;
            }
            let id = dest.insert(to, ObjectNode::new(c.kind, c.client_id))?;
            self.copy_into(child, dest, id, &[])?;
        }
        Ok(())
    }

    fn insert(&mut self, parent: NodeId, node: ObjectNode) -> Result<NodeId> {
        let key = node.key();
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        self.node_mut(parent)?.children.insert(key, id);
        self.parents.insert(id, parent);
        Ok(id)
    }

    fn remove_subtree(&mut self, id: NodeId) -> Result<()> {
        let key = self.node(id)?.key();
        if let Some(parent) = self.parents.remove(&id) {
            self.node_mut(parent)?.children.remove(&key);
        }
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(next.0).and_then(Option::take) {
                stack.extend(node.children.values().copied());
                self.parents.remove(&next);
            }
        }
        Ok(())
    }

    fn mark_changed(&mut self, id: NodeId) -> Result<()> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            self.node_mut(current)?.changed = true;
            cursor = self.parent(current);
        }
        Ok(())
    }
}
