//! Save payloads: what goes to the server and how its echo is folded back.
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{InstanceRef, NodeId, ObjectKind, ObjectNode, ObjectTree, PropTag, PropertyValue};
use crate::error::{Result, SyncError};

/// One (sub)object as exchanged with the remote store.
///
/// Requests carry the pending delete list in `deleted_tags` and the dirty
/// properties in `properties`. Responses carry server-side values in
/// `properties` and tags that exist without a value in `available_tags`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireObject {
    pub kind: ObjectKind,
    pub client_id: u32,
    pub server_id: u32,
    pub deleted: bool,
    pub deleted_tags: Vec<PropTag>,
    pub properties: Vec<PropertyValue>,
    pub available_tags: Vec<PropTag>,
    pub instance: Option<InstanceRef>,
    pub children: Vec<WireObject>,
}

impl WireObject {
    pub fn new(kind: ObjectKind, client_id: u32, server_id: u32) -> Self {
        WireObject {
            kind,
            client_id,
            server_id,
            deleted: false,
            deleted_tags: Vec::new(),
            properties: Vec::new(),
            available_tags: Vec::new(),
            instance: None,
            children: Vec::new(),
        }
    }

    pub fn find_child(&self, kind: ObjectKind, client_id: u32) -> Option<&WireObject> {
        self.children
            .iter()
            .find(|c| c.kind == kind && c.client_id == client_id)
    }

    pub fn property(&self, tag: PropTag) -> Option<&PropertyValue> {
        self.properties.iter().find(|p| p.tag == tag)
    }
}

/// Children worth sending: dirty live ones, and deletions the server knows about.
fn is_sent(child: &ObjectNode) -> bool {
    (child.changed && !child.deleted) || (child.server_id != 0 && child.deleted)
}

impl ObjectTree {
    /// Minimal payload describing everything changed since the last save.
    pub fn to_wire(&self) -> Result<WireObject> {
        self.node_to_wire(self.root)
    }

    fn node_to_wire(&self, id: NodeId) -> Result<WireObject> {
        let node = self.node(id)?;
        let instance = node.instance.as_ref().filter(|_| !node.instance_changed);
        let skip_body = instance.map(|i| i.tag);

        let mut out = WireObject::new(node.kind, node.client_id, node.server_id);
        out.deleted = node.deleted;
        out.instance = instance.cloned();
        out.deleted_tags = node.deleted_tags.iter().copied().collect();
        out.properties = node
            .modified
            .iter()
            .filter(|(tag, _)| Some(**tag) != skip_body)
            .map(|(tag, value)| PropertyValue::new(*tag, value.clone()))
            .collect();

        if !node.deleted {
            for child in node.children.values() {
                if is_sent(self.node(*child)?) {
                    out.children.push(self.node_to_wire(*child)?);
                }
            }
        }
        Ok(out)
    }

    /// Folds a successful save response back into the tree.
    ///
    /// All-or-nothing: a sent child missing from `server` fails with
    /// `Inconsistent` before anything is touched.
    pub fn merge_response(&mut self, server: &WireObject) -> Result<()> {
        self.check_response(self.root, server)?;
        self.apply_response(self.root, server)
    }

    fn check_response(&self, id: NodeId, server: &WireObject) -> Result<()> {
        let node = self.node(id)?;
        if node.kind != server.kind {
            return Err(SyncError::Inconsistent(format!(
                "sent {:?}, server answered {:?}",
                node.kind, server.kind
            )));
        }
        if node.deleted {
            return Ok(());
        }
        for child in node.children.values() {
            let c = self.node(*child)?;
            if c.deleted || !c.changed {
                continue;
            }
            let answer = server.find_child(c.kind, c.client_id).ok_or_else(|| {
                SyncError::Inconsistent(format!(
                    "server response lacks {:?} with client id {}",
                    c.kind, c.client_id
                ))
            })?;
            self.check_response(*child, answer)?;
        }
        Ok(())
    }

    fn apply_response(&mut self, id: NodeId, server: &WireObject) -> Result<()> {
        let node = self.node_mut(id)?;
        node.server_id = server.server_id;
        node.deleted_tags.clear();
        let accepted = std::mem::take(&mut node.modified);
        node.values.extend(accepted);
        node.changed = false;
        node.instance_changed = false;
        for prop in &server.properties {
            node.available_tags.insert(prop.tag);
            node.values.insert(prop.tag, prop.value.clone());
        }
        node.available_tags.extend(server.available_tags.iter().copied());
        node.instance = server.instance.clone();
        trace!(kind = ?node.kind, server_id = node.server_id, "merged");

        if node.deleted {
            return Ok(());
        }
        let children: Vec<NodeId> = node.children.values().copied().collect();
        for child in children {
            let c = self.node(child)?;
            if c.deleted {
                debug!(kind = ?c.kind, client_id = c.client_id, "child delete committed");
                self.remove_subtree(child)?;
                continue;
            }
            if !c.changed {
                continue;
            }
            // presence checked in check_response
            let Some(answer) = server.find_child(c.kind, c.client_id) else {
                return Err(SyncError::Inconsistent("child vanished during merge".into()));
            };
            self.apply_response(child, answer)?;
        }
        Ok(())
    }

    /// Builds a fresh tree from a server load response.
    ///
    /// Attachments and recipients (and any other kind) are numbered from
    /// independent per-kind counters starting at 0.
    pub fn from_wire(wire: &WireObject) -> Result<ObjectTree> {
        let mut tree = ObjectTree::with_root(loaded_node(wire, 0));
        tree.load_children(tree.root, wire)?;
        Ok(tree)
    }

    fn load_children(&mut self, parent: NodeId, wire: &WireObject) -> Result<()> {
        let mut counters: std::collections::BTreeMap<ObjectKind, u32> = Default::default();
        for child in &wire.children {
            let counter = counters.entry(child.kind).or_insert(0);
            let id = self.insert(parent, loaded_node(child, *counter))?;
            *counter += 1;
            self.load_children(id, child)?;
        }
        Ok(())
    }

    /// Puts deduplicated bodies back into the payload after the server
    /// rejected an instance reference. Returns whether anything changed.
    pub fn inline_instances(&mut self) -> Result<bool> {
        let mut pending = vec![self.root];
        let mut inlined = false;
        while let Some(id) = pending.pop() {
            let node = self.node_mut(id)?;
            if let Some(instance) = node.instance.clone() {
                if !node.modified.contains_key(&instance.tag) {
                    let body = node.values.get(&instance.tag).cloned().ok_or_else(|| {
                        SyncError::Inconsistent(format!(
                            "instance {} has no local body",
                            instance.id
                        ))
                    })?;
                    node.modified.insert(instance.tag, body);
                }
                node.instance_changed = true;
                inlined = true;
            }
            if node.deleted {
                continue;
            }
            let node = self.node(id)?;
            for child in node.children.values() {
                if is_sent(self.node(*child)?) {
                    pending.push(*child);
                }
            }
        }
        Ok(inlined)
    }
}

fn loaded_node(wire: &WireObject, client_id: u32) -> ObjectNode {
    let mut node = ObjectNode::new(wire.kind, client_id);
    node.server_id = wire.server_id;
    for prop in &wire.properties {
        node.available_tags.insert(prop.tag);
        node.values.insert(prop.tag, prop.value.clone());
    }
    node.available_tags.extend(wire.available_tags.iter().copied());
    if let Some(instance) = &wire.instance {
        node.available_tags.insert(instance.tag);
    }
    node.instance = wire.instance.clone();
    node
}
