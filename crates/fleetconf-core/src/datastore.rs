// ── Datastore interface ──
//
// The controller edits `candidate`, validates it, and commits it into
// `running`. The real engine behind this interface is external; the
// in-memory implementation here keeps one subtree per device mount
// point and honours the contract the core depends on, most importantly
// that a failed commit leaves `running` untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetconf_netconf::{XmlNode, CONTROLLER_NAMESPACE};

use crate::error::CoreError;
use crate::schema::MountedSchema;

/// The two configuration datastores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ds {
    Candidate,
    Running,
}

impl Ds {
    pub fn parse(s: &str) -> Option<Self> {
        // Accept a `ds:` prefix as sent by CLI front-ends.
        match s.strip_prefix("ds:").unwrap_or(s) {
            "candidate" | "CANDIDATE" => Some(Self::Candidate),
            "running" | "RUNNING" => Some(Self::Running),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Running => "running",
        }
    }
}

/// How a subtree is written at a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOp {
    Replace,
    Merge,
}

/// Validation depth at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateLevel {
    None,
    Full,
}

/// Adapter contract to the configuration store.
pub trait Datastore: Send {
    /// Subtree under `devices/device[name]/root`, if present.
    fn device_root(&self, ds: Ds, name: &str) -> Option<XmlNode>;

    /// Write a device mount subtree.
    fn put_device_root(&mut self, ds: Ds, name: &str, op: PutOp, root: XmlNode);

    fn device_names(&self, ds: Ds) -> Vec<String>;

    fn copy(&mut self, src: Ds, dst: Ds);

    /// Bind a compiled schema set at a device mount point.
    fn mount(&mut self, name: &str, schema: Arc<MountedSchema>);

    fn mounted(&self, name: &str) -> Option<Arc<MountedSchema>>;

    /// Commit candidate into running. A failed commit (validation or
    /// otherwise) leaves running unchanged.
    fn commit(&mut self, level: ValidateLevel) -> Result<(), CoreError>;

    /// Reset candidate from running.
    fn discard(&mut self);

    /// Whole `<devices>` tree of one datastore (service-action input).
    fn devices_tree(&self, ds: Ds) -> XmlNode;

    /// Replace device mounts from a `<devices>` tree (service-action
    /// output).
    fn apply_devices_tree(&mut self, ds: Ds, tree: &XmlNode) -> Result<(), CoreError>;
}

/// In-memory datastore keyed by device name.
#[derive(Default)]
pub struct MemDatastore {
    candidate: BTreeMap<String, XmlNode>,
    running: BTreeMap<String, XmlNode>,
    mounts: BTreeMap<String, Arc<MountedSchema>>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, ds: Ds) -> &BTreeMap<String, XmlNode> {
        match ds {
            Ds::Candidate => &self.candidate,
            Ds::Running => &self.running,
        }
    }

    fn map_mut(&mut self, ds: Ds) -> &mut BTreeMap<String, XmlNode> {
        match ds {
            Ds::Candidate => &mut self.candidate,
            Ds::Running => &mut self.running,
        }
    }
}

impl Datastore for MemDatastore {
    fn device_root(&self, ds: Ds, name: &str) -> Option<XmlNode> {
        self.map(ds).get(name).cloned()
    }

    fn put_device_root(&mut self, ds: Ds, name: &str, op: PutOp, root: XmlNode) {
        let map = self.map_mut(ds);
        match (op, map.get_mut(name)) {
            (PutOp::Merge, Some(existing)) => merge_node(existing, root),
            _ => {
                map.insert(name.to_string(), root);
            }
        }
    }

    fn device_names(&self, ds: Ds) -> Vec<String> {
        self.map(ds).keys().cloned().collect()
    }

    fn copy(&mut self, src: Ds, dst: Ds) {
        let tree = self.map(src).clone();
        *self.map_mut(dst) = tree;
    }

    fn mount(&mut self, name: &str, schema: Arc<MountedSchema>) {
        self.mounts.insert(name.to_string(), schema);
    }

    fn mounted(&self, name: &str) -> Option<Arc<MountedSchema>> {
        self.mounts.get(name).cloned()
    }

    fn commit(&mut self, level: ValidateLevel) -> Result<(), CoreError> {
        if level == ValidateLevel::Full {
            for (name, root) in &self.candidate {
                let schema = self.mounts.get(name).ok_or_else(|| {
                    CoreError::ValidateFailed {
                        device: name.clone(),
                        message: "no schema mounted".into(),
                    }
                })?;
                schema
                    .binds(root)
                    .map_err(|message| CoreError::ValidateFailed {
                        device: name.clone(),
                        message,
                    })?;
            }
        }
        self.running = self.candidate.clone();
        Ok(())
    }

    fn discard(&mut self) {
        self.candidate = self.running.clone();
    }

    fn devices_tree(&self, ds: Ds) -> XmlNode {
        let mut devices = XmlNode::element("devices", CONTROLLER_NAMESPACE);
        for (name, root) in self.map(ds) {
            devices.children.push(
                XmlNode::element("device", CONTROLLER_NAMESPACE)
                    .with_child(
                        XmlNode::element("name", CONTROLLER_NAMESPACE).with_text(name.clone()),
                    )
                    .with_child(root.clone()),
            );
        }
        devices
    }

    fn apply_devices_tree(&mut self, ds: Ds, tree: &XmlNode) -> Result<(), CoreError> {
        for device in tree.children_named("device") {
            let name = device.child_body("name").ok_or_else(|| {
                CoreError::Internal("device entry without name in devices tree".into())
            })?;
            let root = device.child("root").ok_or_else(|| {
                CoreError::Internal(format!("device {name} without root in devices tree"))
            })?;
            self.put_device_root(ds, name, PutOp::Replace, root.clone());
        }
        Ok(())
    }
}

/// Create an empty device mount root.
pub fn empty_root() -> XmlNode {
    XmlNode::element("root", CONTROLLER_NAMESPACE)
}

/// Merge `src` into `dst`: matching children recurse, leaves are
/// replaced, unmatched children are appended.
pub fn merge_node(dst: &mut XmlNode, src: XmlNode) {
    for child in src.children {
        let key = (child.name.clone(), child.child_body("name").map(String::from));
        let slot = dst.children.iter_mut().find(|c| {
            c.name == key.0 && c.child_body("name").map(String::from) == key.1
        });
        match slot {
            Some(existing) if !existing.children.is_empty() || !child.children.is_empty() => {
                merge_node(existing, child)
            }
            Some(existing) => existing.text = child.text,
            None => dst.children.push(child),
        }
    }
    if src.text.is_some() {
        dst.text = src.text;
    }
}

// ── Structural diff ──────────────────────────────────────────────────

/// Differences between two subtrees: deletions, additions, and changed
/// leaves as before/after pairs.
#[derive(Debug, Default, Clone)]
pub struct TreeDiff {
    pub deleted: Vec<XmlNode>,
    pub added: Vec<XmlNode>,
    pub changed: Vec<(XmlNode, XmlNode)>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }
}

fn same_entry(a: &XmlNode, b: &XmlNode) -> bool {
    a.name == b.name && a.namespace == b.namespace && a.child_body("name") == b.child_body("name")
}

/// Compute the structural diff of two subtrees. List entries are
/// matched by element name plus their `<name>` key.
pub fn tree_diff(old: &XmlNode, new: &XmlNode) -> TreeDiff {
    let mut diff = TreeDiff::default();
    diff_children(old, new, &mut diff);
    diff
}

fn diff_children(old: &XmlNode, new: &XmlNode, diff: &mut TreeDiff) {
    let mut used = vec![false; new.children.len()];
    for oc in &old.children {
        let found = new
            .children
            .iter()
            .enumerate()
            .find(|(i, nc)| !used[*i] && same_entry(oc, nc));
        match found {
            None => diff.deleted.push(oc.clone()),
            Some((i, nc)) => {
                used[i] = true;
                if oc == nc {
                    continue;
                }
                if oc.children.is_empty() && nc.children.is_empty() {
                    diff.changed.push((oc.clone(), nc.clone()));
                } else {
                    diff_children(oc, nc, diff);
                }
            }
        }
    }
    for (i, nc) in new.children.iter().enumerate() {
        if !used[i] {
            diff.added.push(nc.clone());
        }
    }
}

/// Build the minimal `edit-config` payload that turns `old` into `new`:
/// deletions carry `nc:operation="remove"`, additions `merge`, changed
/// leaves `replace`. Returns `None` when the trees are identical.
pub fn edit_tree(old: &XmlNode, new: &XmlNode) -> Option<XmlNode> {
    let children = edit_children(old, new);
    if children.is_empty() {
        return None;
    }
    let mut root = shallow(new);
    root.children = children;
    Some(root)
}

fn edit_children(old: &XmlNode, new: &XmlNode) -> Vec<XmlNode> {
    let mut out = Vec::new();
    let mut used = vec![false; new.children.len()];
    for oc in &old.children {
        let found = new
            .children
            .iter()
            .enumerate()
            .find(|(i, nc)| !used[*i] && same_entry(oc, nc));
        match found {
            None => {
                let mut ident = identification(oc);
                ident.set_attr("nc:operation", "remove");
                out.push(ident);
            }
            Some((i, nc)) => {
                used[i] = true;
                if oc == nc {
                    continue;
                }
                if oc.children.is_empty() && nc.children.is_empty() {
                    let mut leaf = nc.clone();
                    leaf.set_attr("nc:operation", "replace");
                    out.push(leaf);
                } else {
                    let nested = edit_children(oc, nc);
                    if !nested.is_empty() {
                        let mut sub = identification(nc);
                        sub.children.extend(nested);
                        out.push(sub);
                    }
                }
            }
        }
    }
    for (i, nc) in new.children.iter().enumerate() {
        if !used[i] {
            let mut added = nc.clone();
            added.set_attr("nc:operation", "merge");
            out.push(added);
        }
    }
    out
}

fn shallow(node: &XmlNode) -> XmlNode {
    XmlNode {
        name: node.name.clone(),
        namespace: node.namespace.clone(),
        attrs: Vec::new(),
        children: Vec::new(),
        text: None,
    }
}

/// Shallow copy plus the `<name>` list key, enough to address a node in
/// an edit.
fn identification(node: &XmlNode) -> XmlNode {
    let mut ident = shallow(node);
    if let Some(key) = node.child("name") {
        ident.children.push(key.clone());
    }
    ident
}

/// Render a human-readable diff for the `datastore-diff` RPC.
pub fn format_diff(old: Option<&XmlNode>, new: Option<&XmlNode>) -> String {
    let empty = empty_root();
    let old = old.unwrap_or(&empty);
    let new = new.unwrap_or(&empty);
    let diff = tree_diff(old, new);
    let mut out = String::new();
    for node in &diff.deleted {
        out.push_str(&format!("- {}\n", node.to_xml()));
    }
    for (before, after) in &diff.changed {
        out.push_str(&format!("- {}\n+ {}\n", before.to_xml(), after.to_xml()));
    }
    for node in &diff.added {
        out.push_str(&format!("+ {}\n", node.to_xml()));
    }
    out
}
