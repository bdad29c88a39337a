use std::fmt;

use crate::error::{Error, Result};
use crate::types::{
    Gate, InitHook, MachineId, Node, NodeId, NodeKind, StateMachine,
};

/// The single owner of a tree of named objects and the state machines
/// living on it.
///
/// All nodes are arena-allocated; [`NodeId`] and [`MachineId`] are indices
/// into the arena, so parent back-references and wiring handles can never
/// dangle while the system is alive. Nodes are never removed — destruction
/// is recursive from the root when the system is dropped.
///
/// The system is single-writer: every mutation goes through `&mut self`,
/// so outputs and wiring tables cannot change while a transition is in
/// flight.
pub struct System {
    pub(crate) nodes: Vec<Node>,
    pub(crate) gates: Vec<Gate>,
    root: NodeId,
}

impl System {
    /// Create a system with a root object of the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = Vec::new();
        nodes.push(Node::object(name.into()));
        System {
            nodes,
            gates: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    // ── Node construction ──

    /// Create a detached object node. Attach it with [`System::add_child`].
    pub fn new_object(&mut self, name: impl Into<String>) -> NodeId {
        self.push(Node::object(name.into()))
    }

    /// Create a detached state machine. `labels` is the fixed label set
    /// (lowercase, distinct, non-empty); `default` is the initial label,
    /// or `None` to start undefined.
    pub fn new_machine(
        &mut self,
        name: impl Into<String>,
        labels: &[&str],
        default: Option<&str>,
    ) -> Result<MachineId> {
        let machine = StateMachine::new(labels, default)?;
        let id = self.push(Node::machine(name.into(), machine));
        Ok(MachineId(id))
    }

    /// Create an object and attach it to `parent` in one step.
    pub fn add_object(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        let id = self.new_object(name);
        self.add_child(parent, name, id)?;
        Ok(id)
    }

    /// Create a machine and attach it to `parent` in one step.
    pub fn add_machine(
        &mut self,
        parent: NodeId,
        name: &str,
        labels: &[&str],
        default: Option<&str>,
    ) -> Result<MachineId> {
        let id = self.new_machine(name, labels, default)?;
        self.add_child(parent, name, id.node())?;
        Ok(id)
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    // ── Tree operations ──

    /// Attach `child` under `parent` as `name`.
    ///
    /// Fails with [`Error::NameConflict`] if `name` is already a child or
    /// attribute of `parent`, renames the child to `name` on success, and
    /// makes it reachable from the parent in insertion order.
    pub fn add_child(&mut self, parent: NodeId, name: &str, child: NodeId) -> Result<()> {
        let parent_node = self.node(parent)?;
        let NodeKind::Object(obj) = &parent_node.kind else {
            return Err(Error::NotAContainer {
                path: self.path_string(parent)?,
            });
        };
        let conflict = obj.attrs.contains_key(name)
            || parent_node
                .children
                .iter()
                .any(|c| self.nodes[c.0 as usize].name == name);
        if conflict {
            return Err(Error::NameConflict {
                parent: self.path_string(parent)?,
                name: name.to_string(),
            });
        }
        let child_node = self.node(child)?;
        if let Some(existing) = child_node.parent {
            return Err(Error::AlreadyAttached {
                parent: self.path_string(existing)?,
                name: child_node.name.clone(),
            });
        }
        // Walk up from the parent; finding the child there would close a loop.
        let mut cursor = Some(parent);
        while let Some(c) = cursor {
            if c == child {
                return Err(Error::WouldCycle {
                    name: name.to_string(),
                });
            }
            cursor = self.nodes[c.0 as usize].parent;
        }

        let child_node = &mut self.nodes[child.0 as usize];
        child_node.parent = Some(parent);
        child_node.name = name.to_string();
        self.nodes[parent.0 as usize].children.push(child);
        Ok(())
    }

    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(&self.node(id)?.name)
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(id)?.parent)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.node(id)?.children)
    }

    /// Root-to-self sequence of names.
    pub fn path(&self, id: NodeId) -> Result<Vec<&str>> {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            let node = self.node(c)?;
            names.push(node.name.as_str());
            cursor = node.parent;
        }
        names.reverse();
        Ok(names)
    }

    /// `path` joined by `.`.
    pub fn path_string(&self, id: NodeId) -> Result<String> {
        Ok(self.path(id)?.join("."))
    }

    // ── Attributes ──

    /// Set an attribute on an object node. Overwriting an existing
    /// attribute is allowed; shadowing a child name is a conflict.
    pub fn set_attr(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let key = key.into();
        let node = self.node(id)?;
        if matches!(node.kind, NodeKind::Machine(_)) {
            return Err(Error::NotAContainer {
                path: self.path_string(id)?,
            });
        }
        if node
            .children
            .iter()
            .any(|c| self.nodes[c.0 as usize].name == key)
        {
            return Err(Error::NameConflict {
                parent: self.path_string(id)?,
                name: key,
            });
        }
        if let NodeKind::Object(obj) = &mut self.nodes[id.0 as usize].kind {
            obj.attrs.insert(key, value);
        }
        Ok(())
    }

    pub fn attr(&self, id: NodeId, key: &str) -> Result<Option<&serde_json::Value>> {
        match &self.node(id)?.kind {
            NodeKind::Object(obj) => Ok(obj.attrs.get(key)),
            NodeKind::Machine(_) => Err(Error::NotAContainer {
                path: self.path_string(id)?,
            }),
        }
    }

    // ── Deferred initialization ──

    /// Install a hook to run during [`System::deferred_init`]. Hooks exist
    /// because a child's setup may need to read attributes its parent only
    /// finalizes after the children were installed.
    pub fn set_init_hook(&mut self, id: NodeId, hook: InitHook) -> Result<()> {
        if matches!(self.node(id)?.kind, NodeKind::Machine(_)) {
            return Err(Error::NotAContainer {
                path: self.path_string(id)?,
            });
        }
        if let NodeKind::Object(obj) = &mut self.nodes[id.0 as usize].kind {
            obj.init_hook = Some(hook);
        }
        Ok(())
    }

    /// Run every descendant's init hook in pre-order (a parent's hook
    /// fires before its descendants'). The node's own hook is not run:
    /// by the time the top of a tree is constructed, its children already
    /// exist. Each hook fires exactly once per call; the first failure
    /// stops the walk and surfaces.
    pub fn deferred_init(&mut self, from: NodeId) -> Result<()> {
        let order = self.descendants(from)?;
        for id in order {
            let hook = match &mut self.nodes[id.0 as usize].kind {
                NodeKind::Object(obj) => obj.init_hook.take(),
                NodeKind::Machine(_) => None,
            };
            if let Some(mut hook) = hook {
                let outcome = hook(self, id);
                if let NodeKind::Object(obj) = &mut self.nodes[id.0 as usize].kind {
                    if obj.init_hook.is_none() {
                        obj.init_hook = Some(hook);
                    }
                }
                outcome?;
            }
        }
        Ok(())
    }

    /// Pre-order descendants of `from`, excluding `from` itself. The set
    /// is snapshotted up front, so nodes attached by a hook mid-walk are
    /// not visited in the same call.
    fn descendants(&self, from: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(from)?.children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.node(id)?.children.iter().rev().copied());
        }
        Ok(out)
    }

    // ── Arena accessors ──

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0 as usize).ok_or(Error::InvalidHandle)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id.0 as usize).ok_or(Error::InvalidHandle)
    }

    pub(crate) fn machine(&self, id: MachineId) -> Result<&StateMachine> {
        match &self.node(id.0)?.kind {
            NodeKind::Machine(m) => Ok(m),
            NodeKind::Object(_) => Err(Error::InvalidHandle),
        }
    }

    pub(crate) fn machine_mut(&mut self, id: MachineId) -> Result<&mut StateMachine> {
        match &mut self.node_mut(id.0)?.kind {
            NodeKind::Machine(m) => Ok(m),
            NodeKind::Object(_) => Err(Error::InvalidHandle),
        }
    }

    // ── Rendering ──

    /// Displayable view of one node: objects render as
    /// `<dotted.path child1 child2 …>`, machines as `name=[l0, L1, …]`
    /// with the current label upper-cased.
    pub fn display(&self, id: NodeId) -> NodeDisplay<'_> {
        NodeDisplay { system: self, id }
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display(self.root).fmt(f)
    }
}

pub struct NodeDisplay<'a> {
    system: &'a System,
    id: NodeId,
}

impl fmt::Display for NodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = match self.system.node(self.id) {
            Ok(node) => node,
            Err(_) => return write!(f, "<invalid>"),
        };
        match &node.kind {
            NodeKind::Machine(m) => {
                write!(f, "{}=[", node.name)?;
                for (ix, label) in m.labels.iter().enumerate() {
                    if ix > 0 {
                        f.write_str(", ")?;
                    }
                    if m.current == Some(ix as crate::types::LabelIx) {
                        f.write_str(&label.to_uppercase())?;
                    } else {
                        f.write_str(label)?;
                    }
                }
                f.write_str("]")
            }
            NodeKind::Object(_) => {
                let path = self.system.path(self.id).unwrap_or_default().join(".");
                write!(f, "<{path}")?;
                for child in &node.children {
                    write!(f, " {}", self.system.display(*child))?;
                }
                f.write_str(">")
            }
        }
    }
}
