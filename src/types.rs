use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::output::OutputBinding;

// ─── Identifiers ──────────────────────────────────────────────

/// Index of a node in the system arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

/// Index of a state-machine node. Only minted for nodes of machine kind,
/// so a `MachineId` obtained from its owning [`System`](crate::System)
/// always resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(pub(crate) NodeId);

impl MachineId {
    /// The underlying tree node, for naming and tree operations.
    pub fn node(self) -> NodeId {
        self.0
    }

    pub(crate) fn index(self) -> u32 {
        self.0 .0
    }
}

/// Index into a machine's fixed label set.
pub(crate) type LabelIx = u16;

/// Identifier of a conditional gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GateId(pub(crate) u32);

// ─── Handle ───────────────────────────────────────────────────

/// A `(machine, label)` position, used as a wiring source or target.
///
/// Handles are minted by [`System::handle`](crate::System::handle) after the
/// label has been validated against the machine's set, and stay valid for
/// the lifetime of the owning system (nodes are never removed from the
/// arena).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) machine: MachineId,
    pub(crate) label: LabelIx,
}

impl Handle {
    /// The machine this handle points at.
    pub fn machine(self) -> MachineId {
        self.machine
    }
}

// ─── Tree nodes ───────────────────────────────────────────────

/// Hook invoked by `deferred_init` once the whole tree is assembled.
pub type InitHook = Box<dyn FnMut(&mut crate::System, NodeId) -> Result<()> + Send>;

pub(crate) struct ObjectNode {
    pub(crate) attrs: BTreeMap<String, serde_json::Value>,
    pub(crate) init_hook: Option<InitHook>,
}

pub(crate) enum NodeKind {
    Object(ObjectNode),
    Machine(StateMachine),
}

pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn object(name: String) -> Self {
        Node {
            name,
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Object(ObjectNode {
                attrs: BTreeMap::new(),
                init_hook: None,
            }),
        }
    }

    pub(crate) fn machine(name: String, machine: StateMachine) -> Self {
        Node {
            name,
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Machine(machine),
        }
    }
}

// ─── State machine ────────────────────────────────────────────

/// An enumerated-state entity. The label set is fixed at construction;
/// `current` changes only through a successful transition.
pub(crate) struct StateMachine {
    pub(crate) labels: Vec<String>,
    pub(crate) current: Option<LabelIx>,
    pub(crate) outputs: Vec<OutputBinding>,
    /// Outgoing wiring edges, one row per label, in insertion order.
    pub(crate) wiring: Vec<Vec<Handle>>,
    /// Gates re-evaluated after every transition of this machine.
    pub(crate) gates: Vec<GateId>,
}

impl StateMachine {
    pub(crate) fn new(labels: &[&str], default: Option<&str>) -> Result<Self> {
        if labels.is_empty() {
            return Err(Error::InvalidLabels {
                reason: "label set is empty".into(),
            });
        }
        for label in labels {
            if *label != label.to_lowercase() {
                return Err(Error::InvalidLabels {
                    reason: format!("label '{label}' is not lowercase"),
                });
            }
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(Error::InvalidLabels {
                    reason: format!("label '{label}' appears more than once"),
                });
            }
        }
        let current = match default {
            Some(d) => Some(
                labels
                    .iter()
                    .position(|l| *l == d)
                    .ok_or_else(|| Error::InvalidLabels {
                        reason: format!("default label '{d}' is not in the set"),
                    })? as LabelIx,
            ),
            None => None,
        };
        Ok(StateMachine {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            current,
            outputs: Vec::new(),
            wiring: vec![Vec::new(); labels.len()],
            gates: Vec::new(),
        })
    }

    pub(crate) fn label_ix(&self, label: &str) -> Option<LabelIx> {
        self.labels.iter().position(|l| l == label).map(|i| i as LabelIx)
    }

    pub(crate) fn label(&self, ix: LabelIx) -> &str {
        &self.labels[ix as usize]
    }

    pub(crate) fn current_label(&self) -> Option<&str> {
        self.current.map(|ix| self.label(ix))
    }
}

// ─── Gates ────────────────────────────────────────────────────

/// How a gate combines its input conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Every input machine must be at its watched label.
    All,
    /// At least one input machine must be at its watched label.
    Any,
}

#[derive(Clone)]
pub(crate) struct Gate {
    pub(crate) condition: Condition,
    pub(crate) inputs: Vec<Handle>,
    pub(crate) outputs: Vec<Handle>,
}

impl Gate {
    pub(crate) fn satisfied(&self, at_label: impl Fn(Handle) -> bool) -> bool {
        match self.condition {
            Condition::All => self.inputs.iter().all(|h| at_label(*h)),
            Condition::Any => self.inputs.iter().any(|h| at_label(*h)),
        }
    }
}
