//! The transition protocol: two-phase commit over bound outputs, then
//! deterministic propagation along the wiring graph.
//!
//! Per transition, every output observes `acquire_lock` → `change` →
//! `release_lock`, with no `change` before every lock is held. Downstream
//! machines run between the commit and release phases, so by the time a
//! caller gets control back the whole reachable closure has settled.

use std::future::Future;
use std::pin::Pin;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use crate::error::{Error, Result};
use crate::output::OutputBinding;
use crate::tree::System;
use crate::types::{Condition, Gate, GateId, Handle, LabelIx, MachineId, NodeId};

impl System {
    // ── Machine queries ──

    /// Whether the machine is currently at `label`.
    pub fn query(&self, m: MachineId, label: &str) -> Result<bool> {
        let ix = self.resolve_label(m, label)?;
        Ok(self.machine(m)?.current == Some(ix))
    }

    /// The machine's current label, or `None` while undefined.
    pub fn current(&self, m: MachineId) -> Result<Option<&str>> {
        Ok(self.machine(m)?.current_label())
    }

    /// The machine's fixed label set, in declaration order.
    pub fn labels(&self, m: MachineId) -> Result<&[String]> {
        Ok(&self.machine(m)?.labels)
    }

    /// Mint a wiring handle for `(machine, label)`.
    pub fn handle(&self, m: MachineId, label: &str) -> Result<Handle> {
        let ix = self.resolve_label(m, label)?;
        Ok(Handle { machine: m, label: ix })
    }

    fn resolve_label(&self, m: MachineId, label: &str) -> Result<LabelIx> {
        self.machine(m)?
            .label_ix(label)
            .ok_or_else(|| Error::UnknownLabel {
                machine: self.path_string(m.node()).unwrap_or_default(),
                label: label.to_string(),
            })
    }

    // ── Output binding ──

    /// Bind an output handler to the machine. Idempotent by handler
    /// identity; first-bound handlers are driven first.
    pub fn bind_output(&mut self, m: MachineId, binding: impl Into<OutputBinding>) -> Result<()> {
        let binding = binding.into();
        let mach = self.machine_mut(m)?;
        if mach
            .outputs
            .iter()
            .any(|b| b.handler_ptr() == binding.handler_ptr())
        {
            return Ok(());
        }
        mach.outputs.push(binding);
        Ok(())
    }

    // ── Wiring ──

    /// Install wiring: when any `source` machine enters its source label,
    /// `dest` transitions to `local_label`. Duplicate edges are permitted
    /// and fire once each, in insertion order.
    pub fn wire(&mut self, dest: MachineId, local_label: &str, sources: &[Handle]) -> Result<()> {
        let local = self
            .machine(dest)?
            .label_ix(local_label)
            .ok_or_else(|| Error::WiringMismatch {
                machine: self.path_string(dest.node()).unwrap_or_default(),
                label: local_label.to_string(),
            })?;
        for source in sources {
            self.check_handle(*source)?;
            let edge = Handle {
                machine: dest,
                label: local,
            };
            self.machine_mut(source.machine)?.wiring[source.label as usize].push(edge);
        }
        Ok(())
    }

    fn check_handle(&self, h: Handle) -> Result<()> {
        let mach = self.machine(h.machine)?;
        if (h.label as usize) < mach.labels.len() {
            Ok(())
        } else {
            Err(Error::WiringMismatch {
                machine: self.path_string(h.machine.node()).unwrap_or_default(),
                label: format!("#{}", h.label),
            })
        }
    }

    // ── Gates ──

    /// Register a conditional gate: whenever any input machine completes a
    /// transition, re-evaluate `condition` over the inputs and, if it
    /// holds, transition every output handle in order. The gate is
    /// evaluated once immediately; if any output's closure requires an
    /// async output, this surfaces [`Error::AsyncRequired`] before
    /// anything is registered — use [`System::add_gate_async`] instead.
    pub fn add_gate(
        &mut self,
        condition: Condition,
        inputs: &[Handle],
        outputs: &[Handle],
    ) -> Result<GateId> {
        self.validate_gate(inputs, outputs)?;
        for out in outputs {
            self.ensure_sync_closure(out.machine, out.label)?;
        }
        let id = self.register_gate(condition, inputs, outputs);
        self.eval_gate_sync(id)?;
        Ok(id)
    }

    /// [`System::add_gate`] for gates whose outputs may suspend.
    pub async fn add_gate_async(
        &mut self,
        condition: Condition,
        inputs: &[Handle],
        outputs: &[Handle],
    ) -> Result<GateId> {
        self.validate_gate(inputs, outputs)?;
        let id = self.register_gate(condition, inputs, outputs);
        self.eval_gate_async(id).await?;
        Ok(id)
    }

    fn validate_gate(&self, inputs: &[Handle], outputs: &[Handle]) -> Result<()> {
        if inputs.is_empty() || outputs.is_empty() {
            return Err(Error::EmptyGate);
        }
        for h in inputs.iter().chain(outputs) {
            self.check_handle(*h)?;
        }
        Ok(())
    }

    fn register_gate(
        &mut self,
        condition: Condition,
        inputs: &[Handle],
        outputs: &[Handle],
    ) -> GateId {
        let id = GateId(self.gates.len() as u32);
        self.gates.push(Gate {
            condition,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        let mut subscribed: Vec<MachineId> = Vec::new();
        for h in inputs {
            if !subscribed.contains(&h.machine) {
                subscribed.push(h.machine);
                if let Ok(mach) = self.machine_mut(h.machine) {
                    mach.gates.push(id);
                }
            }
        }
        id
    }

    fn gate_satisfied(&self, gate: &Gate) -> bool {
        gate.satisfied(|h| {
            self.machine(h.machine)
                .map(|m| m.current == Some(h.label))
                .unwrap_or(false)
        })
    }

    fn eval_gate_sync(&mut self, id: GateId) -> Result<()> {
        let gate = self
            .gates
            .get(id.0 as usize)
            .ok_or(Error::InvalidHandle)?
            .clone();
        if !self.gate_satisfied(&gate) {
            return Ok(());
        }
        for out in gate.outputs {
            self.apply_sync(out.machine, out.label)?;
        }
        Ok(())
    }

    async fn eval_gate_async(&mut self, id: GateId) -> Result<()> {
        let gate = self
            .gates
            .get(id.0 as usize)
            .ok_or(Error::InvalidHandle)?
            .clone();
        if !self.gate_satisfied(&gate) {
            return Ok(());
        }
        for out in gate.outputs {
            self.apply_async(out.machine, out.label).await?;
        }
        Ok(())
    }

    // ── Transition entry points ──

    /// Synchronously transition the machine to `label`.
    ///
    /// A transition to the current label is a pure no-op. Before any side
    /// effect, the wiring closure reachable from `(m, label)` is checked:
    /// if any machine in it has an output requiring cooperative
    /// suspension, the call is refused with [`Error::AsyncRequired`].
    pub fn transition(&mut self, m: MachineId, label: &str) -> Result<()> {
        let new = self.resolve_label(m, label)?;
        if self.machine(m)?.current == Some(new) {
            return Ok(());
        }
        self.ensure_sync_closure(m, new)?;
        self.apply_sync(m, new)
    }

    /// Cooperative-async variant of [`System::transition`]. Suspension
    /// points are the awaits on async outputs' lock/change/release and on
    /// downstream propagation.
    pub async fn transition_async(&mut self, m: MachineId, label: &str) -> Result<()> {
        let new = self.resolve_label(m, label)?;
        if self.machine(m)?.current == Some(new) {
            return Ok(());
        }
        self.apply_async(m, new).await
    }

    // ── Synchronous protocol ──

    fn apply_sync(&mut self, m: MachineId, new: LabelIx) -> Result<()> {
        if self.machine(m)?.current == Some(new) {
            return Ok(());
        }
        let name = self.path_string(m.node())?;
        let mach = self.machine(m)?;
        let label = mach.label(new).to_string();
        let from = mach.current_label().unwrap_or("undefined").to_string();
        let outputs = mach.outputs.clone();
        tracing::debug!(machine = %name, %from, to = %label, "transition");

        // Lock phase. On a veto, unwind the locks taken so far in reverse.
        let mut locked = 0usize;
        for binding in &outputs {
            let outcome = match binding {
                OutputBinding::Sync(h) => h.acquire_lock(&label),
                OutputBinding::Async(_) => {
                    Err(anyhow::anyhow!("output requires cooperative suspension"))
                }
            };
            match outcome {
                Ok(()) => locked += 1,
                Err(cause) => {
                    for prev in outputs[..locked].iter().rev() {
                        if let OutputBinding::Sync(h) = prev {
                            warn_on_release_failure(&name, h.release_lock());
                        }
                    }
                    return Err(match binding {
                        OutputBinding::Async(_) => Error::AsyncRequired {
                            machine: name,
                            label,
                        },
                        OutputBinding::Sync(_) => Error::LockRefused {
                            machine: name,
                            label,
                            cause,
                        },
                    });
                }
            }
        }

        // Commit phase. A handler that locked has promised change() will
        // succeed; a failure here cannot be rolled back, and the locks are
        // left in place because the physical state is no longer known.
        for binding in &outputs {
            if let OutputBinding::Sync(h) = binding {
                if let Err(cause) = h.change() {
                    return Err(Error::CommitViolation {
                        machine: name,
                        label,
                        cause,
                    });
                }
            }
        }

        self.machine_mut(m)?.current = Some(new);

        let propagated = self.propagate_sync(m, new);

        for binding in &outputs {
            if let OutputBinding::Sync(h) = binding {
                warn_on_release_failure(&name, h.release_lock());
            }
        }
        propagated
    }

    fn propagate_sync(&mut self, m: MachineId, new: LabelIx) -> Result<()> {
        let edges = self.machine(m)?.wiring[new as usize].clone();
        for edge in edges {
            self.apply_sync(edge.machine, edge.label)?;
        }
        let gates = self.machine(m)?.gates.clone();
        for gate in gates {
            self.eval_gate_sync(gate)?;
        }
        Ok(())
    }

    // ── Cooperative-async protocol ──

    fn apply_async(
        &mut self,
        m: MachineId,
        new: LabelIx,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.machine(m)?.current == Some(new) {
                return Ok(());
            }
            let name = self.path_string(m.node())?;
            let mach = self.machine(m)?;
            let label = mach.label(new).to_string();
            let from = mach.current_label().unwrap_or("undefined").to_string();
            let outputs = mach.outputs.clone();
            tracing::debug!(machine = %name, %from, to = %label, "transition (async)");

            let mut locked = 0usize;
            for binding in &outputs {
                let outcome = match binding {
                    OutputBinding::Sync(h) => h.acquire_lock(&label),
                    OutputBinding::Async(h) => h.acquire_lock(&label).await,
                };
                match outcome {
                    Ok(()) => locked += 1,
                    Err(cause) => {
                        for prev in outputs[..locked].iter().rev() {
                            release_quietly(&name, prev).await;
                        }
                        return Err(Error::LockRefused {
                            machine: name,
                            label,
                            cause,
                        });
                    }
                }
            }

            for binding in &outputs {
                let outcome = match binding {
                    OutputBinding::Sync(h) => h.change(),
                    OutputBinding::Async(h) => h.change().await,
                };
                if let Err(cause) = outcome {
                    return Err(Error::CommitViolation {
                        machine: name,
                        label,
                        cause,
                    });
                }
            }

            self.machine_mut(m)?.current = Some(new);

            let propagated = self.propagate_async(m, new).await;

            for binding in &outputs {
                release_quietly(&name, binding).await;
            }
            propagated
        })
    }

    async fn propagate_async(&mut self, m: MachineId, new: LabelIx) -> Result<()> {
        let edges = self.machine(m)?.wiring[new as usize].clone();
        for edge in edges {
            self.apply_async(edge.machine, edge.label).await?;
        }
        let gates = self.machine(m)?.gates.clone();
        for gate in gates {
            self.eval_gate_async(gate).await?;
        }
        Ok(())
    }

    // ── Async-capability closure ──

    fn ensure_sync_closure(&self, m: MachineId, new: LabelIx) -> Result<()> {
        if self.closure_requires_async(m, new) {
            return Err(Error::AsyncRequired {
                machine: self.path_string(m.node()).unwrap_or_default(),
                label: self.machine(m)?.label(new).to_string(),
            });
        }
        Ok(())
    }

    /// Static walk of the wiring closure reachable from `(m, new)`:
    /// true if any visited machine has an output requiring suspension.
    /// Diagnostic only — no pruning by current state, no side effects.
    fn closure_requires_async(&self, m: MachineId, new: LabelIx) -> bool {
        let graph = self.wiring_graph();
        let mut dfs = Dfs::new(&graph, (m.index(), new));
        while let Some((mid, _)) = dfs.next(&graph) {
            if let Ok(mach) = self.machine(MachineId(NodeId(mid))) {
                if mach.outputs.iter().any(OutputBinding::require_async) {
                    return true;
                }
            }
        }
        false
    }

    /// Every `(machine, label)` position as a graph node, with an edge per
    /// wiring entry and per gate output (a gate re-evaluates on every
    /// label its input machines can take).
    fn wiring_graph(&self) -> DiGraphMap<(u32, LabelIx), ()> {
        let mut graph = DiGraphMap::new();
        for (ix, node) in self.nodes.iter().enumerate() {
            let crate::types::NodeKind::Machine(mach) = &node.kind else {
                continue;
            };
            let mid = ix as u32;
            for l in 0..mach.labels.len() {
                graph.add_node((mid, l as LabelIx));
            }
            for (l, edges) in mach.wiring.iter().enumerate() {
                for edge in edges {
                    graph.add_edge(
                        (mid, l as LabelIx),
                        (edge.machine.index(), edge.label),
                        (),
                    );
                }
            }
            for gate_id in &mach.gates {
                let gate = &self.gates[gate_id.0 as usize];
                for l in 0..mach.labels.len() {
                    for out in &gate.outputs {
                        graph.add_edge(
                            (mid, l as LabelIx),
                            (out.machine.index(), out.label),
                            (),
                        );
                    }
                }
            }
        }
        graph
    }

    /// Report wiring cycles (strongly-connected components of size > 1,
    /// plus self-loops). Purely diagnostic: cycles are legal and are
    /// terminated at run time by the no-op shortcut.
    pub fn wiring_cycles(&self) -> Vec<Vec<Handle>> {
        let graph = self.wiring_graph();
        petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                scc.into_iter()
                    .map(|(mid, label)| Handle {
                        machine: MachineId(NodeId(mid)),
                        label,
                    })
                    .collect()
            })
            .collect()
    }
}

fn warn_on_release_failure(machine: &str, outcome: anyhow::Result<()>) {
    if let Err(error) = outcome {
        tracing::warn!(machine = %machine, %error, "release_lock failed");
    }
}

async fn release_quietly(machine: &str, binding: &OutputBinding) {
    let outcome = match binding {
        OutputBinding::Sync(h) => h.release_lock(),
        OutputBinding::Async(h) => h.release_lock().await,
    };
    warn_on_release_failure(machine, outcome);
}
