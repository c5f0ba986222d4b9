use crate::errors::{RgError, RgResult};
use crate::graph::{Graph, OpKind};
use crate::types::{GraphId, TensorType, ValueId, ValueRef};
use std::collections::BTreeMap;

/// Which half of the rewrite the interpreter is currently emitting into.
/// Only meaningful in two-phase mode; a single shared graph never switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Forward,
    Backward,
}

/// The graphs taking part in one rewrite. Forward and backward may be the
/// same object (single-graph mode) or two distinct graphs (two-phase mode);
/// either way, lookups go through `GraphId` so that graph-qualified
/// references stay unambiguous.
pub(crate) enum GraphPair<'g> {
    Single(&'g mut Graph),
    Two {
        fwd: &'g mut Graph,
        bwd: &'g mut Graph,
    },
}

impl<'g> GraphPair<'g> {
    pub fn is_two_phase(&self) -> bool {
        matches!(self, GraphPair::Two { .. })
    }

    pub fn fwd(&self) -> &Graph {
        match self {
            GraphPair::Single(g) => g,
            GraphPair::Two { fwd, .. } => fwd,
        }
    }

    pub fn fwd_mut(&mut self) -> &mut Graph {
        match self {
            GraphPair::Single(g) => g,
            GraphPair::Two { fwd, .. } => fwd,
        }
    }

    pub fn bwd(&self) -> &Graph {
        match self {
            GraphPair::Single(g) => g,
            GraphPair::Two { bwd, .. } => bwd,
        }
    }

    pub fn bwd_mut(&mut self) -> &mut Graph {
        match self {
            GraphPair::Single(g) => g,
            GraphPair::Two { bwd, .. } => bwd,
        }
    }

    pub fn fwd_id(&self) -> GraphId {
        self.fwd().id()
    }

    pub fn bwd_id(&self) -> GraphId {
        self.bwd().id()
    }

    pub fn graph(&self, id: GraphId) -> RgResult<&Graph> {
        match self {
            GraphPair::Single(g) if g.id() == id => Ok(g),
            GraphPair::Two { fwd, .. } if fwd.id() == id => Ok(fwd),
            GraphPair::Two { bwd, .. } if bwd.id() == id => Ok(bwd),
            _ => Err(RgError::GraphMismatch {
                reason: format!("graph {:?} is not part of this rewrite", id),
            }),
        }
    }

    pub fn graph_mut(&mut self, id: GraphId) -> RgResult<&mut Graph> {
        match self {
            GraphPair::Single(g) if g.id() == id => Ok(g),
            GraphPair::Two { fwd, .. } if fwd.id() == id => Ok(fwd),
            GraphPair::Two { bwd, .. } if bwd.id() == id => Ok(bwd),
            _ => Err(RgError::GraphMismatch {
                reason: format!("graph {:?} is not part of this rewrite", id),
            }),
        }
    }

    pub fn value_name(&self, r: ValueRef) -> RgResult<String> {
        Ok(self.graph(r.graph)?.value(r.value).name().to_string())
    }

    pub fn value_ty(&self, r: ValueRef) -> RgResult<TensorType> {
        Ok(self.graph(r.graph)?.value(r.value).ty().clone())
    }

    pub fn grad_of(&self, r: ValueRef) -> RgResult<Option<ValueRef>> {
        Ok(self.graph(r.graph)?.grad(r.value))
    }

    pub fn set_grad(&mut self, r: ValueRef, grad: Option<ValueRef>) -> RgResult<()> {
        self.graph_mut(r.graph)?.set_grad(r.value, grad);
        Ok(())
    }
}

/// Handle given to the gradient emitter for one backward step. Every value it
/// wants to touch goes through `retain`, which mediates forward-to-backward
/// crossings via the retained map; nodes it emits land in the consumer graph
/// and are harvested for scheduling when the step's emission scope closes.
pub struct GradSession<'a, 'g> {
    graphs: &'a mut GraphPair<'g>,
    consumer: GraphId,
    retained: Option<&'a mut BTreeMap<ValueRef, ValueRef>>,
}

impl<'a, 'g> GradSession<'a, 'g> {
    pub(crate) fn new(
        graphs: &'a mut GraphPair<'g>,
        consumer: GraphId,
        retained: Option<&'a mut BTreeMap<ValueRef, ValueRef>>,
    ) -> Self {
        Self {
            graphs,
            consumer,
            retained,
        }
    }

    pub fn name(&self, r: ValueRef) -> RgResult<String> {
        self.graphs.value_name(r)
    }

    pub fn ty(&self, r: ValueRef) -> RgResult<TensorType> {
        self.graphs.value_ty(r)
    }

    /// The gradient currently attached to `r`, if any.
    pub fn grad(&self, r: ValueRef) -> RgResult<Option<ValueRef>> {
        self.graphs.grad_of(r)
    }

    /// Resolves `r` to a value usable inside the consumer graph. Same-graph
    /// references come back unchanged; forward-graph references resolve
    /// through the retained map, allocating a placeholder on first use. The
    /// placeholder is also registered as its own sentinel so it is never
    /// re-retained.
    pub fn retain(&mut self, r: ValueRef) -> RgResult<ValueRef> {
        if r.graph == self.consumer {
            return Ok(r);
        }
        let retained = match self.retained.as_deref_mut() {
            Some(map) => map,
            None => {
                return Err(RgError::GraphMismatch {
                    reason: format!(
                        "value from graph {:?} needed in graph {:?} without a retention conduit",
                        r.graph, self.consumer
                    ),
                })
            }
        };
        if let Some(p) = retained.get(&r) {
            return Ok(*p);
        }
        let name = format!("RetainedForRecompute_{}", self.graphs.value_name(r)?);
        let ty = self.graphs.value_ty(r)?;
        let consumer = self.graphs.graph_mut(self.consumer)?;
        let id = consumer.add_value(name, ty);
        let placeholder = consumer.value_ref(id);
        retained.insert(r, placeholder);
        retained.insert(placeholder, placeholder);
        Ok(placeholder)
    }

    /// Emits a single-output node into the consumer graph. Inputs must
    /// already be consumer-local (pass them through `retain` first).
    pub fn emit(
        &mut self,
        op: OpKind,
        inputs: &[ValueRef],
        out_name: &str,
        out_ty: TensorType,
    ) -> RgResult<ValueRef> {
        let outs = self.emit_multi(op, inputs, &[(out_name.to_string(), out_ty)])?;
        Ok(outs[0])
    }

    /// Emits a node with several outputs into the consumer graph.
    pub fn emit_multi(
        &mut self,
        op: OpKind,
        inputs: &[ValueRef],
        outs: &[(String, TensorType)],
    ) -> RgResult<Vec<ValueRef>> {
        let mut input_ids: Vec<ValueId> = Vec::with_capacity(inputs.len());
        for r in inputs {
            if r.graph != self.consumer {
                return Err(RgError::GraphMismatch {
                    reason: format!(
                        "gradient node input '{}' is not local to the consumer graph",
                        self.graphs.value_name(*r)?
                    ),
                });
            }
            input_ids.push(r.value);
        }
        let consumer = self.graphs.graph_mut(self.consumer)?;
        let mut out_ids: Vec<ValueId> = Vec::with_capacity(outs.len());
        for (name, ty) in outs {
            let fresh = consumer.fresh_name(name);
            out_ids.push(consumer.add_value(fresh, ty.clone()));
        }
        consumer.add_node(op, input_ids, out_ids.clone());
        Ok(out_ids.iter().map(|id| consumer.value_ref(*id)).collect())
    }

    /// Accumulates `grad` onto `target`: a bare set on first write, an `Add`
    /// node merging with the existing gradient afterwards.
    pub fn accumulate(&mut self, target: ValueRef, grad: ValueRef) -> RgResult<()> {
        let grad = self.retain(grad)?;
        match self.graphs.grad_of(target)? {
            None => self.graphs.set_grad(target, Some(grad)),
            Some(existing) => {
                let existing = self.retain(existing)?;
                let name = format!("{}_grad_sum", self.graphs.value_name(target)?);
                let ty = self.graphs.value_ty(grad)?;
                let sum = self.emit(OpKind::Add, &[existing, grad], &name, ty)?;
                self.graphs.set_grad(target, Some(sum))
            }
        }
    }
}
