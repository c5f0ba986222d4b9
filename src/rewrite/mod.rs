mod context;
mod scheduler;

pub use context::GradSession;

use crate::errors::{RgError, RgResult};
use crate::gradients::{GradientEmitter, StandardGradients};
use crate::graph::{topology, Graph, OpKind};
use crate::schedule::Order;
use crate::types::{GraphId, NodeId, NodeRef, ValueId, ValueRef};
use context::{GraphPair, Phase};
use ndarray::{ArrayD, IxDyn};
use scheduler::{Scheduler, MAIN_ORDER_OFFSET, RETAIN_ORDER_OFFSET};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// What to do when a floating-point parameter ends the rewrite without a
/// gradient (batch-normalization statistics are always tolerated silently).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingParamGrad {
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    pub missing_param_grad: MissingParamGrad,
}

/// A graph can be rewritten only when every value needed for its outputs has
/// a resolved byte size.
pub fn is_supported(graph: &Graph) -> bool {
    graph
        .necessary_values()
        .iter()
        .all(|&v| graph.value(v).ty().nbytes().is_some())
}

/// Rewrites forward graphs into scheduled forward+backward training graphs,
/// following an externally planned order of compute/forget steps.
pub struct TrainingRewriter {
    emitter: Box<dyn GradientEmitter>,
    options: RewriteOptions,
}

impl Default for TrainingRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingRewriter {
    pub fn new() -> Self {
        Self {
            emitter: Box::new(StandardGradients),
            options: RewriteOptions::default(),
        }
    }

    /// Uses a caller-supplied gradient emitter instead of the built-in one.
    pub fn with_emitter(emitter: Box<dyn GradientEmitter>) -> Self {
        Self {
            emitter,
            options: RewriteOptions::default(),
        }
    }

    pub fn options(mut self, options: RewriteOptions) -> Self {
        self.options = options;
        self
    }

    /// Single-graph mode: forward and backward share one graph. Returns
    /// `Ok(false)` without mutation when the graph is unsupported.
    pub fn rewrite_with_orders(&self, graph: &mut Graph, orders: &[Order]) -> RgResult<bool> {
        if !is_supported(graph) {
            return Ok(false);
        }
        let mut graphs = GraphPair::Single(graph);
        RewritePass::new(self.emitter.as_ref(), &self.options).run(&mut graphs, orders)?;
        Ok(true)
    }

    /// Two-phase mode: forward and backward are distinct graphs connected by
    /// retained-value plumbing.
    pub fn rewrite_with_orders_two_phase(
        &self,
        fwd: &mut Graph,
        bwd: &mut Graph,
        orders: &[Order],
    ) -> RgResult<bool> {
        if !is_supported(fwd) || !is_supported(bwd) {
            return Ok(false);
        }
        let mut graphs = GraphPair::Two { fwd, bwd };
        RewritePass::new(self.emitter.as_ref(), &self.options).run(&mut graphs, orders)?;
        Ok(true)
    }
}

/// State for one rewrite invocation; discarded at return.
struct RewritePass<'p> {
    emitter: &'p dyn GradientEmitter,
    options: &'p RewriteOptions,
    /// Original value -> value currently holding its materialization.
    staged: BTreeMap<ValueRef, ValueRef>,
    /// Forward value -> backward placeholder carrying it across the boundary.
    /// Self-mapped entries are sentinels for values that must never be
    /// retained themselves.
    retained: BTreeMap<ValueRef, ValueRef>,
    /// Forward nodes whose first computation has been emitted.
    scheduled_forward: BTreeSet<NodeId>,
    scheduler: Scheduler,
    phase: Phase,
    num_forwards: usize,
    num_recomputes: usize,
    num_forgets: usize,
}

impl<'p> RewritePass<'p> {
    fn new(emitter: &'p dyn GradientEmitter, options: &'p RewriteOptions) -> Self {
        Self {
            emitter,
            options,
            staged: BTreeMap::new(),
            retained: BTreeMap::new(),
            scheduled_forward: BTreeSet::new(),
            scheduler: Scheduler::new(),
            phase: Phase::Forward,
            num_forwards: 0,
            num_recomputes: 0,
            num_forgets: 0,
        }
    }

    fn run<'g>(&mut self, graphs: &mut GraphPair<'g>, orders: &[Order]) -> RgResult<()> {
        for &v in graphs.fwd().inputs() {
            let r = graphs.fwd().value_ref(v);
            self.staged.insert(r, r);
        }

        if !graphs.is_two_phase() {
            let fwd_id = graphs.fwd_id();
            self.scoped(graphs, fwd_id, MAIN_ORDER_OFFSET, |pass, graphs| {
                pass.seed_initial_gradients(graphs)
            })?;
        }

        for (i, order) in orders.iter().enumerate() {
            debug!(index = i, entry = %order, "dispatching order entry");
            if graphs.is_two_phase() && self.phase == Phase::Forward {
                let fwd = graphs.fwd();
                let all_staged = fwd
                    .outputs()
                    .iter()
                    .all(|&v| self.staged.contains_key(&fwd.value_ref(v)));
                if all_staged {
                    self.transition(graphs)?;
                }
            }
            match *order {
                Order::ComputeForward { node } => self.compute_forward(graphs, node)?,
                Order::ComputeBackward { node } => self.compute_backward(graphs, node)?,
                Order::ForgetForward { value } => self.forget_forward(graphs, value)?,
                Order::ForgetBackward { value } => {
                    trace!(value = value.0, "forget-backward entry ignored");
                }
            }
        }

        debug!(
            num_forwards = self.num_forwards,
            num_recomputes = self.num_recomputes,
            num_forgets = self.num_forgets,
            num_retained = self.retained.len(),
            "schedule interpreted"
        );

        // Retained transport must run before anything else in the backward
        // graph, so its scope uses the small ordering offset.
        let fwd_id = graphs.fwd_id();
        let bwd_id = graphs.bwd_id();
        self.scoped(graphs, fwd_id, MAIN_ORDER_OFFSET, |pass, graphs| {
            pass.scoped(graphs, bwd_id, RETAIN_ORDER_OFFSET, |pass, graphs| {
                pass.add_retained_parts(graphs)
            })
        })?;
        self.scoped(graphs, bwd_id, MAIN_ORDER_OFFSET, |pass, graphs| {
            pass.expose_param_grads(graphs)
        })?;

        graphs.fwd_mut().reset_gradients();
        graphs.bwd_mut().reset_gradients();
        Ok(())
    }

    /// Runs `f`, then harvests the nodes it appended to the given graph,
    /// topologically sorts them, and assigns their execution ranks. The
    /// harvest happens whether or not the body succeeded; this is the only
    /// way emitted nodes acquire an order.
    fn scoped<'g, F>(
        &mut self,
        graphs: &mut GraphPair<'g>,
        side: GraphId,
        offset: i64,
        f: F,
    ) -> RgResult<()>
    where
        F: FnOnce(&mut Self, &mut GraphPair<'g>) -> RgResult<()>,
    {
        let start = graphs.graph(side)?.num_nodes();
        let body = f(self, graphs);
        let harvested = self.schedule_added(graphs, side, start, offset);
        body.and(harvested)
    }

    fn schedule_added(
        &mut self,
        graphs: &mut GraphPair<'_>,
        side: GraphId,
        start: usize,
        offset: i64,
    ) -> RgResult<()> {
        let sorted = {
            let g = graphs.graph(side)?;
            let added: Vec<NodeId> = (start..g.num_nodes()).map(NodeId).collect();
            if added.is_empty() {
                return Ok(());
            }
            let (ext_inputs, _, _) = topology::classify_values(g, &added);
            topology::topological_sort(g, &added, &ext_inputs, false)?
        };
        for n in sorted {
            let r = NodeRef {
                graph: side,
                node: n,
            };
            self.scheduler
                .schedule(graphs, r, r, offset, &mut self.staged)?;
        }
        Ok(())
    }

    /// Single-graph mode: seed the lone output with a constant-one gradient.
    fn seed_initial_gradients(&mut self, graphs: &mut GraphPair<'_>) -> RgResult<()> {
        let g = graphs.fwd_mut();
        if g.outputs().len() != 1 {
            return Err(RgError::SeedRequiresSingleOutput {
                count: g.outputs().len(),
            });
        }
        let out = g.outputs()[0];
        let (name, ty) = {
            let v = g.value(out);
            (v.name().to_string(), v.ty().clone())
        };
        let elements = ty.elements.ok_or_else(|| RgError::InvalidRef {
            reason: format!("output '{}' has an unresolved type", name),
        })?;
        if g.grad(out).is_some() {
            return Err(RgError::PhaseViolation {
                reason: format!("output '{}' already carries a gradient", name),
            });
        }
        let data = ArrayD::from_elem(IxDyn(&[elements]), 1.0f32);
        let cname = g.fresh_name(&format!("GradIn_{}", name));
        let cv = g.add_value(cname, ty);
        g.add_node(OpKind::Constant { value: data }, vec![], vec![cv]);
        let cref = g.value_ref(cv);
        g.set_grad(out, Some(cref));
        Ok(())
    }

    /// Two-phase flip: seed backward gradient inputs and rewrite every staged
    /// entry to a backward-graph placeholder, recording the retention pairs.
    fn transition<'g>(&mut self, graphs: &mut GraphPair<'g>) -> RgResult<()> {
        debug!("all forward outputs staged, switching to the backward graph");
        self.phase = Phase::Backward;
        let fwd_id = graphs.fwd_id();
        let bwd_id = graphs.bwd_id();
        self.scoped(graphs, fwd_id, MAIN_ORDER_OFFSET, |pass, graphs| {
            pass.scoped(graphs, bwd_id, MAIN_ORDER_OFFSET, |pass, graphs| {
                let outputs = graphs.fwd().outputs().to_vec();
                for v in outputs {
                    let (name, ty) = {
                        let val = graphs.fwd().value(v);
                        (format!("grad_in@{}", val.name()), val.ty().clone())
                    };
                    let g = graphs.bwd_mut().add_input_value(name, ty);
                    let gref = graphs.bwd().value_ref(g);
                    graphs.fwd_mut().set_grad(v, Some(gref));
                }

                let staged_keys: Vec<ValueRef> = pass.staged.keys().copied().collect();
                for orig in staged_keys {
                    let (name, ty, is_output, grad) = {
                        let g = graphs.graph(orig.graph)?;
                        let val = g.value(orig.value);
                        (
                            format!("RetainedForRecompute_{}", val.name()),
                            val.ty().clone(),
                            val.is_output(),
                            val.grad(),
                        )
                    };
                    let p = graphs.bwd_mut().add_value(name, ty);
                    let pref = graphs.bwd().value_ref(p);
                    pass.staged.insert(orig, pref);
                    pass.retained.insert(orig, pref);
                    pass.retained.insert(pref, pref);
                    // A retained forward output hands its incoming gradient
                    // to the placeholder standing in for it.
                    if is_output {
                        graphs.bwd_mut().set_grad(p, grad);
                    }
                }
                Ok(())
            })
        })
    }

    fn compute_forward(&mut self, graphs: &mut GraphPair<'_>, node: NodeId) -> RgResult<()> {
        let fwd_id = graphs.fwd_id();
        if node.0 >= graphs.fwd().num_nodes() {
            return Err(RgError::InvalidRef {
                reason: format!("forward node #{} does not exist", node.0),
            });
        }
        let orig_ref = NodeRef {
            graph: fwd_id,
            node,
        };

        if self.scheduled_forward.insert(node) {
            self.num_forwards += 1;
            if graphs.is_two_phase() && self.phase == Phase::Backward {
                return Err(RgError::PhaseViolation {
                    reason: format!(
                        "first forward of node #{} after the backward transition",
                        node.0
                    ),
                });
            }
            // Pure forward region: every input must be staged as itself.
            let inputs = graphs.fwd().node(node).inputs().to_vec();
            for v in inputs {
                let r = graphs.fwd().value_ref(v);
                match self.staged.get(&r) {
                    None => {
                        return Err(RgError::UnstagedValue {
                            name: graphs.fwd().value(v).name().to_string(),
                        })
                    }
                    Some(s) if *s != r => {
                        return Err(RgError::PhaseViolation {
                            reason: format!(
                                "first forward of node #{} consumes recomputed value '{}'",
                                node.0,
                                graphs.fwd().value(v).name()
                            ),
                        })
                    }
                    Some(_) => {}
                }
            }
            self.scheduler
                .schedule(graphs, orig_ref, orig_ref, MAIN_ORDER_OFFSET, &mut self.staged)
        } else {
            self.num_recomputes += 1;
            if graphs.is_two_phase() && self.phase == Phase::Forward {
                return Err(RgError::PhaseViolation {
                    reason: format!(
                        "recomputation of node #{} before the backward phase",
                        node.0
                    ),
                });
            }
            let staged_inputs =
                self.staged_values(graphs, fwd_id, &graphs.fwd().node(node).inputs().to_vec())?;
            let bwd_id = graphs.bwd_id();
            for s in &staged_inputs {
                if s.graph != bwd_id {
                    return Err(RgError::GraphMismatch {
                        reason: format!(
                            "staged input '{}' for a recompute is not in the backward graph",
                            graphs.value_name(*s)?
                        ),
                    });
                }
            }

            // Recomputed outputs are fresh values; they go into the retained
            // map as self-sentinels so they are never retained themselves.
            let (op, out_descs) = {
                let g = graphs.fwd();
                let n = g.node(node);
                let descs: Vec<_> = n
                    .outputs()
                    .iter()
                    .map(|&o| {
                        let v = g.value(o);
                        (format!("Recompute{}", v.name()), v.ty().clone())
                    })
                    .collect();
                (n.op().clone(), descs)
            };
            let is_batch_norm = matches!(op, OpKind::BatchNormalization { .. });
            let input_ids: Vec<ValueId> = staged_inputs.iter().map(|s| s.value).collect();
            let bwd = graphs.bwd_mut();
            let mut out_ids = Vec::with_capacity(out_descs.len());
            for (name, ty) in out_descs {
                let fresh = bwd.fresh_name(&name);
                out_ids.push(bwd.add_value(fresh, ty));
            }
            let new_node = bwd.add_node(op, input_ids, out_ids.clone());
            for &o in &out_ids {
                let r = ValueRef {
                    graph: bwd_id,
                    value: o,
                };
                self.retained.insert(r, r);
            }
            let clone_ref = NodeRef {
                graph: bwd_id,
                node: new_node,
            };
            self.scheduler
                .schedule(graphs, clone_ref, orig_ref, MAIN_ORDER_OFFSET, &mut self.staged)?;
            // Tell the executor the original must skip stateful updates now
            // that a recomputing clone exists.
            if is_batch_norm {
                graphs.fwd_mut().node_mut(node).set_in_recomputing(true);
            }
            Ok(())
        }
    }

    fn compute_backward<'g>(&mut self, graphs: &mut GraphPair<'g>, node: NodeId) -> RgResult<()> {
        if graphs.is_two_phase() && self.phase == Phase::Forward {
            return Err(RgError::PhaseViolation {
                reason: format!("backward of node #{} before the backward phase", node.0),
            });
        }
        let fwd_id = graphs.fwd_id();
        let bwd_id = graphs.bwd_id();
        if node.0 >= graphs.fwd().num_nodes() {
            return Err(RgError::InvalidRef {
                reason: format!("forward node #{} does not exist", node.0),
            });
        }
        let orig_ref = NodeRef {
            graph: fwd_id,
            node,
        };
        let m = self
            .scheduler
            .last_forward(orig_ref)
            .ok_or_else(|| RgError::MissingLastForward {
                node: graphs.fwd().node(node).op().name().to_string(),
            })?;

        // Gradient emission targets the freshest materialization; copy the
        // original wiring's gradients over so accumulation continues there.
        if m != orig_ref {
            let orig_inputs = graphs.fwd().node(node).inputs().to_vec();
            let orig_outputs = graphs.fwd().node(node).outputs().to_vec();
            let m_inputs = graphs.graph(m.graph)?.node(m.node).inputs().to_vec();
            let m_outputs = graphs.graph(m.graph)?.node(m.node).outputs().to_vec();
            for (&mv, &ov) in m_inputs.iter().zip(orig_inputs.iter()) {
                let g = graphs.fwd().grad(ov);
                graphs.graph_mut(m.graph)?.set_grad(mv, g);
            }
            for (&mv, &ov) in m_outputs.iter().zip(orig_outputs.iter()) {
                let g = graphs.fwd().grad(ov);
                graphs.graph_mut(m.graph)?.set_grad(mv, g);
            }
        }

        let staged_inputs =
            self.staged_values(graphs, fwd_id, &graphs.fwd().node(node).inputs().to_vec())?;
        let staged_outputs =
            self.staged_values(graphs, fwd_id, &graphs.fwd().node(node).outputs().to_vec())?;
        let op = graphs.fwd().node(node).op().clone();

        // Only a backward step for a node still living in the forward graph
        // may register new retained crossings.
        let use_retained = graphs.is_two_phase() && m == orig_ref;
        let emitter = self.emitter;
        let sess_inputs = staged_inputs.clone();
        let sess_outputs = staged_outputs.clone();
        self.scoped(graphs, bwd_id, MAIN_ORDER_OFFSET, move |pass, graphs| {
            let retained = if use_retained {
                Some(&mut pass.retained)
            } else {
                None
            };
            let mut sess = GradSession::new(graphs, bwd_id, retained);
            emitter.emit_grad(&mut sess, &op, &sess_inputs, &sess_outputs)
        })?;

        // Propagate accumulated gradients back onto the original inputs.
        let orig_inputs = graphs.fwd().node(node).inputs().to_vec();
        for (&ov, sv) in orig_inputs.iter().zip(staged_inputs.iter()) {
            let g = graphs.graph(sv.graph)?.grad(sv.value);
            graphs.fwd_mut().set_grad(ov, g);
        }
        Ok(())
    }

    fn forget_forward(&mut self, graphs: &GraphPair<'_>, value: ValueId) -> RgResult<()> {
        self.num_forgets += 1;
        if value.0 >= graphs.fwd().num_values() {
            return Err(RgError::InvalidRef {
                reason: format!("forward value #{} does not exist", value.0),
            });
        }
        let r = graphs.fwd().value_ref(value);
        if self.staged.remove(&r).is_none() {
            return Err(RgError::UnstagedValue {
                name: graphs.fwd().value(value).name().to_string(),
            });
        }
        Ok(())
    }

    fn staged_values(
        &self,
        graphs: &GraphPair<'_>,
        graph_id: GraphId,
        values: &[ValueId],
    ) -> RgResult<Vec<ValueRef>> {
        let mut out = Vec::with_capacity(values.len());
        for &v in values {
            let r = ValueRef {
                graph: graph_id,
                value: v,
            };
            match self.staged.get(&r) {
                Some(s) => out.push(*s),
                None => {
                    return Err(RgError::UnstagedValue {
                        name: graphs.graph(graph_id)?.value(v).name().to_string(),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Materializes every non-self retained pair as a forward output feeding
    /// a backward input of the same name, bridged by identity nodes.
    fn add_retained_parts(&mut self, graphs: &mut GraphPair<'_>) -> RgResult<()> {
        let fwd_id = graphs.fwd_id();
        let bwd_id = graphs.bwd_id();
        let pairs: Vec<(ValueRef, ValueRef)> = self
            .retained
            .iter()
            .filter(|(s, d)| s != d)
            .map(|(s, d)| (*s, *d))
            .collect();
        for (src, dst) in pairs {
            if src.graph != fwd_id || dst.graph != bwd_id {
                return Err(RgError::GraphMismatch {
                    reason: format!(
                        "retained pair '{}' -> '{}' crosses unexpected graphs",
                        graphs.value_name(src)?,
                        graphs.value_name(dst)?
                    ),
                });
            }
            let (name, src_ty) = {
                let v = graphs.fwd().value(src.value);
                (format!("retained_{}", v.name()), v.ty().clone())
            };
            let dst_ty = graphs.bwd().value(dst.value).ty().clone();
            let fwd = graphs.fwd_mut();
            let out = fwd.add_output_value(name.clone(), src_ty);
            fwd.add_node(OpKind::Identity, vec![src.value], vec![out]);
            let bwd = graphs.bwd_mut();
            let input = bwd.add_input_value(name, dst_ty);
            bwd.add_node(OpKind::Identity, vec![input], vec![dst.value]);
        }
        Ok(())
    }

    /// Exposes the gradient of every floating-point parameter as a backward
    /// output. Parameters feeding only a BatchNormalization node may lack
    /// one; anything else missing a gradient is handled per options.
    fn expose_param_grads(&mut self, graphs: &mut GraphPair<'_>) -> RgResult<()> {
        let params: BTreeSet<ValueId> = {
            let fwd = graphs.fwd();
            fwd.necessary_values()
                .into_iter()
                .filter(|&v| {
                    let val = fwd.value(v);
                    val.is_input() && val.initializer().is_some()
                })
                .collect()
        };
        let inputs = graphs.fwd().inputs().to_vec();
        for v in inputs {
            if !params.contains(&v) {
                continue;
            }
            if !graphs.fwd().value(v).ty().dtype.is_float() {
                continue;
            }
            let name = graphs.fwd().value(v).name().to_string();
            match graphs.fwd().grad(v) {
                None => {
                    let users = graphs.fwd().value_users(v);
                    let bn_only = users.len() == 1
                        && matches!(
                            graphs.fwd().node(users[0]).op(),
                            OpKind::BatchNormalization { .. }
                        );
                    if bn_only {
                        continue;
                    }
                    match self.options.missing_param_grad {
                        MissingParamGrad::Warn => {
                            warn!(param = %name, "no gradient for parameter");
                        }
                        MissingParamGrad::Error => {
                            return Err(RgError::MissingParamGradient { name })
                        }
                    }
                }
                Some(g) => {
                    if g.graph != graphs.bwd_id() {
                        return Err(RgError::GraphMismatch {
                            reason: format!(
                                "gradient of parameter '{}' lives outside the backward graph",
                                name
                            ),
                        });
                    }
                    let ty = graphs.fwd().value(v).ty().clone();
                    let bwd = graphs.bwd_mut();
                    let out = bwd.add_output_value(format!("grad_out@{}", name), ty);
                    bwd.add_node(OpKind::Identity, vec![g.value], vec![out]);
                }
            }
        }
        graphs.fwd_mut().reset_gradients();
        Ok(())
    }
}
