pub mod builder;
pub mod topology;

use crate::types::{GraphId, NodeId, TensorType, ValueId, ValueRef};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(1);

/// Operator kind plus its attributes. Cloning an `OpKind` is how a node is
/// re-instantiated under new wiring during recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpKind {
    /// Materializes a fixed tensor; no inputs.
    Constant { value: ArrayD<f32> },
    Identity,
    Add,
    Mul,
    Neg,
    MatMul { transpose_a: bool, transpose_b: bool },
    Relu,
    /// Backward kernel of Relu: takes (y, gy).
    ReluGrad,
    Sigmoid,
    /// Backward kernel of Sigmoid: takes (y, gy).
    SigmoidGrad,
    /// Sum over all elements.
    ReduceSum,
    /// Broadcast of a gradient back to the shape of the summed input. The
    /// target extent is carried by the output value's type.
    Expand,
    BatchNormalization { epsilon: f32, momentum: f32 },
    /// Backward kernel of BatchNormalization: takes (x, scale, gy) and
    /// produces (gx, gscale, gbias).
    BatchNormGrad { epsilon: f32 },
    Floor,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Constant { .. } => "Constant",
            OpKind::Identity => "Identity",
            OpKind::Add => "Add",
            OpKind::Mul => "Mul",
            OpKind::Neg => "Neg",
            OpKind::MatMul { .. } => "MatMul",
            OpKind::Relu => "Relu",
            OpKind::ReluGrad => "ReluGrad",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::SigmoidGrad => "SigmoidGrad",
            OpKind::ReduceSum => "ReduceSum",
            OpKind::Expand => "Expand",
            OpKind::BatchNormalization { .. } => "BatchNormalization",
            OpKind::BatchNormGrad { .. } => "BatchNormGrad",
            OpKind::Floor => "Floor",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A typed tensor slot owned by one graph.
#[derive(Debug)]
pub struct Value {
    name: String,
    ty: TensorType,
    is_input: bool,
    is_output: bool,
    initializer: Option<ArrayD<f32>>,
    /// Scratch slot pointing at the value currently holding this value's
    /// gradient. Cleared by `reset_gradients`.
    grad: Option<ValueRef>,
}

impl Value {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    pub fn is_input(&self) -> bool {
        self.is_input
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn initializer(&self) -> Option<&ArrayD<f32>> {
        self.initializer.as_ref()
    }

    pub fn grad(&self) -> Option<ValueRef> {
        self.grad
    }
}

/// An operator instance: op kind, ordered value wiring, and the scheduling
/// fields filled in by the rewriter.
#[derive(Debug)]
pub struct Node {
    op: OpKind,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    /// Execution rank assigned by the rewriter; 0 means unscheduled.
    exec_order: i64,
    /// Set on an original node whose clone was emitted for recomputation, so
    /// the executor can skip stateful updates (BatchNormalization statistics).
    in_recomputing: bool,
}

impl Node {
    pub fn op(&self) -> &OpKind {
        &self.op
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn exec_order(&self) -> i64 {
        self.exec_order
    }

    pub fn set_exec_order(&mut self, order: i64) {
        self.exec_order = order;
    }

    pub fn in_recomputing(&self) -> bool {
        self.in_recomputing
    }

    pub fn set_in_recomputing(&mut self, flag: bool) {
        self.in_recomputing = flag;
    }

    /// Rewires every occurrence of `old` among the inputs to `new`.
    /// Returns how many slots changed.
    pub fn replace_input(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut n = 0;
        for slot in &mut self.inputs {
            if *slot == old {
                *slot = new;
                n += 1;
            }
        }
        n
    }

    /// Rewires every occurrence of `old` among the outputs to `new`.
    pub fn replace_output(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut n = 0;
        for slot in &mut self.outputs {
            if *slot == old {
                *slot = new;
                n += 1;
            }
        }
        n
    }
}

/// A mutable dataflow graph: an insertion-ordered node list plus a value
/// arena. Two graphs taking part in one rewrite are distinguished by their
/// `GraphId`; values and nodes are owned by their graph for its whole
/// lifetime.
pub struct Graph {
    id: GraphId,
    name: String,
    values: Vec<Value>,
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            values: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> {
        (0..self.values.len()).map(ValueId)
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn value_ref(&self, id: ValueId) -> ValueRef {
        ValueRef {
            graph: self.id,
            value: id,
        }
    }

    /// Adds a plain (non-boundary) value.
    pub fn add_value(&mut self, name: impl Into<String>, ty: TensorType) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            name: name.into(),
            ty,
            is_input: false,
            is_output: false,
            initializer: None,
            grad: None,
        });
        id
    }

    /// Adds a graph input value.
    pub fn add_input_value(&mut self, name: impl Into<String>, ty: TensorType) -> ValueId {
        let id = self.add_value(name, ty);
        self.values[id.0].is_input = true;
        self.inputs.push(id);
        id
    }

    /// Adds a graph output value.
    pub fn add_output_value(&mut self, name: impl Into<String>, ty: TensorType) -> ValueId {
        let id = self.add_value(name, ty);
        self.values[id.0].is_output = true;
        self.outputs.push(id);
        id
    }

    /// Promotes an existing value to a graph output.
    pub fn mark_output(&mut self, id: ValueId) {
        if !self.values[id.0].is_output {
            self.values[id.0].is_output = true;
            self.outputs.push(id);
        }
    }

    /// Attaches initializer data to an input value, marking it a parameter.
    pub fn set_initializer(&mut self, id: ValueId, data: ArrayD<f32>) {
        self.values[id.0].initializer = Some(data);
    }

    /// Adds a node wired to existing values. Output values must already have
    /// been created; the node becomes their definition.
    pub fn add_node(&mut self, op: OpKind, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op,
            inputs,
            outputs,
            exec_order: 0,
            in_recomputing: false,
        });
        id
    }

    pub fn grad(&self, id: ValueId) -> Option<ValueRef> {
        self.values[id.0].grad
    }

    pub fn set_grad(&mut self, id: ValueId, grad: Option<ValueRef>) {
        self.values[id.0].grad = grad;
    }

    /// Clears every per-value gradient pointer. Gradient slots are rewrite
    /// scratch and must not leak to later passes.
    pub fn reset_gradients(&mut self) {
        for value in &mut self.values {
            value.grad = None;
        }
    }

    /// The node defining `value`, if any. Graph inputs have no producer.
    pub fn producer(&self, value: ValueId) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.outputs.contains(&value))
            .map(NodeId)
    }

    /// Nodes consuming `value`.
    pub fn value_users(&self, value: ValueId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.contains(&value))
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Transitive input closure of the graph outputs: every value whose data
    /// is needed to produce them.
    pub fn necessary_values(&self) -> BTreeSet<ValueId> {
        let mut necessary = BTreeSet::new();
        let mut stack: Vec<ValueId> = self.outputs.clone();
        while let Some(v) = stack.pop() {
            if !necessary.insert(v) {
                continue;
            }
            if let Some(producer) = self.producer(v) {
                stack.extend(self.nodes[producer.0].inputs.iter().copied());
            }
        }
        necessary
    }

    pub fn find_value(&self, name: &str) -> Option<ValueId> {
        self.values.iter().position(|v| v.name == name).map(ValueId)
    }

    /// A name not yet used by any value: `base`, or `base_1`, `base_2`, ...
    pub fn fresh_name(&self, base: &str) -> String {
        if self.find_value(base).is_none() {
            return base.to_string();
        }
        let mut k = 1;
        loop {
            let candidate = format!("{}_{}", base, k);
            if self.find_value(&candidate).is_none() {
                return candidate;
            }
            k += 1;
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {:?} '{}':", self.id, self.name)?;
        for (i, node) in self.nodes.iter().enumerate() {
            let ins: Vec<&str> = node.inputs.iter().map(|v| self.value(*v).name()).collect();
            let outs: Vec<&str> = node.outputs.iter().map(|v| self.value(*v).name()).collect();
            writeln!(
                f,
                "  #{} {} {:?} -> {:?} (order={})",
                i,
                node.op.name(),
                ins,
                outs,
                node.exec_order
            )?;
        }
        Ok(())
    }
}
