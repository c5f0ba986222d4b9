use crate::graph::{Graph, OpKind};
use crate::types::{Dtype, TensorType, ValueId};
use ndarray::ArrayD;

/// Convenience layer for wiring graphs by hand in tests, demos, and
/// schedule planners.
pub struct GraphBuilder<'a> {
    graph: &'a mut Graph,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(graph: &'a mut Graph) -> Self {
        Self { graph }
    }

    pub fn input(&mut self, name: &str, ty: TensorType) -> ValueId {
        self.graph.add_input_value(name, ty)
    }

    /// A trainable parameter: a graph input carrying initializer data.
    pub fn param(&mut self, name: &str, data: ArrayD<f32>) -> ValueId {
        let ty = TensorType::new(Dtype::Float32, data.len());
        let id = self.graph.add_input_value(name, ty);
        self.graph.set_initializer(id, data);
        id
    }

    pub fn constant(&mut self, name: &str, data: ArrayD<f32>) -> ValueId {
        let ty = TensorType::new(Dtype::Float32, data.len());
        let out = self.graph.add_value(name, ty);
        self.graph
            .add_node(OpKind::Constant { value: data }, vec![], vec![out]);
        out
    }

    /// Generic op with one output of an explicit type.
    pub fn op(&mut self, op: OpKind, name: &str, ty: TensorType, inputs: &[ValueId]) -> ValueId {
        let out = self.graph.add_value(name, ty);
        self.graph.add_node(op, inputs.to_vec(), vec![out]);
        out
    }

    pub fn identity(&mut self, name: &str, x: ValueId) -> ValueId {
        let ty = self.graph.value(x).ty().clone();
        self.op(OpKind::Identity, name, ty, &[x])
    }

    pub fn add(&mut self, name: &str, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.graph.value(a).ty().clone();
        self.op(OpKind::Add, name, ty, &[a, b])
    }

    pub fn mul(&mut self, name: &str, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.graph.value(a).ty().clone();
        self.op(OpKind::Mul, name, ty, &[a, b])
    }

    pub fn neg(&mut self, name: &str, x: ValueId) -> ValueId {
        let ty = self.graph.value(x).ty().clone();
        self.op(OpKind::Neg, name, ty, &[x])
    }

    /// MatMul needs an explicit output type; element counts do not follow
    /// from the operand counts alone.
    pub fn matmul(&mut self, name: &str, ty: TensorType, a: ValueId, b: ValueId) -> ValueId {
        self.op(
            OpKind::MatMul {
                transpose_a: false,
                transpose_b: false,
            },
            name,
            ty,
            &[a, b],
        )
    }

    pub fn relu(&mut self, name: &str, x: ValueId) -> ValueId {
        let ty = self.graph.value(x).ty().clone();
        self.op(OpKind::Relu, name, ty, &[x])
    }

    pub fn sigmoid(&mut self, name: &str, x: ValueId) -> ValueId {
        let ty = self.graph.value(x).ty().clone();
        self.op(OpKind::Sigmoid, name, ty, &[x])
    }

    pub fn floor(&mut self, name: &str, x: ValueId) -> ValueId {
        let ty = self.graph.value(x).ty().clone();
        self.op(OpKind::Floor, name, ty, &[x])
    }

    pub fn reduce_sum(&mut self, name: &str, x: ValueId) -> ValueId {
        let dtype = self.graph.value(x).ty().dtype;
        self.op(OpKind::ReduceSum, name, TensorType::scalar(dtype), &[x])
    }

    pub fn batch_norm(
        &mut self,
        name: &str,
        x: ValueId,
        scale: ValueId,
        bias: ValueId,
        mean: ValueId,
        var: ValueId,
    ) -> ValueId {
        let ty = self.graph.value(x).ty().clone();
        self.op(
            OpKind::BatchNormalization {
                epsilon: 1e-5,
                momentum: 0.9,
            },
            name,
            ty,
            &[x, scale, bias, mean, var],
        )
    }

    /// Marks a value as a graph output.
    pub fn output(&mut self, v: ValueId) {
        self.graph.mark_output(v);
    }
}
