use crate::errors::RgResult;
use crate::graph::OpKind;
use crate::rewrite::GradSession;
use crate::types::ValueRef;
use tracing::{debug, warn};

/// Per-operator gradient formulas, injected into the rewriter. Given the
/// incoming gradient on a node's outputs, an implementation emits the
/// gradient subgraph into the session's consumer graph and accumulates
/// gradients onto the node's inputs.
pub trait GradientEmitter {
    fn emit_grad(
        &self,
        sess: &mut GradSession<'_, '_>,
        op: &OpKind,
        inputs: &[ValueRef],
        outputs: &[ValueRef],
    ) -> RgResult<()>;
}

/// Gradient formulas for the built-in op set.
pub struct StandardGradients;

impl StandardGradients {
    fn grad_name(sess: &GradSession<'_, '_>, v: ValueRef) -> RgResult<String> {
        Ok(format!("{}_grad", sess.name(v)?))
    }
}

impl GradientEmitter for StandardGradients {
    fn emit_grad(
        &self,
        sess: &mut GradSession<'_, '_>,
        op: &OpKind,
        inputs: &[ValueRef],
        outputs: &[ValueRef],
    ) -> RgResult<()> {
        if matches!(op, OpKind::Constant { .. }) {
            return Ok(());
        }
        let gy = match outputs.first() {
            Some(out) => sess.grad(*out)?,
            None => None,
        };
        let gy = match gy {
            Some(g) => g,
            None => {
                debug!(op = op.name(), "no incoming gradient, skipping backward");
                return Ok(());
            }
        };

        match op {
            OpKind::Identity => {
                sess.accumulate(inputs[0], gy)?;
            }
            OpKind::Add => {
                sess.accumulate(inputs[0], gy)?;
                sess.accumulate(inputs[1], gy)?;
            }
            OpKind::Neg => {
                let g = sess.retain(gy)?;
                let name = Self::grad_name(sess, inputs[0])?;
                let ty = sess.ty(inputs[0])?;
                let gx = sess.emit(OpKind::Neg, &[g], &name, ty)?;
                sess.accumulate(inputs[0], gx)?;
            }
            OpKind::Mul => {
                let g = sess.retain(gy)?;
                let a = sess.retain(inputs[0])?;
                let b = sess.retain(inputs[1])?;
                let ga_name = Self::grad_name(sess, inputs[0])?;
                let gb_name = Self::grad_name(sess, inputs[1])?;
                let ga = sess.emit(OpKind::Mul, &[g, b], &ga_name, sess.ty(inputs[0])?)?;
                let gb = sess.emit(OpKind::Mul, &[g, a], &gb_name, sess.ty(inputs[1])?)?;
                sess.accumulate(inputs[0], ga)?;
                sess.accumulate(inputs[1], gb)?;
            }
            OpKind::MatMul {
                transpose_a: false,
                transpose_b: false,
            } => {
                // grad_a = gy . b^T, grad_b = a^T . gy
                let g = sess.retain(gy)?;
                let a = sess.retain(inputs[0])?;
                let b = sess.retain(inputs[1])?;
                let ga_name = Self::grad_name(sess, inputs[0])?;
                let gb_name = Self::grad_name(sess, inputs[1])?;
                let ga = sess.emit(
                    OpKind::MatMul {
                        transpose_a: false,
                        transpose_b: true,
                    },
                    &[g, b],
                    &ga_name,
                    sess.ty(inputs[0])?,
                )?;
                let gb = sess.emit(
                    OpKind::MatMul {
                        transpose_a: true,
                        transpose_b: false,
                    },
                    &[a, g],
                    &gb_name,
                    sess.ty(inputs[1])?,
                )?;
                sess.accumulate(inputs[0], ga)?;
                sess.accumulate(inputs[1], gb)?;
            }
            OpKind::Relu => {
                let g = sess.retain(gy)?;
                let y = sess.retain(outputs[0])?;
                let name = Self::grad_name(sess, inputs[0])?;
                let ty = sess.ty(inputs[0])?;
                let gx = sess.emit(OpKind::ReluGrad, &[y, g], &name, ty)?;
                sess.accumulate(inputs[0], gx)?;
            }
            OpKind::Sigmoid => {
                let g = sess.retain(gy)?;
                let y = sess.retain(outputs[0])?;
                let name = Self::grad_name(sess, inputs[0])?;
                let ty = sess.ty(inputs[0])?;
                let gx = sess.emit(OpKind::SigmoidGrad, &[y, g], &name, ty)?;
                sess.accumulate(inputs[0], gx)?;
            }
            OpKind::ReduceSum => {
                let g = sess.retain(gy)?;
                let name = Self::grad_name(sess, inputs[0])?;
                let ty = sess.ty(inputs[0])?;
                let gx = sess.emit(OpKind::Expand, &[g], &name, ty)?;
                sess.accumulate(inputs[0], gx)?;
            }
            OpKind::Expand => {
                let g = sess.retain(gy)?;
                let name = Self::grad_name(sess, inputs[0])?;
                let ty = sess.ty(inputs[0])?;
                let gx = sess.emit(OpKind::ReduceSum, &[g], &name, ty)?;
                sess.accumulate(inputs[0], gx)?;
            }
            OpKind::BatchNormalization { epsilon, .. } => {
                // Gradients flow to input, scale, and bias; the running
                // statistics (inputs 3 and 4) get none.
                let g = sess.retain(gy)?;
                let x = sess.retain(inputs[0])?;
                let scale = sess.retain(inputs[1])?;
                let outs = vec![
                    (Self::grad_name(sess, inputs[0])?, sess.ty(inputs[0])?),
                    (Self::grad_name(sess, inputs[1])?, sess.ty(inputs[1])?),
                    (Self::grad_name(sess, inputs[2])?, sess.ty(inputs[2])?),
                ];
                let grads = sess.emit_multi(
                    OpKind::BatchNormGrad { epsilon: *epsilon },
                    &[x, scale, g],
                    &outs,
                )?;
                for (target, grad) in inputs.iter().take(3).zip(grads) {
                    sess.accumulate(*target, grad)?;
                }
            }
            other => {
                warn!(op = other.name(), "no gradient registered for op");
            }
        }
        Ok(())
    }
}
