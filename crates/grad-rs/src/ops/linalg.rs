//! Matrix products.

use smallvec::smallvec;

use super::support::{float_tensor, single, IntoOperand};
use crate::error::{GraphError, Result};
use crate::graph::{apply, ForwardOutputs, InputGrads, OpNode, Operation, Payload, Value};
use crate::tensor::{Shape, Tensor};

pub struct MatMul;

impl Operation for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let lhs = float_tensor(&inputs[0])?;
        let rhs = float_tensor(&inputs[1])?;
        Ok(smallvec![Payload::Tensor(lhs.matmul(&rhs)?)])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let lhs = node.input_tensor(0)?;
        let rhs = node.input_tensor(1)?;
        let grad = &grads[0];
        match rhs.shape().rank() {
            2 => {
                let grad_lhs = grad.matmul(&rhs.transpose2d()?)?;
                let grad_rhs = lhs.transpose2d()?.matmul(grad)?;
                Ok(smallvec![Some(grad_lhs), Some(grad_rhs)])
            }
            1 => {
                // y = lhs @ v with v rank 1: d lhs is the outer product of
                // the output gradient and v; d v folds back through lhs.
                let rows = lhs.shape().dims()[0];
                let cols = lhs.shape().dims()[1];
                let grad_col = grad.reshape(Shape::new([rows, 1]))?;
                let rhs_row = rhs.reshape(Shape::new([1, cols]))?;
                let grad_lhs = grad_col.mul(&rhs_row)?;
                let grad_rhs = lhs.transpose2d()?.matmul(grad)?;
                Ok(smallvec![Some(grad_lhs), Some(grad_rhs)])
            }
            rank => Err(GraphError::shape_mismatch(
                "matmul",
                lhs.shape().dims(),
                &vec![0; rank],
            )),
        }
    }
}

/// Matrix product for rank-2 × rank-2 and rank-2 × rank-1 operands.
pub fn matmul(lhs: impl IntoOperand, rhs: impl IntoOperand) -> Result<Value> {
    single(apply(MatMul, vec![lhs.into_operand(), rhs.into_operand()])?)
}
