//! Structural operations: reductions, broadcasts, reshapes, shape
//! introspection, predicates, and the gradient barrier.
//!
//! Shape-consuming operations take a dimension-tuple value as an ordinary
//! operand, so reshape targets and shape slices are regular graph nodes.

use smallvec::smallvec;

use super::support::{
    ensure_dims_operand, float_tensor, single, tensor_unary, wrap_tensor, IntoOperand,
};
use crate::error::{GraphError, Result};
use crate::graph::{apply, ForwardOutputs, InputGrads, OpNode, Operation, Payload, Value};
use crate::tensor::{Shape, Tensor};

pub struct Sum;

impl Operation for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (value, scalar) = tensor_unary(inputs)?;
        Ok(smallvec![wrap_tensor(value.sum_all(), scalar)?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let value = node.input_tensor(0)?;
        Ok(smallvec![Some(grads[0].broadcast_to(value.shape())?)])
    }
}

pub struct SumTo;

impl Operation for SumTo {
    fn name(&self) -> &'static str {
        "sum_to"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn preprocess(&self, inputs: Vec<Value>) -> Result<Vec<Value>> {
        if let Some(target) = inputs.get(1) {
            ensure_dims_operand(self.name(), target)?;
        }
        Ok(inputs)
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let value = inputs[0].as_tensor()?;
        let dims = inputs[1].as_dims()?;
        Ok(smallvec![Payload::Tensor(value.sum_to(&Shape::new(dims))?)])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let value = node.input_tensor(0)?;
        Ok(smallvec![
            Some(grads[0].broadcast_to(value.shape())?),
            None
        ])
    }
}

pub struct BroadcastTo;

impl Operation for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn preprocess(&self, inputs: Vec<Value>) -> Result<Vec<Value>> {
        if let Some(target) = inputs.get(1) {
            ensure_dims_operand(self.name(), target)?;
        }
        Ok(inputs)
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let value = inputs[0].as_tensor()?;
        let dims = inputs[1].as_dims()?;
        Ok(smallvec![Payload::Tensor(
            value.broadcast_to(&Shape::new(dims))?
        )])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let value = node.input_tensor(0)?;
        Ok(smallvec![Some(grads[0].sum_to(value.shape())?), None])
    }
}

pub struct Reshape;

impl Operation for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn preprocess(&self, inputs: Vec<Value>) -> Result<Vec<Value>> {
        if let Some(target) = inputs.get(1) {
            ensure_dims_operand(self.name(), target)?;
        }
        Ok(inputs)
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let value = inputs[0].as_tensor()?;
        let dims = inputs[1].as_dims()?;
        Ok(smallvec![Payload::Tensor(value.reshape(Shape::new(dims))?)])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let value = node.input_tensor(0)?;
        Ok(smallvec![
            Some(grads[0].reshape(value.shape().clone())?),
            None
        ])
    }
}

pub struct ShapeOf;

impl Operation for ShapeOf {
    fn name(&self) -> &'static str {
        "shape_of"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let shape = inputs[0].shape().ok_or_else(|| {
            GraphError::invalid_state("shape_of applied to a value without a shape")
        })?;
        Ok(smallvec![Payload::Dims(shape.dims().to_vec())])
    }

    fn backward(&self, _node: &OpNode, _grads: &[Tensor]) -> Result<InputGrads> {
        Err(GraphError::not_differentiable(self.name(), 0))
    }

    fn backpropagatable(&self, _output: usize) -> bool {
        false
    }
}

pub struct Greater;

impl Operation for Greater {
    fn name(&self) -> &'static str {
        "greater"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let lhs = float_tensor(&inputs[0])?;
        let rhs = float_tensor(&inputs[1])?;
        Ok(smallvec![Payload::Tensor(lhs.greater(&rhs)?)])
    }

    fn backward(&self, _node: &OpNode, _grads: &[Tensor]) -> Result<InputGrads> {
        Err(GraphError::not_differentiable(self.name(), 0))
    }

    fn backpropagatable(&self, _output: usize) -> bool {
        false
    }
}

pub struct ToFloat;

impl Operation for ToFloat {
    fn name(&self) -> &'static str {
        "to_float"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let value = inputs[0].as_tensor()?;
        Ok(smallvec![Payload::Tensor(value.to_f32())])
    }

    fn backward(&self, _node: &OpNode, _grads: &[Tensor]) -> Result<InputGrads> {
        Err(GraphError::not_differentiable(self.name(), 0))
    }

    fn backpropagatable(&self, _output: usize) -> bool {
        false
    }
}

pub struct StopGradient;

impl Operation for StopGradient {
    fn name(&self) -> &'static str {
        "stop_gradient"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        Ok(smallvec![inputs[0].clone()])
    }

    fn backward(&self, _node: &OpNode, _grads: &[Tensor]) -> Result<InputGrads> {
        Ok(smallvec![None])
    }

    fn backpropagatable(&self, _output: usize) -> bool {
        false
    }

    fn gradient_barrier(&self) -> bool {
        true
    }
}

/// Sums every element down to a one-element result.
pub fn sum(value: impl IntoOperand) -> Result<Value> {
    single(apply(Sum, vec![value.into_operand()])?)
}

/// Collapses broadcast axes by summation down to the target dimensions.
pub fn sum_to(value: impl IntoOperand, target: impl IntoOperand) -> Result<Value> {
    single(apply(SumTo, vec![value.into_operand(), target.into_operand()])?)
}

/// Expands the operand to the target dimensions under broadcasting rules.
pub fn broadcast_to(value: impl IntoOperand, target: impl IntoOperand) -> Result<Value> {
    single(apply(
        BroadcastTo,
        vec![value.into_operand(), target.into_operand()],
    )?)
}

/// Reinterprets the operand under new dimensions of equal element count.
pub fn reshape(value: impl IntoOperand, target: impl IntoOperand) -> Result<Value> {
    single(apply(
        Reshape,
        vec![value.into_operand(), target.into_operand()],
    )?)
}

/// Produces the operand's dimensions as a dimension-tuple value.
pub fn shape_of(value: impl IntoOperand) -> Result<Value> {
    single(apply(ShapeOf, vec![value.into_operand()])?)
}

/// Elementwise comparison producing 1/0 flags as `I32`; not differentiable.
pub fn greater(lhs: impl IntoOperand, rhs: impl IntoOperand) -> Result<Value> {
    single(apply(Greater, vec![lhs.into_operand(), rhs.into_operand()])?)
}

/// Casts integer flags to floats; the cast itself is not differentiable.
pub fn to_float(value: impl IntoOperand) -> Result<Value> {
    single(apply(ToFloat, vec![value.into_operand()])?)
}

/// Passes the operand through while excluding it from gradient propagation.
pub fn stop_gradient(value: impl IntoOperand) -> Result<Value> {
    single(apply(StopGradient, vec![value.into_operand()])?)
}
