//! Elementwise arithmetic operations with broadcasting-aware gradients.
//!
//! Every forward broadcast is undone on the way back by `sum_to`, which
//! collapses the gradient to the operand's own rank before accumulation.

use smallvec::smallvec;

use super::support::{single, tensor_pair, tensor_unary, wrap_tensor, IntoOperand};
use crate::error::Result;
use crate::graph::{apply, ForwardOutputs, InputGrads, OpNode, Operation, Payload, Value};
use crate::tensor::Tensor;

pub struct Add;

impl Operation for Add {
    fn name(&self) -> &'static str {
        "add"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (lhs, rhs, scalar) = tensor_pair(inputs)?;
        Ok(smallvec![wrap_tensor(lhs.add(&rhs)?, scalar)?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let lhs = node.input_tensor(0)?;
        let rhs = node.input_tensor(1)?;
        Ok(smallvec![
            Some(grads[0].sum_to(lhs.shape())?),
            Some(grads[0].sum_to(rhs.shape())?),
        ])
    }
}

pub struct Sub;

impl Operation for Sub {
    fn name(&self) -> &'static str {
        "sub"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (lhs, rhs, scalar) = tensor_pair(inputs)?;
        Ok(smallvec![wrap_tensor(
            lhs.zip_with(&rhs, "sub", |a, b| a - b)?,
            scalar
        )?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let lhs = node.input_tensor(0)?;
        let rhs = node.input_tensor(1)?;
        Ok(smallvec![
            Some(grads[0].sum_to(lhs.shape())?),
            Some(grads[0].map(|v| -v).sum_to(rhs.shape())?),
        ])
    }
}

pub struct Mul;

impl Operation for Mul {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (lhs, rhs, scalar) = tensor_pair(inputs)?;
        Ok(smallvec![wrap_tensor(lhs.mul(&rhs)?, scalar)?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let lhs = node.input_tensor(0)?;
        let rhs = node.input_tensor(1)?;
        Ok(smallvec![
            Some(grads[0].mul(&rhs)?.sum_to(lhs.shape())?),
            Some(grads[0].mul(&lhs)?.sum_to(rhs.shape())?),
        ])
    }
}

pub struct Div;

impl Operation for Div {
    fn name(&self) -> &'static str {
        "div"
    }

    fn arity_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (lhs, rhs, scalar) = tensor_pair(inputs)?;
        Ok(smallvec![wrap_tensor(
            lhs.zip_with(&rhs, "div", |a, b| a / b)?,
            scalar
        )?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let lhs = node.input_tensor(0)?;
        let rhs = node.input_tensor(1)?;
        let grad_lhs = grads[0].zip_with(&rhs, "div", |g, b| g / b)?;
        let grad_rhs = grads[0]
            .mul(&lhs)?
            .zip_with(&rhs.mul(&rhs)?, "div", |n, d| -n / d)?;
        Ok(smallvec![
            Some(grad_lhs.sum_to(lhs.shape())?),
            Some(grad_rhs.sum_to(rhs.shape())?),
        ])
    }
}

pub struct Neg;

impl Operation for Neg {
    fn name(&self) -> &'static str {
        "neg"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (value, scalar) = tensor_unary(inputs)?;
        Ok(smallvec![wrap_tensor(value.map(|v| -v), scalar)?])
    }

    fn backward(&self, _node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        Ok(smallvec![Some(grads[0].map(|v| -v))])
    }
}

pub struct Square;

impl Operation for Square {
    fn name(&self) -> &'static str {
        "square"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (value, scalar) = tensor_unary(inputs)?;
        Ok(smallvec![wrap_tensor(value.map(|v| v * v), scalar)?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let value = node.input_tensor(0)?;
        Ok(smallvec![Some(grads[0].mul(&value)?.map(|v| 2.0 * v))])
    }
}

pub struct Exp;

impl Operation for Exp {
    fn name(&self) -> &'static str {
        "exp"
    }

    fn arity_in(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (value, scalar) = tensor_unary(inputs)?;
        Ok(smallvec![wrap_tensor(value.map(f32::exp), scalar)?])
    }

    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let value = node.input_tensor(0)?;
        Ok(smallvec![Some(grads[0].mul(&value.map(f32::exp))?)])
    }
}

/// Broadcasting elementwise addition.
pub fn add(lhs: impl IntoOperand, rhs: impl IntoOperand) -> Result<Value> {
    single(apply(Add, vec![lhs.into_operand(), rhs.into_operand()])?)
}

/// Broadcasting elementwise subtraction.
pub fn sub(lhs: impl IntoOperand, rhs: impl IntoOperand) -> Result<Value> {
    single(apply(Sub, vec![lhs.into_operand(), rhs.into_operand()])?)
}

/// Broadcasting elementwise multiplication.
pub fn mul(lhs: impl IntoOperand, rhs: impl IntoOperand) -> Result<Value> {
    single(apply(Mul, vec![lhs.into_operand(), rhs.into_operand()])?)
}

/// Broadcasting elementwise division.
pub fn div(lhs: impl IntoOperand, rhs: impl IntoOperand) -> Result<Value> {
    single(apply(Div, vec![lhs.into_operand(), rhs.into_operand()])?)
}

/// Elementwise negation.
pub fn neg(value: impl IntoOperand) -> Result<Value> {
    single(apply(Neg, vec![value.into_operand()])?)
}

/// Elementwise square.
pub fn square(value: impl IntoOperand) -> Result<Value> {
    single(apply(Square, vec![value.into_operand()])?)
}

/// Elementwise exponential.
pub fn exp(value: impl IntoOperand) -> Result<Value> {
    single(apply(Exp, vec![value.into_operand()])?)
}
