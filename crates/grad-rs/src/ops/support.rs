//! Shared helpers backing the functional operation API.

use crate::error::{GraphError, Result};
use crate::graph::{Payload, Value};
use crate::tensor::Tensor;

/// Adapter lifting raw operands into graph values, so `add(x, 2.0)` and
/// `add(x, y)` travel the same code path.
pub trait IntoOperand {
    fn into_operand(self) -> Value;
}

impl IntoOperand for Value {
    fn into_operand(self) -> Value {
        self
    }
}

impl IntoOperand for &Value {
    fn into_operand(self) -> Value {
        self.clone()
    }
}

impl IntoOperand for f32 {
    fn into_operand(self) -> Value {
        Value::scalar(self)
    }
}

impl IntoOperand for Tensor {
    fn into_operand(self) -> Value {
        Value::new(self)
    }
}

impl IntoOperand for Vec<usize> {
    fn into_operand(self) -> Value {
        Value::dims(self)
    }
}

impl<const N: usize> IntoOperand for [usize; N] {
    fn into_operand(self) -> Value {
        Value::dims(self.to_vec())
    }
}

/// Unwraps the sole output of an applied operation.
pub(crate) fn single(mut outputs: Vec<Value>) -> Result<Value> {
    outputs
        .pop()
        .ok_or_else(|| GraphError::invalid_state("operation produced no outputs"))
}

/// Materializes an operand for float arithmetic. Integer payloads must be
/// cast explicitly, so predicate outputs cannot slip into gradient math.
pub(crate) fn float_tensor(payload: &Payload) -> Result<Tensor> {
    let tensor = payload.as_tensor()?;
    if !tensor.dtype().is_float() {
        return Err(GraphError::invalid_state(
            "integer operand in float arithmetic; cast with `to_float` first",
        ));
    }
    Ok(tensor)
}

/// Materializes a unary operand, remembering whether it was a bare scalar so
/// the result can be folded back down.
pub(crate) fn tensor_unary(inputs: &[Payload]) -> Result<(Tensor, bool)> {
    let scalar = matches!(inputs[0], Payload::Scalar(_));
    Ok((float_tensor(&inputs[0])?, scalar))
}

/// Materializes two operands; the result stays scalar only when both were.
pub(crate) fn tensor_pair(inputs: &[Payload]) -> Result<(Tensor, Tensor, bool)> {
    let scalar =
        matches!(inputs[0], Payload::Scalar(_)) && matches!(inputs[1], Payload::Scalar(_));
    Ok((float_tensor(&inputs[0])?, float_tensor(&inputs[1])?, scalar))
}

/// Folds one-element results of scalar arithmetic back into scalar payloads.
pub(crate) fn wrap_tensor(tensor: Tensor, scalar: bool) -> Result<Payload> {
    if scalar && tensor.len() == 1 {
        return Ok(Payload::Scalar(tensor.item()?));
    }
    Ok(Payload::Tensor(tensor))
}

/// Validates that a shape-typed operand really carries a dimension tuple.
/// Undetermined operands pass, so structural traces stay possible.
pub(crate) fn ensure_dims_operand(op: &'static str, value: &Value) -> Result<()> {
    if value.is_undetermined() || !value.has_payload() {
        return Ok(());
    }
    match value.payload() {
        Payload::Dims(_) => Ok(()),
        other => Err(GraphError::invalid_state(format!(
            "`{op}` expects a dimension tuple operand, got {other:?}"
        ))),
    }
}
