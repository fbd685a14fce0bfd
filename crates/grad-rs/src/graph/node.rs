//! Operation vertices and the apply wiring that records them.
//!
//! One [`OpNode`] is created per eager call (or per trace site inside a
//! compiled pipeline). The node owns its inputs strongly and references its
//! outputs weakly; output values own the node, which keeps graph navigation
//! bidirectional without a retain cycle.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::session;
use super::tape;
use super::value::{Payload, Value, ValueHandle};
use crate::error::{GraphError, Result};
use crate::tensor::Tensor;

/// Raw results produced by an operation's forward formula.
pub type ForwardOutputs = SmallVec<[Payload; 2]>;

/// Per-input gradients returned by an operation's backward formula. `None`
/// marks an input whose path carries no gradient (e.g. a dimension tuple).
pub type InputGrads = SmallVec<[Option<Tensor>; 2]>;

/// One applied function: the open set of graph operation kinds.
///
/// Implementors supply the forward/backward math; the engine wraps each call
/// with graph bookkeeping. Backward formulas read forward intermediates
/// through [`OpNode::input_payload`], which resolves per-call data via the
/// session scratch, so the same implementation is reentrant across nested
/// and replayed calls.
pub trait Operation {
    fn name(&self) -> &'static str;

    fn arity_in(&self) -> usize;

    fn arity_out(&self) -> usize {
        1
    }

    /// Normalizes operands before the arity check, e.g. validating that a
    /// shape-typed operand really carries a dimension tuple.
    fn preprocess(&self, inputs: Vec<Value>) -> Result<Vec<Value>> {
        Ok(inputs)
    }

    /// Computes raw outputs from raw inputs.
    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs>;

    /// Maps output gradients to input gradients, one entry per input.
    fn backward(&self, node: &OpNode, grads: &[Tensor]) -> Result<InputGrads>;

    /// Whether gradients may flow through the given output. Predicate, cast,
    /// and shape-producing operations return `false`.
    fn backpropagatable(&self, output: usize) -> bool {
        let _ = output;
        true
    }

    /// Gradient barriers absorb incoming gradients silently; every other
    /// non-backpropagatable output turns an incoming gradient into an error.
    fn gradient_barrier(&self) -> bool {
        false
    }
}

static NODE_SEQ: AtomicU64 = AtomicU64::new(0);

/// One graph vertex: an applied operation with recorded operands.
pub struct OpNode {
    op: Rc<dyn Operation>,
    inputs: Vec<Value>,
    outputs: Vec<ValueHandle>,
    generation: u32,
    seq: u64,
}

impl OpNode {
    /// The operation applied at this vertex.
    pub fn op(&self) -> &dyn Operation {
        self.op.as_ref()
    }

    /// Operands captured at call time, owned by the node.
    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    /// Weak handles to the values this call produced.
    pub fn outputs(&self) -> &[ValueHandle] {
        &self.outputs
    }

    /// Topological depth: `max(input generations) + 1`.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Creation-order sequence number; breaks worklist ties between nodes of
    /// equal generation deterministically.
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Resolves the current payload of operand `index`, letting any active
    /// session scratch shadow the recorded value.
    pub fn input_payload(&self, index: usize) -> Result<Payload> {
        session::resolve(&self.inputs[index])
    }

    /// Resolves operand `index` as a tensor.
    pub fn input_tensor(&self, index: usize) -> Result<Tensor> {
        self.input_payload(index)?.as_tensor()
    }

    /// Position of the output with the given identity key.
    pub(crate) fn output_index(&self, key: usize) -> Option<usize> {
        self.outputs.iter().position(|handle| handle.key() == key)
    }
}

impl fmt::Debug for OpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpNode")
            .field("op", &self.op.name())
            .field("generation", &self.generation)
            .field("seq", &self.seq)
            .field("arity_in", &self.inputs.len())
            .field("arity_out", &self.outputs.len())
            .finish()
    }
}

/// Invokes an operation on graph values.
///
/// Preprocessing and the arity check run first; undetermined operands
/// short-circuit to undetermined outputs without touching the forward
/// formula. A node is recorded and linked only while a recording scope is
/// active.
pub fn apply<O: Operation + 'static>(op: O, inputs: Vec<Value>) -> Result<Vec<Value>> {
    apply_rc(Rc::new(op), inputs)
}

pub(crate) fn apply_rc(op: Rc<dyn Operation>, inputs: Vec<Value>) -> Result<Vec<Value>> {
    let inputs = op.preprocess(inputs)?;
    if inputs.len() != op.arity_in() {
        return Err(GraphError::arity(op.name(), op.arity_in(), inputs.len()));
    }

    let outputs: Vec<Value> = if inputs.iter().any(Value::is_undetermined) {
        (0..op.arity_out()).map(|_| Value::undetermined()).collect()
    } else {
        let payloads: Vec<Payload> = inputs
            .iter()
            .map(session::resolve)
            .collect::<Result<Vec<_>>>()?;
        let raw = op.forward(&payloads)?;
        if raw.len() != op.arity_out() {
            return Err(GraphError::arity(op.name(), op.arity_out(), raw.len()));
        }
        raw.into_iter().map(Value::from_payload).collect()
    };

    if tape::is_recording() {
        record(op, inputs, &outputs)?;
    }
    Ok(outputs)
}

/// Creates the vertex for an already-computed call and links every output
/// back to it. Shared by eager application and compiled-call recording.
pub(crate) fn record(
    op: Rc<dyn Operation>,
    inputs: Vec<Value>,
    outputs: &[Value],
) -> Result<Rc<OpNode>> {
    let generation = inputs.iter().map(Value::generation).max().unwrap_or(0) + 1;
    let node = Rc::new(OpNode {
        op,
        outputs: outputs.iter().map(Value::reference).collect(),
        inputs,
        generation,
        seq: NODE_SEQ.fetch_add(1, Ordering::Relaxed),
    });
    for output in outputs {
        output.set_creator(&node)?;
    }
    Ok(node)
}
