//! Shared, mode-independent graph algorithms.
//!
//! The eager tape and compiled replay differ only in how they drive these
//! routines: the tape feeds a generation-ordered worklist, a compiled graph
//! iterates its pruned pipeline. Both funnel every vertex through
//! [`propagate`], so gradient semantics cannot drift between modes.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::node::OpNode;
use super::session;
use super::value::{Value, ValueHandle};
use crate::error::{GraphError, Result};
use crate::tensor::Tensor;

/// Accumulated gradients keyed by value identity.
pub(crate) struct GradStore {
    map: HashMap<usize, Tensor>,
    retain: bool,
}

impl GradStore {
    /// `retain` keeps popped entries alive for repeat queries (persistent
    /// tapes); otherwise consumed gradients are discarded as the traversal
    /// moves upstream.
    pub(crate) fn new(retain: bool) -> Self {
        GradStore {
            map: HashMap::new(),
            retain,
        }
    }

    /// Adds a contribution. Accumulation allocates a fresh tensor; the same
    /// gradient instance can be aliased across branches, so neither operand
    /// is ever mutated in place.
    pub(crate) fn accumulate(&mut self, key: usize, grad: Tensor) -> Result<()> {
        let merged = match self.map.get(&key) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.map.insert(key, merged);
        Ok(())
    }

    /// Removes and returns the gradient for `key` (clones in retain mode).
    pub(crate) fn pop(&mut self, key: usize) -> Option<Tensor> {
        if self.retain {
            self.map.get(&key).cloned()
        } else {
            self.map.remove(&key)
        }
    }

    pub(crate) fn get(&self, key: usize) -> Option<&Tensor> {
        self.map.get(&key)
    }
}

/// Requested-source capture: the traversal consumes intermediate gradients
/// as it moves upstream, so gradients for explicitly requested values are
/// copied out at the moment they are complete.
pub(crate) struct Capture<'a> {
    pub(crate) wanted: &'a HashSet<usize>,
    pub(crate) taken: &'a mut HashMap<usize, Tensor>,
}

/// Processes one vertex of the backward sweep: pops the accumulated gradient
/// of every output (zero-filled when no consumer contributed), invokes the
/// operation's backward formula, and folds the returned contributions into
/// the store. Returns the upstream vertices that should be visited next.
///
/// An input produced by a non-backpropagatable output stops the sweep: as a
/// gradient barrier it absorbs the contribution silently, anything else
/// (predicates, casts, shape producers) raises `NotDifferentiable`.
pub(crate) fn propagate(
    node: &Rc<OpNode>,
    grads: &mut GradStore,
    mut capture: Option<&mut Capture<'_>>,
) -> Result<Vec<Rc<OpNode>>> {
    let mut output_grads = Vec::with_capacity(node.outputs().len());
    for handle in node.outputs() {
        let grad = match grads.pop(handle.key()) {
            Some(grad) => grad,
            None => default_grad(handle)?,
        };
        if let Some(cap) = capture.as_mut() {
            if cap.wanted.contains(&handle.key()) {
                cap.taken.insert(handle.key(), grad.clone());
            }
        }
        output_grads.push(grad);
    }

    let input_grads = node.op().backward(node, &output_grads)?;
    if input_grads.len() != node.inputs().len() {
        return Err(GraphError::arity(
            node.op().name(),
            node.inputs().len(),
            input_grads.len(),
        ));
    }

    let mut next = Vec::new();
    for (input, grad) in node.inputs().iter().zip(input_grads) {
        let Some(grad) = grad else { continue };
        grads.accumulate(input.key(), grad)?;
        let Some(creator) = input.creator() else {
            continue;
        };
        let index = creator.output_index(input.key()).unwrap_or(0);
        if creator.op().backpropagatable(index) {
            next.push(creator);
        } else if !creator.op().gradient_barrier() {
            return Err(GraphError::not_differentiable(creator.op().name(), index));
        }
    }
    Ok(next)
}

/// Zero gradient for an output nothing downstream consumed. The per-call
/// scratch wins over the shape captured at trace time, since a replay may
/// carry different shapes through the same topology.
fn default_grad(handle: &ValueHandle) -> Result<Tensor> {
    if let Some(shape) = session::fetch(handle.key()).and_then(|p| p.shape()) {
        return Ok(Tensor::zeros(shape));
    }
    if let Some(shape) = handle.shape() {
        return Ok(Tensor::zeros(shape.clone()));
    }
    Err(GraphError::invalid_state(
        "zero gradient requested for an output without a known shape",
    ))
}

/// Pending vertices ordered by `(generation, seq)`; the maximum entry is
/// processed first. Ties in generation resolve to the most recently created
/// node, which keeps the sweep deterministic run-to-run.
pub(crate) struct Worklist {
    entries: Vec<Rc<OpNode>>,
    seen: HashSet<usize>,
}

impl Worklist {
    pub(crate) fn new() -> Self {
        Worklist {
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub(crate) fn push(&mut self, node: Rc<OpNode>) {
        let key = Rc::as_ptr(&node) as usize;
        if !self.seen.insert(key) {
            return;
        }
        let rank = (node.generation(), node.seq());
        let position = self
            .entries
            .partition_point(|entry| (entry.generation(), entry.seq()) < rank);
        self.entries.insert(position, node);
    }

    pub(crate) fn pop_max(&mut self) -> Option<Rc<OpNode>> {
        self.entries.pop()
    }
}

/// Forward and backward instruction lists plus hoisted closure state.
pub(crate) struct PipelineParts {
    pub(crate) forward: Vec<Rc<OpNode>>,
    pub(crate) backward: Vec<Rc<OpNode>>,
    pub(crate) constants: Vec<Value>,
}

/// Collects every vertex reachable from `outputs` into execution order,
/// stopping at the declared `boundary` inputs. Creator-less values that are
/// not boundary inputs are hoisted as constants (captured closure state).
pub(crate) fn build_pipeline(outputs: &[Value], boundary: &[Value]) -> PipelineParts {
    let boundary_keys: HashSet<usize> = boundary.iter().map(Value::key).collect();
    let mut seen_nodes = HashSet::new();
    let mut seen_leaves = HashSet::new();
    let mut forward: Vec<Rc<OpNode>> = Vec::new();
    let mut constants = Vec::new();

    let mut stack: Vec<Value> = outputs.to_vec();
    while let Some(value) = stack.pop() {
        if boundary_keys.contains(&value.key()) {
            continue;
        }
        match value.creator() {
            Some(node) => {
                if seen_nodes.insert(Rc::as_ptr(&node) as usize) {
                    for input in node.inputs() {
                        stack.push(input.clone());
                    }
                    forward.push(node);
                }
            }
            None => {
                if seen_leaves.insert(value.key()) {
                    constants.push(value);
                }
            }
        }
    }

    forward.sort_by_key(|node| (node.generation(), node.seq()));
    let backward = prune_backward(&forward, outputs);
    PipelineParts {
        forward,
        backward,
        constants,
    }
}

/// Keeps only the vertices whose outputs transitively feed a differentiable
/// path from the declared graph outputs. The reachability set starts at the
/// outputs and grows upstream; barrier and non-backpropagatable edges do not
/// extend it. The surviving list is ordered generation-descending, matching
/// the worklist processing order of the eager sweep.
fn prune_backward(forward: &[Rc<OpNode>], outputs: &[Value]) -> Vec<Rc<OpNode>> {
    let mut needed: HashSet<usize> = outputs.iter().map(Value::key).collect();
    let mut backward = Vec::new();
    for node in forward.iter().rev() {
        if node.op().gradient_barrier() {
            continue;
        }
        let feeds = node
            .outputs()
            .iter()
            .enumerate()
            .any(|(index, handle)| {
                needed.contains(&handle.key()) && node.op().backpropagatable(index)
            });
        if !feeds {
            continue;
        }
        for input in node.inputs() {
            needed.insert(input.key());
        }
        backward.push(Rc::clone(node));
    }
    backward
}

/// Wraps raw tensors as graph leaves at a mode boundary.
pub fn pack_variables(tensors: Vec<Tensor>) -> Vec<Value> {
    tensors.into_iter().map(Value::new).collect()
}

/// Unwraps graph values back to raw tensors at a mode boundary.
pub fn unpack_variables(values: &[Value]) -> Result<Vec<Tensor>> {
    values.iter().map(Value::tensor).collect()
}
