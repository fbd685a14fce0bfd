//! Trace-once/replay-many compiled graphs.
//!
//! The wrapped function runs exactly once, inside an internally owned
//! recording scope; the vertices it records are flattened into a forward
//! pipeline and a pruned backward pipeline. Every later call binds inputs by
//! position and interprets the cached pipeline against a call-local scratch
//! map — the function body is never consulted again. A compiled call that
//! happens while an enclosing recording scope is active is itself recorded
//! as a single vertex, which is how nested compiled graphs replay
//! transparently and how the backward sweep treats them like any other
//! operation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::node::{self, ForwardOutputs, InputGrads, OpNode, Operation};
use super::pipeline::{self, GradStore};
use super::session::{self, ExecMode};
use super::tape;
use super::value::{Payload, Value, ValueHandle};
use crate::error::{GraphError, Result};
use crate::profiling;
use crate::tensor::Tensor;

type TraceFn = dyn Fn(&[Value]) -> Result<Vec<Value>>;

struct Compiled {
    forward: Vec<Rc<OpNode>>,
    backward: Vec<Rc<OpNode>>,
    constants: Vec<Value>,
    inputs: Vec<ValueHandle>,
    outputs: Vec<ValueHandle>,
    /// Pins the traced boundary values (payloads released) so pipeline
    /// handles keep a live identity for scratch keying.
    #[allow(dead_code)]
    retained: Vec<Value>,
}

struct GraphInner {
    func: Box<TraceFn>,
    state: RefCell<Option<Compiled>>,
    building: Cell<bool>,
}

/// A traced, cached, replayable pipeline for a composed function.
#[derive(Clone)]
pub struct CompiledGraph {
    inner: Rc<GraphInner>,
}

impl CompiledGraph {
    /// Wraps a composition of operations for trace-once/replay-many use.
    pub fn new(func: impl Fn(&[Value]) -> Result<Vec<Value>> + 'static) -> Self {
        CompiledGraph {
            inner: Rc::new(GraphInner {
                func: Box::new(func),
                state: RefCell::new(None),
                building: Cell::new(false),
            }),
        }
    }

    /// Reports whether the pipeline has been traced yet.
    pub fn is_built(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    /// Handles to the declared inputs, once built.
    pub fn input_handles(&self) -> Vec<ValueHandle> {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map(|state| state.inputs.clone())
            .unwrap_or_default()
    }

    /// Handles to the declared outputs, once built.
    pub fn output_handles(&self) -> Vec<ValueHandle> {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map(|state| state.outputs.clone())
            .unwrap_or_default()
    }

    /// Captured closure state hoisted out of the trace (e.g. embedded
    /// weights). Payloads are retained so replays can read them.
    pub fn constants(&self) -> Vec<Value> {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map(|state| state.constants.clone())
            .unwrap_or_default()
    }

    /// Invokes the graph: the first concrete call traces and builds, later
    /// calls replay the cached pipeline. Undetermined inputs perform a pure
    /// structural pass and return undetermined outputs.
    pub fn call(&self, inputs: &[Value]) -> Result<Vec<Value>> {
        if self.inner.building.get() {
            return Err(GraphError::reentrancy(
                "compiled graph invoked during its own build",
            ));
        }
        let outer_recording = tape::is_recording();
        let symbolic_call = inputs.iter().any(Value::is_undetermined);

        if !self.is_built() {
            let outputs = self.build(inputs)?;
            if outer_recording && !symbolic_call {
                self.record_call(inputs, &outputs, None)?;
            }
            return Ok(outputs);
        }

        if symbolic_call {
            let arity = self
                .inner
                .state
                .borrow()
                .as_ref()
                .map(|state| state.outputs.len())
                .unwrap_or(0);
            return Ok((0..arity).map(|_| Value::undetermined()).collect());
        }

        let payloads: Vec<Payload> = inputs
            .iter()
            .map(Value::payload_checked)
            .collect::<Result<Vec<_>>>()?;
        let (raw, scratch) = self.replay_raw(&payloads)?;
        let outputs: Vec<Value> = raw.into_iter().map(Value::from_payload).collect();
        if outer_recording {
            self.record_call(inputs, &outputs, Some(scratch))?;
        }
        Ok(outputs)
    }

    fn build(&self, inputs: &[Value]) -> Result<Vec<Value>> {
        self.inner.building.set(true);
        let result = self.build_inner(inputs);
        self.inner.building.set(false);
        result
    }

    fn build_inner(&self, inputs: &[Value]) -> Result<Vec<Value>> {
        let _scope = profiling::scope("graph::trace");
        let traced = {
            let _session = session::push(ExecMode::UnderConstruction);
            let _recording = tape::push_recording(true);
            (self.inner.func)(inputs)?
        };

        let parts = pipeline::build_pipeline(&traced, inputs);
        let symbolic =
            inputs.iter().any(Value::is_undetermined) || traced.iter().any(Value::is_undetermined);
        let raw: Option<Vec<Payload>> = if symbolic {
            None
        } else {
            Some(
                traced
                    .iter()
                    .map(Value::payload_checked)
                    .collect::<Result<Vec<_>>>()?,
            )
        };

        // Handles must capture shape/dtype before trace buffers are dropped.
        let input_handles: Vec<ValueHandle> = inputs.iter().map(Value::reference).collect();
        let output_handles: Vec<ValueHandle> = traced.iter().map(Value::reference).collect();

        // Release every trace-time buffer produced by a vertex; constants are
        // creator-less and keep theirs. This bounds the memory a compiled
        // graph retains to its constants.
        for vertex in &parts.forward {
            for handle in vertex.outputs() {
                if let Some(value) = handle.get() {
                    value.release_payload();
                }
            }
        }

        let mut retained: Vec<Value> = inputs.to_vec();
        retained.extend(traced.iter().cloned());
        *self.inner.state.borrow_mut() = Some(Compiled {
            forward: parts.forward,
            backward: parts.backward,
            constants: parts.constants,
            inputs: input_handles,
            outputs: output_handles,
            retained,
        });
        profiling::event("graph::trace_calls");

        // Results handed back are fresh leaves decoupled from the trace.
        Ok(match raw {
            Some(raw) => raw.into_iter().map(Value::from_payload).collect(),
            None => traced.iter().map(|_| Value::undetermined()).collect(),
        })
    }

    /// Executes the cached forward pipeline against raw payloads. Returns
    /// the raw outputs plus the call-local scratch of intermediates, which a
    /// recorded call keeps for its backward pass.
    fn replay_raw(
        &self,
        inputs: &[Payload],
    ) -> Result<(Vec<Payload>, HashMap<usize, Payload>)> {
        let state_ref = self.inner.state.borrow();
        let state = state_ref.as_ref().ok_or_else(|| {
            GraphError::invalid_state("compiled graph replayed before it was built")
        })?;
        if inputs.len() != state.inputs.len() {
            return Err(GraphError::arity(
                "compiled_call",
                state.inputs.len(),
                inputs.len(),
            ));
        }

        let _scope = profiling::scope("graph::replay");
        let guard = session::push(ExecMode::Executing);
        let outcome = (|| -> Result<Vec<Payload>> {
            for (handle, payload) in state.inputs.iter().zip(inputs) {
                session::store(handle.key(), payload.clone());
            }
            for vertex in &state.forward {
                let mut resolved = Vec::with_capacity(vertex.inputs().len());
                for input in vertex.inputs() {
                    resolved.push(session::resolve(input)?);
                }
                let produced = vertex.op().forward(&resolved)?;
                if produced.len() != vertex.outputs().len() {
                    return Err(GraphError::arity(
                        vertex.op().name(),
                        vertex.outputs().len(),
                        produced.len(),
                    ));
                }
                for (handle, payload) in vertex.outputs().iter().zip(produced) {
                    session::store(handle.key(), payload);
                }
            }
            state
                .outputs
                .iter()
                .map(|handle| {
                    session::fetch(handle.key())
                        .or_else(|| handle.get().and_then(|v| v.payload_checked().ok()))
                        .ok_or_else(|| {
                            GraphError::invalid_state("compiled output missing after replay")
                        })
                })
                .collect()
        })();
        let scratch = guard.finish();
        profiling::event("graph::replay_calls");
        Ok((outcome?, scratch))
    }

    fn record_call(
        &self,
        inputs: &[Value],
        outputs: &[Value],
        scratch: Option<HashMap<usize, Payload>>,
    ) -> Result<()> {
        let op = CompiledCall {
            graph: Rc::clone(&self.inner),
            saved: RefCell::new(scratch),
        };
        node::record(Rc::new(op), inputs.to_vec(), outputs)?;
        Ok(())
    }
}

/// A compiled graph participating in an enclosing graph as one vertex.
struct CompiledCall {
    graph: Rc<GraphInner>,
    /// Per-call forward intermediates, bridging to the backward pass.
    saved: RefCell<Option<HashMap<usize, Payload>>>,
}

impl CompiledCall {
    fn graph(&self) -> CompiledGraph {
        CompiledGraph {
            inner: Rc::clone(&self.graph),
        }
    }
}

impl Operation for CompiledCall {
    fn name(&self) -> &'static str {
        "compiled_call"
    }

    fn arity_in(&self) -> usize {
        self.graph
            .state
            .borrow()
            .as_ref()
            .map(|state| state.inputs.len())
            .unwrap_or(0)
    }

    fn arity_out(&self) -> usize {
        self.graph
            .state
            .borrow()
            .as_ref()
            .map(|state| state.outputs.len())
            .unwrap_or(0)
    }

    fn forward(&self, inputs: &[Payload]) -> Result<ForwardOutputs> {
        let (raw, scratch) = self.graph().replay_raw(inputs)?;
        *self.saved.borrow_mut() = Some(scratch);
        Ok(raw.into_iter().collect())
    }

    fn backward(&self, vertex: &OpNode, grads: &[Tensor]) -> Result<InputGrads> {
        let scratch = match self.saved.borrow_mut().take() {
            Some(scratch) => scratch,
            None => {
                // The per-call intermediates are gone (build-time call or an
                // earlier consumer dropped them); recompute from the recorded
                // operands.
                let mut payloads = Vec::with_capacity(vertex.inputs().len());
                for index in 0..vertex.inputs().len() {
                    payloads.push(vertex.input_payload(index)?);
                }
                let (_, scratch) = self.graph().replay_raw(&payloads)?;
                scratch
            }
        };

        let state_ref = self.graph.state.borrow();
        let state = state_ref.as_ref().ok_or_else(|| {
            GraphError::invalid_state("compiled graph differentiated before it was built")
        })?;
        if grads.len() != state.outputs.len() {
            return Err(GraphError::arity(
                "compiled_call",
                state.outputs.len(),
                grads.len(),
            ));
        }

        let guard = session::push_with_scratch(ExecMode::Executing, scratch);
        let mut store = GradStore::new(false);
        let outcome = (|| -> Result<()> {
            for (handle, grad) in state.outputs.iter().zip(grads) {
                store.accumulate(handle.key(), grad.clone())?;
            }
            for inner_vertex in &state.backward {
                pipeline::propagate(inner_vertex, &mut store, None)?;
            }
            Ok(())
        })();
        let scratch = guard.finish();
        *self.saved.borrow_mut() = Some(scratch);
        outcome?;

        Ok(state
            .inputs
            .iter()
            .map(|handle| store.pop(handle.key()))
            .collect())
    }
}
