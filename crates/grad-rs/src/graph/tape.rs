//! Recording scopes and the eager reverse-mode traversal.
//!
//! The recording flag is a thread-local stack: entering a scope pushes the
//! new flag, leaving restores the prior one, and the RAII guard makes the
//! restore unconditional across every exit path. Gradient computation walks
//! the recorded graph in strictly decreasing generation order, which
//! guarantees a vertex is processed only after all of its consumers have
//! contributed to its output gradients.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use super::pipeline::{propagate, Capture, GradStore, Worklist};
use super::value::Value;
use crate::error::{GraphError, Result};
use crate::profiling;
use crate::tensor::Tensor;

thread_local! {
    static RECORDING: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
}

/// Reports whether an operation invoked now would be linked into the graph.
pub fn is_recording() -> bool {
    RECORDING.with(|stack| stack.borrow().last().copied().unwrap_or(false))
}

/// RAII guard restoring the prior recording flag on drop.
pub(crate) struct RecordGuard {
    active: bool,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if self.active {
            RECORDING.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

/// Pushes a recording flag for the current thread.
pub(crate) fn push_recording(flag: bool) -> RecordGuard {
    RECORDING.with(|stack| stack.borrow_mut().push(flag));
    RecordGuard { active: true }
}

struct GradCache {
    target: usize,
    store: GradStore,
}

/// Scoped recording controller and reverse-mode gradient driver.
///
/// A non-persistent tape recomputes gradients from the graph on every call;
/// a persistent tape keeps the resolved gradient map so repeated queries
/// against the same target are answered without another sweep.
pub struct Tape {
    persistent: bool,
    cache: RefCell<Option<GradCache>>,
}

impl Tape {
    fn new(persistent: bool) -> Self {
        Tape {
            persistent,
            cache: RefCell::new(None),
        }
    }

    /// Runs `body` under a recording scope and returns its result together
    /// with the tape that can differentiate it.
    pub fn scoped<R>(body: impl FnOnce() -> Result<R>) -> Result<(R, Tape)> {
        Tape::run(false, body)
    }

    /// Like [`Tape::scoped`], but gradients survive across repeated
    /// `gradient` calls on the same target.
    pub fn persistent<R>(body: impl FnOnce() -> Result<R>) -> Result<(R, Tape)> {
        Tape::run(true, body)
    }

    fn run<R>(persistent: bool, body: impl FnOnce() -> Result<R>) -> Result<(R, Tape)> {
        let tape = Tape::new(persistent);
        let guard = push_recording(true);
        let result = body();
        drop(guard);
        Ok((result?, tape))
    }

    /// Gradients of `target` with respect to every source. A source with no
    /// path from the target is an error; use [`Tape::try_gradient`] when "no
    /// contribution" is an acceptable answer.
    pub fn gradient(&self, target: &Value, sources: &[Value]) -> Result<Vec<Tensor>> {
        let grads = self.try_gradient(target, sources)?;
        grads
            .into_iter()
            .zip(sources)
            .map(|(grad, source)| {
                grad.ok_or_else(|| GraphError::invalid_source(source.label()))
            })
            .collect()
    }

    /// Tolerant variant of [`Tape::gradient`]: unreachable sources and leaf
    /// targets yield `None` instead of failing.
    pub fn try_gradient(
        &self,
        target: &Value,
        sources: &[Value],
    ) -> Result<Vec<Option<Tensor>>> {
        if is_recording() {
            return Err(GraphError::reentrancy(
                "gradient computation inside an active recording scope",
            ));
        }

        let Some(creator) = target.creator() else {
            // Leaf target: nothing to propagate.
            return Ok(vec![None; sources.len()]);
        };

        for index in 0..creator.outputs().len() {
            if !creator.op().backpropagatable(index) {
                if creator.op().gradient_barrier() {
                    return Ok(vec![None; sources.len()]);
                }
                return Err(GraphError::not_differentiable(creator.op().name(), index));
            }
        }

        if self.persistent {
            if let Some(cache) = self.cache.borrow().as_ref() {
                if cache.target == target.key() {
                    return Ok(sources
                        .iter()
                        .map(|source| cache.store.get(source.key()).cloned())
                        .collect());
                }
            }
        }

        let _scope = profiling::scope("tape::backward");
        let wanted: HashSet<usize> = sources.iter().map(Value::key).collect();
        let mut taken: HashMap<usize, Tensor> = HashMap::new();
        let mut grads = GradStore::new(self.persistent);

        for handle in creator.outputs() {
            let shape = handle.shape().cloned().ok_or_else(|| {
                GraphError::invalid_state("gradient seeded on an output without a known shape")
            })?;
            grads.accumulate(handle.key(), Tensor::ones(shape))?;
        }

        let mut worklist = Worklist::new();
        worklist.push(creator);
        while let Some(node) = worklist.pop_max() {
            let mut capture = Capture {
                wanted: &wanted,
                taken: &mut taken,
            };
            for upstream in propagate(&node, &mut grads, Some(&mut capture))? {
                worklist.push(upstream);
            }
        }
        profiling::event("tape::gradient_calls");

        let resolved = sources
            .iter()
            .map(|source| {
                grads
                    .get(source.key())
                    .cloned()
                    .or_else(|| taken.get(&source.key()).cloned())
            })
            .collect();

        if self.persistent {
            *self.cache.borrow_mut() = Some(GradCache {
                target: target.key(),
                store: grads,
            });
        }
        Ok(resolved)
    }
}
