//! Scoped per-invocation execution context.
//!
//! A thread-local stack of session frames carries the execution mode and a
//! call-local scratch namespace keyed by value identity. Frames are pushed
//! and popped only through RAII guards so every exit path, including errors,
//! restores the caller's context.

use std::cell::RefCell;
use std::collections::HashMap;

use super::value::{Payload, Value};
use crate::error::Result;

/// Execution mode visible to nested operation calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Plain define-by-run evaluation.
    Eager,
    /// A compiled graph is tracing its wrapped function.
    UnderConstruction,
    /// A compiled pipeline is replaying against raw payloads.
    Executing,
}

struct Frame {
    mode: ExecMode,
    scratch: HashMap<usize, Payload>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard that pops its session frame when dropped.
pub(crate) struct SessionGuard {
    active: bool,
}

impl SessionGuard {
    /// Pops the frame early and hands back its scratch map, so a caller can
    /// stash per-call intermediates for a later backward pass.
    pub(crate) fn finish(mut self) -> HashMap<usize, Payload> {
        self.active = false;
        FRAMES
            .with(|frames| frames.borrow_mut().pop())
            .map(|frame| frame.scratch)
            .unwrap_or_default()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.active {
            FRAMES.with(|frames| {
                frames.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

/// Opens a session frame with an empty scratch namespace.
pub(crate) fn push(mode: ExecMode) -> SessionGuard {
    push_with_scratch(mode, HashMap::new())
}

/// Opens a session frame seeded with an existing scratch map, used when a
/// backward pass revisits the intermediates of a recorded forward call.
pub(crate) fn push_with_scratch(mode: ExecMode, scratch: HashMap<usize, Payload>) -> SessionGuard {
    FRAMES.with(|frames| frames.borrow_mut().push(Frame { mode, scratch }));
    SessionGuard { active: true }
}

/// Mode of the innermost active session, or eager when none is open.
pub fn current_mode() -> ExecMode {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .last()
            .map(|frame| frame.mode)
            .unwrap_or(ExecMode::Eager)
    })
}

/// Writes a per-call payload into the innermost session frame.
pub(crate) fn store(key: usize, payload: Payload) {
    FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            frame.scratch.insert(key, payload);
        }
    });
}

/// Looks a key up through the session stack, innermost frame first.
pub(crate) fn fetch(key: usize) -> Option<Payload> {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .iter()
            .rev()
            .find_map(|frame| frame.scratch.get(&key).cloned())
    })
}

/// Resolves a value to its current payload: the session scratch shadows the
/// value's own buffer, so replayed calls see per-call data.
pub(crate) fn resolve(value: &Value) -> Result<Payload> {
    if let Some(payload) = fetch(value.key()) {
        return Ok(payload);
    }
    value.payload_checked()
}
