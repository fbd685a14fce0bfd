//! Graph-visible value container and its non-owning handle.
//!
//! A [`Value`] owns its producing operation strongly while operations hold
//! their outputs only through [`ValueHandle`]s, which breaks the
//! value/operation reference cycle on the operation side. Handles capture
//! shape and dtype at creation so both stay queryable after the value's
//! buffer is released or the value itself is dropped.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::node::OpNode;
use crate::error::{GraphError, Result};
use crate::tensor::{DType, Shape, Tensor};

/// Concrete data carried by a graph value.
///
/// Scalars and dimension tuples ride through the same graph machinery as
/// tensors so shape arithmetic and scalar operands form ordinary nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Tensor(Tensor),
    Scalar(f32),
    Dims(Vec<usize>),
    /// Buffer released (compiled build) or never present (undetermined).
    Released,
}

impl Payload {
    /// Logical shape of the payload, if it has one.
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Payload::Tensor(t) => Some(t.shape().clone()),
            Payload::Scalar(_) => Some(Shape::new([1])),
            Payload::Dims(dims) => Some(Shape::new([dims.len()])),
            Payload::Released => None,
        }
    }

    /// Logical dtype of the payload, if it has one.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Payload::Tensor(t) => Some(t.dtype()),
            Payload::Scalar(_) => Some(DType::F32),
            Payload::Dims(_) => Some(DType::I32),
            Payload::Released => None,
        }
    }

    /// Materializes the payload as a tensor for arithmetic.
    pub(crate) fn as_tensor(&self) -> Result<Tensor> {
        match self {
            Payload::Tensor(t) => Ok(t.clone()),
            Payload::Scalar(v) => Ok(Tensor::scalar(*v)),
            Payload::Dims(_) => Err(GraphError::invalid_state(
                "tensor operand expected, got a dimension tuple",
            )),
            Payload::Released => Err(GraphError::invalid_state(
                "tensor operand expected, got a released value",
            )),
        }
    }

    /// Reads the payload as a dimension tuple.
    pub(crate) fn as_dims(&self) -> Result<Vec<usize>> {
        match self {
            Payload::Dims(dims) => Ok(dims.clone()),
            other => Err(GraphError::invalid_state(format!(
                "dimension tuple expected, got {other:?}"
            ))),
        }
    }
}

pub(crate) struct ValueInner {
    payload: RefCell<Payload>,
    creator: RefCell<Option<Rc<OpNode>>>,
    generation: Cell<u32>,
    name: RefCell<Option<String>>,
    undetermined: bool,
}

/// A graph leaf or operation result: payload plus graph linkage.
#[derive(Clone)]
pub struct Value {
    inner: Rc<ValueInner>,
}

impl Value {
    fn from_parts(payload: Payload, undetermined: bool) -> Self {
        Value {
            inner: Rc::new(ValueInner {
                payload: RefCell::new(payload),
                creator: RefCell::new(None),
                generation: Cell::new(0),
                name: RefCell::new(None),
                undetermined,
            }),
        }
    }

    /// Wraps a raw tensor as a graph leaf.
    pub fn new(tensor: Tensor) -> Self {
        Value::from_parts(Payload::Tensor(tensor), false)
    }

    /// Wraps a bare number so it participates in the graph uniformly.
    pub fn scalar(value: f32) -> Self {
        Value::from_parts(Payload::Scalar(value), false)
    }

    /// Wraps a dimension tuple so shape-producing and shape-consuming
    /// operations are ordinary graph nodes.
    pub fn dims<D: Into<Vec<usize>>>(dims: D) -> Self {
        Value::from_parts(Payload::Dims(dims.into()), false)
    }

    /// A placeholder with no data, used to trace a function for structure
    /// only.
    pub fn undetermined() -> Self {
        Value::from_parts(Payload::Released, true)
    }

    pub(crate) fn from_payload(payload: Payload) -> Self {
        Value::from_parts(payload, false)
    }

    /// Attaches a diagnostic name, consuming and returning the value.
    pub fn named(self, name: impl Into<String>) -> Self {
        *self.inner.name.borrow_mut() = Some(name.into());
        self
    }

    /// Diagnostic name, if one was attached.
    pub fn name(&self) -> Option<String> {
        self.inner.name.borrow().clone()
    }

    pub(crate) fn label(&self) -> String {
        self.name().unwrap_or_else(|| "<unnamed>".to_string())
    }

    /// Reports whether this value is a structural placeholder.
    pub fn is_undetermined(&self) -> bool {
        self.inner.undetermined
    }

    /// Reports whether a concrete payload is present.
    pub fn has_payload(&self) -> bool {
        !matches!(*self.inner.payload.borrow(), Payload::Released)
    }

    /// Clones out the current payload, released or not.
    pub fn payload(&self) -> Payload {
        self.inner.payload.borrow().clone()
    }

    /// Clones out the payload, failing if the buffer is gone.
    pub(crate) fn payload_checked(&self) -> Result<Payload> {
        let payload = self.inner.payload.borrow();
        if matches!(*payload, Payload::Released) {
            return Err(GraphError::invalid_state(format!(
                "payload of `{}` is not available",
                self.label()
            )));
        }
        Ok(payload.clone())
    }

    /// Materializes the payload as a tensor.
    pub fn tensor(&self) -> Result<Tensor> {
        self.payload_checked()?.as_tensor()
    }

    /// Shape of the payload; fails on a payload-less value.
    pub fn shape(&self) -> Result<Shape> {
        self.try_shape().ok_or_else(|| {
            GraphError::invalid_state(format!("shape of `{}` is not available", self.label()))
        })
    }

    /// Shape of the payload, or `None` for placeholders and released buffers.
    pub fn try_shape(&self) -> Option<Shape> {
        self.inner.payload.borrow().shape()
    }

    /// DType of the payload; fails on a payload-less value.
    pub fn dtype(&self) -> Result<DType> {
        self.inner.payload.borrow().dtype().ok_or_else(|| {
            GraphError::invalid_state(format!("dtype of `{}` is not available", self.label()))
        })
    }

    /// Topological depth: 0 for leaves, `creator.generation + 1` otherwise.
    pub fn generation(&self) -> u32 {
        self.inner.generation.get()
    }

    /// The operation that produced this value, if any.
    pub fn creator(&self) -> Option<Rc<OpNode>> {
        self.inner.creator.borrow().clone()
    }

    /// Links the producing operation. May be called at most once.
    pub(crate) fn set_creator(&self, node: &Rc<OpNode>) -> Result<()> {
        let mut creator = self.inner.creator.borrow_mut();
        if creator.is_some() {
            return Err(GraphError::invalid_state(format!(
                "creator of `{}` was already assigned",
                self.label()
            )));
        }
        *creator = Some(Rc::clone(node));
        self.inner.generation.set(node.generation() + 1);
        Ok(())
    }

    /// Non-owning handle preserving shape/dtype beyond the value's lifetime.
    pub fn reference(&self) -> ValueHandle {
        let payload = self.inner.payload.borrow();
        ValueHandle {
            target: Rc::downgrade(&self.inner),
            shape: payload.shape(),
            dtype: payload.dtype(),
        }
    }

    /// Drops the payload buffer while keeping graph linkage intact. Shape and
    /// dtype stay answerable through previously captured handles.
    pub(crate) fn release_payload(&self) {
        *self.inner.payload.borrow_mut() = Payload::Released;
    }

    /// Identity key used by gradient and scratch maps.
    pub(crate) fn key(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn ptr_eq(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("payload", &*self.inner.payload.borrow())
            .field("generation", &self.inner.generation.get())
            .field("name", &*self.inner.name.borrow())
            .field("undetermined", &self.inner.undetermined)
            .finish()
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::new(tensor)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::scalar(value)
    }
}

/// Non-owning, shape/dtype-preserving reference to a [`Value`].
///
/// Operations hold their outputs exclusively through these, so dropping every
/// strong reference to a value frees its buffer while handles keep answering
/// shape/dtype queries and keep a stable identity key.
#[derive(Clone)]
pub struct ValueHandle {
    target: Weak<ValueInner>,
    shape: Option<Shape>,
    dtype: Option<DType>,
}

impl ValueHandle {
    /// Upgrades to the value if it is still alive.
    pub fn get(&self) -> Option<Value> {
        self.target.upgrade().map(|inner| Value { inner })
    }

    /// Shape captured at value creation; `None` for placeholders.
    pub fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    /// DType captured at value creation; `None` for placeholders.
    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    /// Identity key shared with the underlying value. Stays valid for map
    /// lookups even after the value is dropped.
    pub(crate) fn key(&self) -> usize {
        self.target.as_ptr() as usize
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("alive", &(self.target.strong_count() > 0))
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}
