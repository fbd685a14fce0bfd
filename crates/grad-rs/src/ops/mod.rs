//! Concrete operations layered on top of the graph engine.
//!
//! Each operation pairs an [`Operation`](crate::graph::Operation)
//! implementation with a functional wrapper that lifts raw operands into
//! graph values. The engine supplies the bookkeeping; these modules supply
//! the math.

mod arithmetic;
mod linalg;
mod shape_ops;
mod support;

pub use arithmetic::{add, div, exp, mul, neg, square, sub, Add, Div, Exp, Mul, Neg, Square, Sub};
pub use linalg::{matmul, MatMul};
pub use shape_ops::{
    broadcast_to, greater, reshape, shape_of, stop_gradient, sum, sum_to, to_float, BroadcastTo,
    Greater, Reshape, ShapeOf, StopGradient, Sum, SumTo, ToFloat,
};
pub use support::IntoOperand;
