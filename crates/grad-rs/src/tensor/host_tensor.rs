//! Host-backed tensor supplying the arithmetic primitives the graph consumes.

use std::mem::{size_of, ManuallyDrop};

use rand::Rng;

use super::{dtype::DType, shape::Shape};
use crate::error::{GraphError, Result};

/// Dense host tensor used for graph payloads, gradients, and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    data: Vec<u8>,
}

impl Tensor {
    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            return Err(GraphError::shape_mismatch(
                "from_vec",
                shape.dims(),
                &[data.len()],
            ));
        }
        Ok(Tensor {
            shape,
            dtype: DType::F32,
            data: vec_into_bytes(data),
        })
    }

    /// Constructs an `I32` tensor, ensuring the payload matches the expected element count.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            return Err(GraphError::shape_mismatch(
                "from_i32",
                shape.dims(),
                &[data.len()],
            ));
        }
        Ok(Tensor {
            shape,
            dtype: DType::I32,
            data: vec_into_bytes(data),
        })
    }

    /// Wraps a single value as a one-element tensor.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Shape::new([1]),
            dtype: DType::F32,
            data: vec_into_bytes(vec![value]),
        }
    }

    /// Returns a zero-initialized `F32` tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            dtype: DType::F32,
            data: vec_into_bytes(vec![0.0; len]),
        }
    }

    /// Returns a one-initialized `F32` tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            dtype: DType::F32,
            data: vec_into_bytes(vec![1.0; len]),
        }
    }

    /// Zero tensor matching the shape of `self`.
    pub fn zeros_like(&self) -> Self {
        Tensor::zeros(self.shape.clone())
    }

    /// One tensor matching the shape of `self`.
    pub fn ones_like(&self) -> Self {
        Tensor::ones(self.shape.clone())
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            dtype: DType::F32,
            data: vec_into_bytes(values),
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the scalar dtype of the tensor payload.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Borrows the underlying `f32` data slice, panicking if the dtype differs.
    pub fn data(&self) -> &[f32] {
        match self.dtype {
            DType::F32 => bytes_as_slice::<f32>(&self.data),
            _ => panic!("tensor data is not stored as f32"),
        }
    }

    /// Borrows the underlying `i32` data slice, panicking if the dtype differs.
    pub fn data_i32(&self) -> &[i32] {
        match self.dtype {
            DType::I32 => bytes_as_slice::<i32>(&self.data),
            _ => panic!("tensor data is not stored as i32"),
        }
    }

    /// Converts integer payloads to `F32`; float tensors pass through.
    pub fn to_f32(&self) -> Tensor {
        match self.dtype {
            DType::F32 => self.clone(),
            DType::I32 => {
                let values: Vec<f32> = self.data_i32().iter().map(|&v| v as f32).collect();
                Tensor {
                    shape: self.shape.clone(),
                    dtype: DType::F32,
                    data: vec_into_bytes(values),
                }
            }
        }
    }

    /// Extracts the sole element of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.len() != 1 {
            return Err(GraphError::shape_mismatch(
                "item",
                self.shape.dims(),
                &[1],
            ));
        }
        Ok(self.data()[0])
    }

    /// Applies a unary function over every scalar, producing a fresh tensor.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        let values: Vec<f32> = self.data().iter().map(|&v| f(v)).collect();
        Tensor {
            shape: self.shape.clone(),
            dtype: DType::F32,
            data: vec_into_bytes(values),
        }
    }

    /// Broadcasting elementwise combination of two tensors into a fresh buffer.
    pub fn zip_with<F>(&self, rhs: &Tensor, op: &'static str, f: F) -> Result<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        let out_shape = self.shape.broadcast_with(&rhs.shape).ok_or_else(|| {
            GraphError::shape_mismatch(op, self.shape.dims(), rhs.shape.dims())
        })?;
        let lhs_strides = expanded_strides(&self.shape, &out_shape);
        let rhs_strides = expanded_strides(&rhs.shape, &out_shape);
        let lhs = self.data();
        let rhs_data = rhs.data();
        let n = out_shape.num_elements();
        let mut values = Vec::with_capacity(n);
        let mut coords = vec![0usize; out_shape.rank()];
        for _ in 0..n {
            let li = offset_for(&coords, &lhs_strides);
            let ri = offset_for(&coords, &rhs_strides);
            values.push(f(lhs[li], rhs_data[ri]));
            advance(&mut coords, out_shape.dims());
        }
        Ok(Tensor {
            shape: out_shape,
            dtype: DType::F32,
            data: vec_into_bytes(values),
        })
    }

    /// Broadcasting elementwise addition. Always allocates a fresh result so
    /// aliased operands are never mutated.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "add", |a, b| a + b)
    }

    /// Broadcasting elementwise multiplication.
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "mul", |a, b| a * b)
    }

    /// Broadcasting elementwise comparison producing 1/0 flags as `I32`.
    pub fn greater(&self, rhs: &Tensor) -> Result<Tensor> {
        let flags = self.zip_with(rhs, "greater", |a, b| if a > b { 1.0 } else { 0.0 })?;
        let values: Vec<i32> = flags.data().iter().map(|&v| v as i32).collect();
        Tensor::from_i32(flags.shape.clone(), values)
    }

    /// Expands the tensor to `target` by repeating broadcast axes.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Tensor> {
        if !self.shape.broadcasts_to(target) {
            return Err(GraphError::shape_mismatch(
                "broadcast_to",
                self.shape.dims(),
                target.dims(),
            ));
        }
        let strides = expanded_strides(&self.shape, target);
        let src = self.data();
        let n = target.num_elements();
        let mut values = Vec::with_capacity(n);
        let mut coords = vec![0usize; target.rank()];
        for _ in 0..n {
            values.push(src[offset_for(&coords, &strides)]);
            advance(&mut coords, target.dims());
        }
        Tensor::from_vec(target.clone(), values)
    }

    /// Collapses a broadcast expansion back to `target` by summation, the
    /// reduction used to shrink gradients to operand rank.
    pub fn sum_to(&self, target: &Shape) -> Result<Tensor> {
        if self.shape == *target {
            return Ok(self.clone());
        }
        if !target.broadcasts_to(&self.shape) {
            return Err(GraphError::shape_mismatch(
                "sum_to",
                self.shape.dims(),
                target.dims(),
            ));
        }
        let strides = expanded_strides(target, &self.shape);
        let src = self.data();
        let mut values = vec![0.0f32; target.num_elements()];
        let mut coords = vec![0usize; self.shape.rank()];
        for &v in src.iter() {
            values[offset_for(&coords, &strides)] += v;
            advance(&mut coords, self.shape.dims());
        }
        Tensor::from_vec(target.clone(), values)
    }

    /// Sums every element into a one-element tensor.
    pub fn sum_all(&self) -> Tensor {
        let total: f32 = self.data().iter().sum();
        Tensor::scalar(total)
    }

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape(&self, target: Shape) -> Result<Tensor> {
        if target.num_elements() != self.len() {
            return Err(GraphError::shape_mismatch(
                "reshape",
                self.shape.dims(),
                target.dims(),
            ));
        }
        Ok(Tensor {
            shape: target,
            dtype: self.dtype,
            data: self.data.clone(),
        })
    }

    /// Matrix product for rank-2 × rank-2 and rank-2 × rank-1 operands.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let a_dims = self.shape.dims();
        let b_dims = rhs.shape.dims();
        match (a_dims, b_dims) {
            ([m, k], [k2, n]) if k == k2 => {
                let (m, k, n) = (*m, *k, *n);
                let a = self.data();
                let b = rhs.data();
                let mut out = vec![0.0f32; m * n];
                for i in 0..m {
                    for p in 0..k {
                        let scale = a[i * k + p];
                        for j in 0..n {
                            out[i * n + j] += scale * b[p * n + j];
                        }
                    }
                }
                Tensor::from_vec(Shape::new([m, n]), out)
            }
            ([m, k], [k2]) if k == k2 => {
                let (m, k) = (*m, *k);
                let a = self.data();
                let b = rhs.data();
                let mut out = vec![0.0f32; m];
                for i in 0..m {
                    for p in 0..k {
                        out[i] += a[i * k + p] * b[p];
                    }
                }
                Tensor::from_vec(Shape::new([m]), out)
            }
            _ => Err(GraphError::shape_mismatch("matmul", a_dims, b_dims)),
        }
    }

    /// Transposes a rank-2 tensor.
    pub fn transpose2d(&self) -> Result<Tensor> {
        let dims = self.shape.dims();
        let [rows, cols] = match dims {
            [r, c] => [*r, *c],
            _ => return Err(GraphError::shape_mismatch("transpose2d", dims, &[0, 0])),
        };
        let src = self.data();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = src[r * cols + c];
            }
        }
        Tensor::from_vec(Shape::new([cols, rows]), out)
    }
}

/// Strides for reading `src`-shaped data at coordinates of `target`, with
/// zero stride on broadcast axes.
fn expanded_strides(src: &Shape, target: &Shape) -> Vec<usize> {
    let src_strides = src.strides();
    let src_dims = src.dims();
    let pad = target.rank() - src.rank();
    let mut strides = vec![0usize; target.rank()];
    for axis in 0..src.rank() {
        if src_dims[axis] != 1 {
            strides[pad + axis] = src_strides[axis];
        }
    }
    strides
}

fn offset_for(coords: &[usize], strides: &[usize]) -> usize {
    coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum()
}

/// Odometer-style coordinate increment over `dims`.
fn advance(coords: &mut [usize], dims: &[usize]) {
    for axis in (0..coords.len()).rev() {
        coords[axis] += 1;
        if coords[axis] < dims[axis] {
            return;
        }
        coords[axis] = 0;
    }
}

/// Converts an owned vector into a raw byte buffer without copying.
fn vec_into_bytes<T>(data: Vec<T>) -> Vec<u8> {
    let mut data = ManuallyDrop::new(data);
    let ptr = data.as_mut_ptr() as *mut u8;
    let len = data.len() * size_of::<T>();
    let cap = data.capacity() * size_of::<T>();
    unsafe { Vec::from_raw_parts(ptr, len, cap) }
}

/// Views a byte slice as a typed slice, asserting that the layout matches.
fn bytes_as_slice<T>(bytes: &[u8]) -> &[T] {
    assert_eq!(
        bytes.len() % size_of::<T>(),
        0,
        "byte length {} is not a multiple of element size {}",
        bytes.len(),
        size_of::<T>()
    );
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / size_of::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_add_expands_leading_axes() {
        let row = Tensor::from_vec(Shape::new([3]), vec![1.0, 2.0, 3.0]).unwrap();
        let grid = Tensor::from_vec(Shape::new([2, 3]), vec![0.0; 6]).unwrap();
        let sum = row.add(&grid).unwrap();
        assert_eq!(sum.shape().dims(), &[2, 3]);
        assert_eq!(sum.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn sum_to_collapses_broadcast_axes() {
        let grid = Tensor::ones(Shape::new([2, 3]));
        let collapsed = grid.sum_to(&Shape::new([3])).unwrap();
        assert_eq!(collapsed.data(), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn matmul_matches_hand_computation() {
        let a = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_vec(Shape::new([2, 2]), vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn mismatched_broadcast_is_rejected() {
        let a = Tensor::ones(Shape::new([3]));
        let b = Tensor::ones(Shape::new([4]));
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn like_constructors_copy_the_shape() {
        let src = Tensor::ones(Shape::new([2, 4]));
        assert_eq!(src.zeros_like().shape(), src.shape());
        assert_eq!(src.ones_like().data(), &[1.0; 8]);
        assert_eq!(src.dtype().size_in_bytes(), 4);
    }

    #[test]
    fn integer_flags_cast_to_floats() {
        let a = Tensor::from_vec(Shape::new([3]), vec![1.0, -1.0, 2.0]).unwrap();
        let b = Tensor::zeros(Shape::new([3]));
        let flags = a.greater(&b).unwrap();
        assert_eq!(flags.data_i32(), &[1, 0, 1]);
        assert_eq!(flags.to_f32().data(), &[1.0, 0.0, 1.0]);
    }
}
