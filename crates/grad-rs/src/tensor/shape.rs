//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if `dims` is empty, ensuring every tensor has at least one axis.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Computes the shape two operands broadcast to, right-aligning axes the
    /// way NumPy does. Returns `None` when a non-unit axis pair disagrees.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let mut dims = vec![0usize; rank];
        for offset in 0..rank {
            let a = self.dim_from_right(offset);
            let b = other.dim_from_right(offset);
            dims[rank - 1 - offset] = match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
        }
        Some(Shape::new(dims))
    }

    /// Reports whether `self` can be expanded to `target` under broadcasting.
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        if self.rank() > target.rank() {
            return false;
        }
        (0..self.rank()).all(|i| {
            let src = self.dim_from_right(i);
            src == 1 || src == target.dim_from_right(i)
        })
    }

    /// Row-major strides of the shape, in elements.
    pub(crate) fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1usize;
        for axis in (0..self.rank()).rev() {
            strides[axis] = acc;
            acc *= self.dims[axis];
        }
        strides
    }

    /// Dimension `offset` axes from the trailing axis, padding with 1 past the
    /// leading axis so broadcast arithmetic stays uniform.
    fn dim_from_right(&self, offset: usize) -> usize {
        if offset < self.rank() {
            self.dims[self.rank() - 1 - offset]
        } else {
            1
        }
    }
}
