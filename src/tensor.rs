use crate::error::Error;
use crate::ops::cpu_ops;
use crate::util::{check_shape, numel};

use rayon::prelude::*;
use std::ops::{Add, Mul};
use std::sync::Arc;

/// Element type of every tensor buffer.
pub type Elem = f64;

/// Tensor shape, always interpreted as (batch, channel, height, width).
pub type Shape = [usize; 4];

/// A 4-dimensional dense tensor over a shared, copy-on-write buffer.
///
/// Cloning a `Tensor` is cheap and aliases the same buffer. Every mutating
/// method first makes the buffer unique (`Arc::make_mut`), so a mutation is
/// never observed through another alias. Use [`Tensor::deep_copy`] to detach
/// eagerly.
///
/// Equality is an aliasing test: two tensors are equal when they share the
/// same buffer and carry the same shape. Compare `as_slice()` for values.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Arc<Vec<Elem>>,
    shape: Shape,
    initialized: bool,
}

impl Tensor {
    /// Creates a tensor of `shape` with every element set to `fill`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeError`] if any dimension is zero.
    pub fn new(shape: Shape, fill: Elem) -> Result<Self, Error> {
        check_shape(&shape)?;
        Ok(Tensor {
            data: Arc::new(vec![fill; numel(&shape)]),
            shape,
            initialized: true,
        })
    }

    pub fn zeros(shape: Shape) -> Result<Self, Error> {
        Self::new(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Result<Self, Error> {
        Self::new(shape, 1.0)
    }

    /// A 1x1x1x1 tensor holding `value`.
    pub fn scalar(value: Elem) -> Self {
        Tensor {
            data: Arc::new(vec![value]),
            shape: [1, 1, 1, 1],
            initialized: true,
        }
    }

    /// Creates a tensor from an owned row-major buffer.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `data.len()` differs from the shape's product.
    ///
    /// # Example
    /// ```rust
    /// use jacobi_graph::Tensor;
    ///
    /// let t = Tensor::from_vec([1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(t.get([0, 0, 1, 0]).unwrap(), 3.0);
    /// ```
    pub fn from_vec(shape: Shape, data: Vec<Elem>) -> Result<Self, Error> {
        Self::from_shared(shape, Arc::new(data))
    }

    /// Creates a tensor that aliases an existing buffer.
    pub fn from_shared(shape: Shape, data: Arc<Vec<Elem>>) -> Result<Self, Error> {
        check_shape(&shape)?;
        if data.len() != numel(&shape) {
            return Err(Error::ShapeMismatch {
                expected: vec![numel(&shape)],
                actual: vec![data.len()],
            });
        }
        Ok(Tensor {
            data,
            shape,
            initialized: true,
        })
    }

    /// A placeholder that rejects every read until it is resized or replaced.
    pub fn uninitialized() -> Self {
        Tensor {
            data: Arc::new(Vec::new()),
            shape: [0; 4],
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of elements, zero for an uninitialized tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements in one (batch, channel) slice.
    pub fn slice_len(&self) -> usize {
        self.shape[2] * self.shape[3]
    }

    fn ensure_initialized(&self) -> Result<(), Error> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::Uninitialized)
        }
    }

    pub fn as_slice(&self) -> Result<&[Elem], Error> {
        self.ensure_initialized()?;
        Ok(self.data.as_slice())
    }

    /// Mutable access to the buffer, detaching it from any alias first.
    pub fn as_mut_slice(&mut self) -> Result<&mut [Elem], Error> {
        self.ensure_initialized()?;
        Ok(Arc::make_mut(&mut self.data).as_mut_slice())
    }

    pub fn to_vec(&self) -> Result<Vec<Elem>, Error> {
        Ok(self.as_slice()?.to_vec())
    }

    /// A tensor with the same shape and values and an independent buffer.
    pub fn deep_copy(&self) -> Self {
        Tensor {
            data: Arc::new(self.data.as_ref().clone()),
            shape: self.shape,
            initialized: self.initialized,
        }
    }

    pub fn shares_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn offset(&self, index: [usize; 4]) -> Result<usize, Error> {
        self.ensure_initialized()?;
        let mut flat = 0;
        for axis in 0..4 {
            if index[axis] >= self.shape[axis] {
                return Err(Error::IndexOutOfBounds {
                    index: index[axis],
                    size: self.shape[axis],
                });
            }
            flat = flat * self.shape[axis] + index[axis];
        }
        Ok(flat)
    }

    pub fn get(&self, index: [usize; 4]) -> Result<Elem, Error> {
        let flat = self.offset(index)?;
        Ok(self.data[flat])
    }

    pub fn set(&mut self, index: [usize; 4], value: Elem) -> Result<(), Error> {
        let flat = self.offset(index)?;
        self.as_mut_slice()?[flat] = value;
        Ok(())
    }

    pub fn get_flat(&self, index: usize) -> Result<Elem, Error> {
        self.as_slice()?
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                index,
                size: self.len(),
            })
    }

    pub fn set_flat(&mut self, index: usize, value: Elem) -> Result<(), Error> {
        let size = self.len();
        let slot = self
            .as_mut_slice()?
            .get_mut(index)
            .ok_or(Error::IndexOutOfBounds { index, size })?;
        *slot = value;
        Ok(())
    }

    /// Changes the shape, keeping the existing prefix of the buffer and filling
    /// new elements with `fill`. A no-op when the shape is unchanged. Resizing
    /// an uninitialized tensor initializes it.
    pub fn resize(&mut self, shape: Shape, fill: Elem) -> Result<(), Error> {
        check_shape(&shape)?;
        if self.initialized && shape == self.shape {
            return Ok(());
        }
        Arc::make_mut(&mut self.data).resize(numel(&shape), fill);
        self.shape = shape;
        self.initialized = true;
        Ok(())
    }

    /// Relabels this tensor's shape in place; the element count must not change.
    pub fn relabel(&mut self, shape: Shape) -> Result<(), Error> {
        self.ensure_initialized()?;
        check_shape(&shape)?;
        if numel(&shape) != self.len() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.to_vec(),
                actual: shape.to_vec(),
            });
        }
        self.shape = shape;
        Ok(())
    }

    /// A relabeled alias of this tensor; the buffer is shared, not copied.
    pub fn view(&self, shape: Shape) -> Result<Tensor, Error> {
        let mut out = self.clone();
        out.relabel(shape)?;
        Ok(out)
    }

    pub fn map<F>(&self, f: F) -> Result<Tensor, Error>
    where
        F: Fn(Elem) -> Elem + Sync + Send,
    {
        let data: Vec<Elem> = self.as_slice()?.par_iter().map(|&x| f(x)).collect();
        Tensor::from_vec(self.shape, data)
    }

    pub fn map_inplace<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: Fn(Elem) -> Elem + Sync + Send,
    {
        self.as_mut_slice()?.par_iter_mut().for_each(|x| *x = f(*x));
        Ok(())
    }

    pub fn scale(&self, factor: Elem) -> Result<Tensor, Error> {
        self.map(|x| x * factor)
    }

    pub fn add_scalar(&self, value: Elem) -> Result<Tensor, Error> {
        self.map(|x| x + value)
    }

    pub fn sum(&self) -> Result<Elem, Error> {
        Ok(self.as_slice()?.par_iter().sum())
    }

    pub fn mean(&self) -> Result<Elem, Error> {
        Ok(self.sum()? / self.len() as Elem)
    }

    /// Elementwise sum with tiled broadcasting of the smaller operand.
    pub fn add(&self, other: &Tensor) -> Result<Tensor, Error> {
        cpu_ops::binary_tiled("add", self, other, |a, b| a + b)
    }

    /// In-place [`Tensor::add`]. The shape grows if `other` is the larger operand.
    pub fn add_(&mut self, other: &Tensor) -> Result<(), Error> {
        cpu_ops::binary_tiled_inplace("add", self, other, |a, b| a + b)
    }

    /// Elementwise (Hadamard) product with tiled broadcasting.
    pub fn mul_elementwise(&self, other: &Tensor) -> Result<Tensor, Error> {
        cpu_ops::binary_tiled("mul", self, other, |a, b| a * b)
    }

    pub fn mul_elementwise_(&mut self, other: &Tensor) -> Result<(), Error> {
        cpu_ops::binary_tiled_inplace("mul", self, other, |a, b| a * b)
    }

    /// Batched matrix product over matching (batch, channel) slices.
    ///
    /// # Example
    /// ```rust
    /// use jacobi_graph::Tensor;
    ///
    /// let a = Tensor::from_vec([1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// let b = Tensor::ones([1, 1, 4, 1]).unwrap();
    /// assert_eq!(a.matmul(&b).unwrap().to_vec().unwrap(), vec![10.0]);
    /// ```
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, Error> {
        cpu_ops::matmul(self, other)
    }

    /// Swaps H and W of every slice in place.
    pub fn transpose(&mut self) -> Result<(), Error> {
        cpu_ops::transpose_inplace(self)
    }

    pub fn transposed(&self) -> Result<Tensor, Error> {
        let mut out = self.clone();
        out.transpose()?;
        Ok(out)
    }

    /// Half-open `(start, end)` range per axis; negative bounds count from the end.
    pub fn slice(&self, ranges: &[(isize, isize); 4]) -> Result<Tensor, Error> {
        cpu_ops::slice(self, ranges)
    }

    pub fn assign_slice(&mut self, ranges: &[(isize, isize); 4], src: &Tensor) -> Result<(), Error> {
        cpu_ops::assign_slice(self, ranges, src)
    }

    pub fn concat(&self, other: &Tensor, axis: usize) -> Result<Tensor, Error> {
        cpu_ops::concat(self, other, axis)
    }

    /// Sums along `axis`, keeping it with size 1. `-1` reduces to a 1x1x1x1 scalar.
    pub fn sum_by_dim(&self, axis: isize) -> Result<Tensor, Error> {
        cpu_ops::sum_by_dim(self, axis)
    }

    pub fn tile_to(&self, shape: Shape) -> Result<Tensor, Error> {
        cpu_ops::tile_to(self, shape)
    }

    /// Repeats batch and channel slices up to `n` x `c`.
    pub fn repeat_slices(&self, n: usize, c: usize) -> Result<Tensor, Error> {
        cpu_ops::tile_to(self, [n, c, self.shape[2], self.shape[3]])
    }
}

impl Default for Tensor {
    fn default() -> Self {
        Tensor::uninitialized()
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shares_buffer(other) && self.shape == other.shape
    }
}

impl<'a> Add<&'a Tensor> for &'a Tensor {
    type Output = Result<Tensor, Error>;

    fn add(self, rhs: &'a Tensor) -> Self::Output {
        Tensor::add(self, rhs)
    }
}

impl<'a> Mul<&'a Tensor> for &'a Tensor {
    type Output = Result<Tensor, Error>;

    fn mul(self, rhs: &'a Tensor) -> Self::Output {
        self.matmul(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_detaches_alias() {
        let a = Tensor::from_vec([1, 1, 1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        let mut b = a.clone();
        assert_eq!(a, b);
        b.set([0, 0, 0, 1], 9.0).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(b.to_vec().unwrap(), vec![1.0, 9.0, 3.0]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_view_shares_buffer_but_not_shape() {
        let a = Tensor::zeros([1, 1, 2, 3]).unwrap();
        let v = a.view([1, 1, 3, 2]).unwrap();
        assert!(a.shares_buffer(&v));
        assert_ne!(a, v);
    }

    #[test]
    fn test_uninitialized_rejects_reads() {
        let t = Tensor::default();
        assert!(matches!(t.as_slice(), Err(Error::Uninitialized)));
        assert!(matches!(t.sum_by_dim(-1), Err(Error::Uninitialized)));
    }
}
