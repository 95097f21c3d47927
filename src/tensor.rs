//! Tensor implementation
//!
//! This module provides the core `Tensor` type, a shape-checked
//! N-dimensional array in row-major order. All shapes are fixed at
//! construction time; nothing in the export pipeline ever resizes a
//! tensor in place.

use std::fmt;

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// N-dimensional tensor with a statically known shape
///
/// # Examples
///
/// ```
/// use exportar::Tensor;
///
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor
    shape: Vec<usize>,
}

impl<T: Num + Clone> Tensor<T> {
    /// Create a new tensor from a vector and shape
    ///
    /// # Arguments
    ///
    /// * `shape` - Dimensions of the tensor
    /// * `data` - Flattened data in row-major order
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Shape is empty
    /// - Data size doesn't match shape
    /// - Shape contains zero
    ///
    /// # Examples
    ///
    /// ```
    /// use exportar::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(t.shape(), &[2, 2]);
    /// ```
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.is_empty() {
            return Err(ExportError::InvalidShape {
                reason: "Shape cannot be empty".to_string(),
            });
        }

        if shape.contains(&0) {
            return Err(ExportError::InvalidShape {
                reason: "Shape dimensions cannot be zero".to_string(),
            });
        }

        let expected_size: usize = shape.iter().product();

        if data.len() != expected_size {
            return Err(ExportError::InvalidShape {
                reason: format!(
                    "Data size {} does not match shape {:?} (expected {})",
                    data.len(),
                    shape,
                    expected_size
                ),
            });
        }

        Ok(Self { data, shape })
    }

    /// Create a tensor filled with a single value
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    pub fn full(shape: Vec<usize>, value: T) -> Result<Self> {
        let size: usize = shape.iter().product();
        Self::from_vec(shape, vec![value; size])
    }

    /// Create a tensor of zeros
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        Self::full(shape, T::zero())
    }

    /// Create a tensor of ones
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    pub fn ones(shape: Vec<usize>) -> Result<Self> {
        Self::full(shape, T::one())
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Consume the tensor and return its flattened data
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Return a tensor with the same data and a new shape
    ///
    /// # Errors
    ///
    /// Returns `Err` if the new shape has a different element count.
    pub fn reshaped(&self, shape: Vec<usize>) -> Result<Self> {
        Self::from_vec(shape, self.data.clone())
    }
}

impl Tensor<i32> {
    /// Create a 1-D tensor `[0, 1, ..., n-1]`
    ///
    /// Used for the precomputed position-index buffer of the static-shape
    /// wrapper.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `n` is zero.
    pub fn arange(n: usize) -> Result<Self> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let data: Vec<i32> = (0..n).map(|i| i as i32).collect();
        Self::from_vec(vec![n], data)
    }
}

impl<T: Num + Clone + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data=[", self.shape)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}
