//! Typed multi-dimensional arrays.
//!
//! A [`Tensor`] pairs a logical shape with a flat Arrow array of primitive
//! values. The element type is the array's [`DataType`]; the shape is carried
//! alongside because Arrow arrays are one-dimensional.
//!
//! [`PartialShape`] describes a possibly-unknown shape (unknown rank, or
//! known rank with unknown dimensions) and is used to declare dataset output
//! signatures before any data flows.
//!
//! The mutable batch slab used by the map-and-batch operator lives in
//! [`slab::BatchBuffer`].

use std::fmt;
use std::sync::Arc;

use arrow_array::types::ArrowPrimitiveType;
use arrow_array::{Array, ArrayRef, PrimitiveArray};
use arrow_schema::DataType;
use smallvec::SmallVec;

use crate::error::{PipelineError, Result};

pub mod slab;

/// Shape storage; four inline dimensions cover batched image data.
pub type Shape = SmallVec<[usize; 4]>;

/// A typed multi-dimensional array: a shape plus a flat Arrow array.
///
/// Invariants, checked at construction:
/// - `values.len()` equals the product of the shape's dimensions,
/// - the array contains no nulls.
///
/// A rank-0 tensor (empty shape) holds exactly one element.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    values: ArrayRef,
}

impl Tensor {
    /// Creates a tensor from a shape and a flat array of values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the element count does not match the
    /// shape or the array contains nulls.
    pub fn try_new(shape: &[usize], values: ArrayRef) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(PipelineError::invalid_argument(format!(
                "shape {shape:?} requires {expected} elements, array has {}",
                values.len()
            )));
        }
        if values.null_count() != 0 {
            return Err(PipelineError::invalid_argument(
                "tensors do not support null values",
            ));
        }
        Ok(Self {
            shape: SmallVec::from_slice(shape),
            values,
        })
    }

    /// Creates a rank-1 tensor covering the whole array.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the array contains nulls.
    pub fn from_array(values: ArrayRef) -> Result<Self> {
        let len = values.len();
        Self::try_new(&[len], values)
    }

    /// Creates a rank-0 tensor holding a single primitive value.
    #[must_use]
    pub fn scalar<T: ArrowPrimitiveType>(value: T::Native) -> Self {
        let values: ArrayRef = Arc::new(PrimitiveArray::<T>::from_iter_values([value]));
        Self {
            shape: SmallVec::new(),
            values,
        }
    }

    /// Creates a tensor of the given shape from a vector of primitive values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the element count does not match the
    /// shape.
    pub fn from_vec<T: ArrowPrimitiveType>(shape: &[usize], values: Vec<T::Native>) -> Result<Self> {
        let values: ArrayRef = Arc::new(PrimitiveArray::<T>::from_iter_values(values));
        Self::try_new(shape, values)
    }

    /// The element type of this tensor.
    #[must_use]
    pub fn dtype(&self) -> &DataType {
        self.values.data_type()
    }

    /// The logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.values.len()
    }

    /// The leading dimension, or `None` for a rank-0 tensor.
    #[must_use]
    pub fn dim0(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    /// Elements per leading-dimension row (product of the trailing
    /// dimensions). For rank-0 tensors this is 1.
    #[must_use]
    pub fn row_stride(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// The flat array of values.
    #[must_use]
    pub fn values(&self) -> &ArrayRef {
        &self.values
    }

    /// Returns row `index` along the leading dimension as a tensor of the
    /// trailing shape. Zero-copy: the result shares this tensor's buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for rank-0 tensors and `OutOfRange` when
    /// `index` exceeds the leading dimension.
    pub fn row(&self, index: usize) -> Result<Tensor> {
        self.slice_rows(index, 1).map(|t| Tensor {
            shape: t.shape.iter().skip(1).copied().collect(),
            values: t.values,
        })
    }

    /// Returns `len` rows starting at `offset` along the leading dimension.
    /// Zero-copy: the result shares this tensor's buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for rank-0 tensors and `OutOfRange` when
    /// the requested range exceeds the leading dimension.
    pub fn slice_rows(&self, offset: usize, len: usize) -> Result<Tensor> {
        let Some(dim0) = self.dim0() else {
            return Err(PipelineError::invalid_argument(
                "cannot slice a rank-0 tensor",
            ));
        };
        if offset + len > dim0 {
            return Err(PipelineError::OutOfRange(format!(
                "rows [{offset}, {}) exceed leading dimension {dim0}",
                offset + len
            )));
        }
        let stride = self.row_stride();
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Tensor {
            shape,
            values: self.values.slice(offset * stride, len * stride),
        })
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.values.to_data() == other.values.to_data()
    }
}

/// A possibly-unknown shape: unknown rank, or a known rank where individual
/// dimensions may be unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialShape {
    dims: Option<Vec<Option<usize>>>,
}

impl PartialShape {
    /// A shape of unknown rank; compatible with everything.
    #[must_use]
    pub fn unknown() -> Self {
        Self { dims: None }
    }

    /// A shape of known rank with possibly-unknown dimensions.
    #[must_use]
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self { dims: Some(dims) }
    }

    /// A fully-known shape.
    #[must_use]
    pub fn known(dims: &[usize]) -> Self {
        Self {
            dims: Some(dims.iter().map(|d| Some(*d)).collect()),
        }
    }

    /// The scalar shape (known rank 0).
    #[must_use]
    pub fn scalar() -> Self {
        Self::known(&[])
    }

    /// The rank, if known.
    #[must_use]
    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// The per-dimension sizes, if the rank is known.
    #[must_use]
    pub fn dims(&self) -> Option<&[Option<usize>]> {
        self.dims.as_deref()
    }

    /// Whether a concrete shape satisfies this descriptor.
    #[must_use]
    pub fn is_compatible_with(&self, shape: &[usize]) -> bool {
        match &self.dims {
            None => true,
            Some(dims) => {
                dims.len() == shape.len()
                    && dims
                        .iter()
                        .zip(shape)
                        .all(|(dim, actual)| dim.is_none() || *dim == Some(*actual))
            }
        }
    }

    /// Returns this shape with an extra leading dimension prepended.
    /// An unknown-rank shape stays unknown.
    #[must_use]
    pub fn prepend(&self, dim: Option<usize>) -> PartialShape {
        match &self.dims {
            None => Self::unknown(),
            Some(dims) => {
                let mut out = Vec::with_capacity(dims.len() + 1);
                out.push(dim);
                out.extend(dims.iter().copied());
                Self::new(out)
            }
        }
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "?"),
            Some(dims) => {
                write!(f, "[")?;
                for (i, dim) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match dim {
                        Some(d) => write!(f, "{d}")?,
                        None => write!(f, "?")?,
                    }
                }
                write!(f, "]")
            }
        }
    }
}
