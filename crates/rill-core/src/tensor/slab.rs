//! Pre-allocated batch slabs.
//!
//! A [`BatchBuffer`] is the mutable storage behind one component of a batch
//! under assembly: a flat, zero-initialized buffer holding `rows` slabs of a
//! fixed per-row shape. Rows are written out of order as transform
//! invocations complete, then the buffer is frozen into a [`Tensor`] whose
//! leading dimension is the number of rows actually produced.
//!
//! Writes dispatch on a closed set of element types (the Arrow primitive
//! integer and float types). Anything else is rejected with
//! `InvalidArgument`.

use std::sync::Arc;

use arrow_array::types::{
    ArrowPrimitiveType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{ArrayRef, PrimitiveArray};
use arrow_buffer::{Buffer, MutableBuffer, ScalarBuffer};
use arrow_schema::DataType;

use crate::error::{PipelineError, Result};

use super::{Shape, Tensor};

/// Dispatches `$body` with `$t` bound to the concrete Arrow primitive type
/// behind `$dtype`, or evaluates `$fallback` for unsupported types.
macro_rules! with_primitive {
    ($dtype:expr, $t:ident => $body:expr, _ => $fallback:expr) => {
        match $dtype {
            DataType::Int8 => {
                type $t = Int8Type;
                $body
            }
            DataType::Int16 => {
                type $t = Int16Type;
                $body
            }
            DataType::Int32 => {
                type $t = Int32Type;
                $body
            }
            DataType::Int64 => {
                type $t = Int64Type;
                $body
            }
            DataType::UInt8 => {
                type $t = UInt8Type;
                $body
            }
            DataType::UInt16 => {
                type $t = UInt16Type;
                $body
            }
            DataType::UInt32 => {
                type $t = UInt32Type;
                $body
            }
            DataType::UInt64 => {
                type $t = UInt64Type;
                $body
            }
            DataType::Float32 => {
                type $t = Float32Type;
                $body
            }
            DataType::Float64 => {
                type $t = Float64Type;
                $body
            }
            _ => $fallback,
        }
    };
}

/// Byte width of a supported element type, or `None` when unsupported.
fn byte_width(dtype: &DataType) -> Option<usize> {
    with_primitive!(dtype, T => Some(std::mem::size_of::<<T as ArrowPrimitiveType>::Native>()),
        _ => None)
}

/// Copies one row's worth of values into the buffer at `row`.
fn copy_row<T: ArrowPrimitiveType>(
    data: &mut MutableBuffer,
    row: usize,
    stride: usize,
    value: &Tensor,
) -> Result<()> {
    let array = value
        .values()
        .as_any()
        .downcast_ref::<PrimitiveArray<T>>()
        .ok_or_else(|| {
            PipelineError::internal("element type tag does not match the stored array")
        })?;
    let dst = data.typed_data_mut::<T::Native>();
    dst[row * stride..(row + 1) * stride].copy_from_slice(array.values());
    Ok(())
}

/// Freezes a buffer into a tensor of `rows` leading slabs.
fn freeze<T: ArrowPrimitiveType>(buffer: Buffer, shape: &[usize], len: usize) -> Result<Tensor> {
    let values = ScalarBuffer::<T::Native>::new(buffer, 0, len);
    let array: ArrayRef = Arc::new(PrimitiveArray::<T>::new(values, None));
    Tensor::try_new(shape, array)
}

/// Mutable storage for one component of a batch under assembly.
///
/// The buffer is allocated once, zero-filled, for the full batch size; rows
/// land at their offsets in any order. Emission takes a row count so a short
/// final batch reuses the same storage with a smaller leading dimension.
#[derive(Debug)]
pub struct BatchBuffer {
    dtype: DataType,
    element_shape: Shape,
    /// Elements per row.
    stride: usize,
    /// Row capacity (the batch size).
    rows: usize,
    width: usize,
    data: MutableBuffer,
}

impl BatchBuffer {
    /// Allocates a zeroed buffer for `rows` slabs of `element_shape`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `dtype` is outside the supported set.
    pub fn new(dtype: DataType, element_shape: &[usize], rows: usize) -> Result<Self> {
        let Some(width) = byte_width(&dtype) else {
            return Err(PipelineError::invalid_argument(format!(
                "unsupported data type for batching: {dtype}"
            )));
        };
        let stride: usize = element_shape.iter().product();
        Ok(Self {
            dtype,
            element_shape: Shape::from_slice(element_shape),
            stride,
            rows,
            width,
            data: MutableBuffer::from_len_zeroed(rows * stride * width),
        })
    }

    /// The element type of the buffer.
    #[must_use]
    pub fn dtype(&self) -> &DataType {
        &self.dtype
    }

    /// The per-row shape.
    #[must_use]
    pub fn element_shape(&self) -> &[usize] {
        &self.element_shape
    }

    /// Elements per row.
    #[must_use]
    pub fn row_elements(&self) -> usize {
        self.stride
    }

    /// Row capacity.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Writes `value` as the `row`-th slab.
    ///
    /// Semantically this assigns `value` as the `row`-th slice along the
    /// leading dimension of the eventual batch tensor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the value's type or element count does
    /// not match the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `row` is outside the buffer's row capacity.
    pub fn write_row(&mut self, row: usize, value: &Tensor) -> Result<()> {
        assert!(row < self.rows, "row {row} out of range for {} rows", self.rows);
        if value.dtype() != &self.dtype {
            return Err(PipelineError::invalid_argument(format!(
                "cannot add tensor to the batch: expected type {}, got {}",
                self.dtype,
                value.dtype()
            )));
        }
        if value.num_elements() != self.stride {
            return Err(PipelineError::invalid_argument(format!(
                "cannot add tensor to the batch: number of elements does not match; \
                 shapes are: [tensor]: {:?}, [batch]: {:?}",
                value.shape(),
                self.element_shape.as_slice()
            )));
        }
        with_primitive!(&self.dtype, T => copy_row::<T>(&mut self.data, row, self.stride, value),
            _ => Err(PipelineError::invalid_argument(format!(
                "unsupported data type for batching: {}",
                self.dtype
            ))))
    }

    /// Copies the first `rows` leading slabs of `value` into rows
    /// `0..rows`, one slab at a time.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on type or shape mismatch and `OutOfRange`
    /// if `value` has fewer than `rows` leading slabs.
    pub fn write_rows_from(&mut self, value: &Tensor, rows: usize) -> Result<()> {
        for row in 0..rows {
            let slab = value.row(row)?;
            self.write_row(row, &slab)?;
        }
        Ok(())
    }

    /// Copies the first `rows` slabs out as a tensor with leading dimension
    /// `rows`, leaving the buffer intact. Used by checkpoint save.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `rows` exceeds the buffer's row capacity.
    pub fn to_tensor(&self, rows: usize) -> Result<Tensor> {
        if rows > self.rows {
            return Err(PipelineError::OutOfRange(format!(
                "{rows} rows requested from a buffer of {}",
                self.rows
            )));
        }
        let byte_len = rows * self.stride * self.width;
        let mut copy = MutableBuffer::new(byte_len);
        copy.extend_from_slice(&self.data.as_slice()[..byte_len]);
        let shape = self.batched_shape(rows);
        with_primitive!(&self.dtype, T => freeze::<T>(copy.into(), &shape, rows * self.stride),
            _ => Err(PipelineError::internal("buffer holds an unsupported type")))
    }

    /// Freezes the buffer into a tensor with leading dimension `rows`
    /// without copying. Used when emitting a finished batch.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `rows` exceeds the buffer's row capacity.
    pub fn into_tensor(self, rows: usize) -> Result<Tensor> {
        if rows > self.rows {
            return Err(PipelineError::OutOfRange(format!(
                "{rows} rows requested from a buffer of {}",
                self.rows
            )));
        }
        let shape = self.batched_shape(rows);
        let stride = self.stride;
        let dtype = self.dtype.clone();
        with_primitive!(&dtype, T => freeze::<T>(Buffer::from(self.data), &shape, rows * stride),
            _ => Err(PipelineError::internal("buffer holds an unsupported type")))
    }

    fn batched_shape(&self, rows: usize) -> Shape {
        let mut shape = Shape::with_capacity(self.element_shape.len() + 1);
        shape.push(rows);
        shape.extend(self.element_shape.iter().copied());
        shape
    }
}
