//! In-memory source dataset.
//!
//! [`TensorSlicesDataset`] slices a set of tensors with a common leading
//! dimension into per-index records: record `i` is the `i`-th leading slab
//! of every component. Slicing is zero-copy; records share the source
//! buffers.
//!
//! This is the standard upstream for tests, examples, and small in-memory
//! pipelines.

use std::sync::Arc;

use arrow_schema::DataType;

use crate::checkpoint::{ScalarValue, StateReader, StateWriter};
use crate::error::{PipelineError, Result};
use crate::runtime::Context;
use crate::tensor::{PartialShape, Tensor};

use super::{Dataset, DatasetIterator, Record};

/// A dataset yielding the leading-dimension slabs of a fixed set of tensors.
#[derive(Debug)]
pub struct TensorSlicesDataset {
    components: Arc<Vec<Tensor>>,
    len: usize,
    output_types: Vec<DataType>,
    output_shapes: Vec<PartialShape>,
}

impl TensorSlicesDataset {
    /// Creates a dataset from component tensors.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no components are given, any component
    /// is rank-0, or the leading dimensions disagree.
    pub fn new(components: Vec<Tensor>) -> Result<Self> {
        let Some(first) = components.first() else {
            return Err(PipelineError::invalid_argument(
                "tensor slices require at least one component",
            ));
        };
        let Some(len) = first.dim0() else {
            return Err(PipelineError::invalid_argument(
                "tensor slices require rank >= 1 components",
            ));
        };
        for component in &components {
            if component.dim0() != Some(len) {
                return Err(PipelineError::invalid_argument(format!(
                    "all components must share the leading dimension; got {:?} and {:?}",
                    first.shape(),
                    component.shape()
                )));
            }
        }
        let output_types = components.iter().map(|c| c.dtype().clone()).collect();
        let output_shapes = components
            .iter()
            .map(|c| PartialShape::known(&c.shape()[1..]))
            .collect();
        Ok(Self {
            components: Arc::new(components),
            len,
            output_types,
            output_shapes,
        })
    }

    /// Number of records in the dataset.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Dataset for TensorSlicesDataset {
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator> {
        Box::new(TensorSlicesIterator {
            components: Arc::clone(&self.components),
            len: self.len,
            index: 0,
            prefix: format!("{prefix}::tensor_slices"),
        })
    }

    fn output_types(&self) -> &[DataType] {
        &self.output_types
    }

    fn output_shapes(&self) -> &[PartialShape] {
        &self.output_shapes
    }
}

/// Cursor over a [`TensorSlicesDataset`].
struct TensorSlicesIterator {
    components: Arc<Vec<Tensor>>,
    len: usize,
    index: usize,
    prefix: String,
}

impl TensorSlicesIterator {
    fn full_name(&self, key: &str) -> String {
        format!("{}.{key}", self.prefix)
    }
}

impl DatasetIterator for TensorSlicesIterator {
    fn get_next(&mut self, _ctx: &Context) -> Result<Option<Record>> {
        if self.index >= self.len {
            return Ok(None);
        }
        let record = self
            .components
            .iter()
            .map(|c| c.row(self.index))
            .collect::<Result<Record>>()?;
        self.index += 1;
        Ok(Some(record))
    }

    fn save(&mut self, writer: &mut dyn StateWriter) -> Result<()> {
        let index = i64::try_from(self.index)
            .map_err(|_| PipelineError::internal("cursor exceeds i64 range"))?;
        writer.write_scalar(&self.full_name("index"), ScalarValue::Int(index))
    }

    fn restore(&mut self, _ctx: &Context, reader: &dyn StateReader) -> Result<()> {
        let index = reader.read_scalar(&self.full_name("index"))?.as_int()?;
        self.index = usize::try_from(index)
            .map_err(|_| PipelineError::data_loss("restored cursor is negative"))?;
        Ok(())
    }
}
