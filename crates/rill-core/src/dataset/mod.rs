//! Lazy datasets and their iterators.
//!
//! A [`Dataset`] is an immutable description of a record stream; calling
//! [`Dataset::make_iterator`] produces a stateful [`DatasetIterator`] that
//! yields records on demand. Datasets compose: an operator dataset holds its
//! upstream as `Arc<dyn Dataset>` and its iterator drives the upstream's
//! iterator.
//!
//! A record is an ordered sequence of tensors, one per declared output
//! component. Component types and shapes are declared statically on the
//! dataset so consumers can be wired before any data flows.
//!
//! Iterator entry points take `&mut self`: exclusive access is the
//! serialization contract for `get_next`, `save`, and `restore`, so an
//! iterator never sees concurrent external calls.

use arrow_schema::DataType;

use crate::checkpoint::{StateReader, StateWriter};
use crate::error::Result;
use crate::runtime::Context;
use crate::tensor::{PartialShape, Tensor};

pub mod map_batch;
pub mod slices;

/// One element of a dataset: an ordered sequence of tensors.
pub type Record = Vec<Tensor>;

/// Completion callback for [`MapTransform::run_async`]. Invoked exactly once
/// from any thread.
pub type DoneCallback = Box<dyn FnOnce(Result<Record>) + Send>;

/// An immutable description of a record stream.
pub trait Dataset: Send + Sync {
    /// Creates a fresh iterator over this dataset.
    ///
    /// `prefix` qualifies the iterator's checkpoint keys; nested iterators
    /// extend it so that state from different pipeline positions never
    /// collides.
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator>;

    /// Per-component element types of the records this dataset yields.
    fn output_types(&self) -> &[DataType];

    /// Per-component shape descriptors of the records this dataset yields.
    fn output_shapes(&self) -> &[PartialShape];
}

/// A stateful cursor over a dataset.
pub trait DatasetIterator: Send {
    /// Produces the next record, or `Ok(None)` at end of sequence.
    ///
    /// End of sequence is sticky: once `Ok(None)` has been returned, every
    /// further call returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Propagates upstream and transform failures. An error does not
    /// necessarily end the stream; subsequent calls may succeed.
    fn get_next(&mut self, ctx: &Context) -> Result<Option<Record>>;

    /// Persists this iterator's position into `writer`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    fn save(&mut self, writer: &mut dyn StateWriter) -> Result<()>;

    /// Rewinds this iterator to a position previously written by
    /// [`DatasetIterator::save`].
    ///
    /// # Errors
    ///
    /// Propagates storage failures and malformed state.
    fn restore(&mut self, ctx: &Context, reader: &dyn StateReader) -> Result<()>;
}

/// A user transformation applied to one record at a time.
///
/// The transform may complete synchronously (invoking `done` before
/// returning) or asynchronously from any thread; either way `done` is
/// invoked exactly once.
pub trait MapTransform: Send + Sync {
    /// Applies the transform to `input`, delivering the result to `done`.
    fn run_async(&self, ctx: &Context, input: Record, done: DoneCallback);
}

/// Plain functions are synchronous transforms: the callback fires inline on
/// the invoking worker.
impl<F> MapTransform for F
where
    F: Fn(Record) -> Result<Record> + Send + Sync,
{
    fn run_async(&self, _ctx: &Context, input: Record, done: DoneCallback) {
        done(self(input));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::types::Int64Type;
    use std::sync::mpsc;

    #[test]
    fn test_closure_transform_completes_inline() {
        let transform = |record: Record| -> Result<Record> { Ok(record) };
        let (tx, rx) = mpsc::channel();

        let input = vec![Tensor::scalar::<Int64Type>(3)];
        transform.run_async(
            &Context::with_threads(1).unwrap(),
            input.clone(),
            Box::new(move |result| tx.send(result).unwrap()),
        );

        let result = rx.try_recv().expect("callback should fire inline").unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn test_closure_transform_propagates_errors() {
        let transform = |_record: Record| -> Result<Record> {
            Err(crate::error::PipelineError::internal("boom"))
        };
        let (tx, rx) = mpsc::channel();
        transform.run_async(
            &Context::with_threads(1).unwrap(),
            Vec::new(),
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert!(rx.try_recv().unwrap().is_err());
    }
}
