//! Fused map-and-batch operator.
//!
//! [`MapBatchDataset`] applies a user transform to every upstream record
//! with bounded parallelism and assembles the results into fixed-size
//! batches, fusing the two stages so each transform result is written
//! straight into its slot of a pre-allocated batch buffer.
//!
//! ## Coordination
//!
//! The iterator keeps a ring of `ceil(parallel_calls / batch_size)` batches
//! in flight. A dispatcher thread claims `(slot, offset)` pairs under the
//! parallelism and ring-space caps; invocation callbacks complete out of
//! order within a slot, while batches are emitted strictly in upstream
//! order. `input_index` tracks the batch the consumer reads next,
//! `output_index` the batch still being scheduled; both address the ring
//! modulo its length.
//!
//! ## Errors and end of input
//!
//! Failures from the upstream pull, the transform, or the batch copy are
//! aggregated per batch, first error wins; the batch still drains so the
//! consumer never deadlocks, and later batches may succeed. End of input is
//! not an error: a final short batch is emitted or dropped per
//! `drop_remainder`.
//!
//! The whole in-flight state checkpoints: `save` drains to a quiescent
//! point and writes the ring through the host's state writer; `restore`
//! rebuilds it, re-inflating short batch tensors to full-size buffers.
//!
//! ```rust,ignore
//! let config = MapBatchConfig::builder()
//!     .batch_size(32)
//!     .parallel_calls(64)
//!     .output_types(vec![DataType::Float64])
//!     .build()?;
//! let dataset = MapBatchDataset::new(upstream, Arc::new(normalize), config);
//! let mut iter = dataset.make_iterator("train");
//! while let Some(batch) = iter.get_next(&ctx)? {
//!     // batch[k] has leading dimension 32
//! }
//! ```

use std::sync::Arc;
use std::thread;

use arrow_schema::DataType;
use parking_lot::Mutex;

use crate::checkpoint::{StateReader, StateWriter};
use crate::error::{PipelineError, Result};
use crate::runtime::Context;
use crate::tensor::PartialShape;

use super::{Dataset, DatasetIterator, MapTransform, Record};

mod checkpoint;
mod dispatch;
mod slot;

#[cfg(test)]
mod tests;

use dispatch::{run_dispatcher, Inner, Shared};
use slot::{SlotCell, SlotState};

/// Validated operator configuration.
#[derive(Debug, Clone)]
pub struct MapBatchConfig {
    /// Records per emitted batch.
    pub batch_size: usize,
    /// Maximum concurrent transform invocations.
    pub parallel_calls: usize,
    /// Whether a final short batch is dropped instead of emitted.
    pub drop_remainder: bool,
    /// Declared element type of each transform output component.
    pub output_types: Vec<DataType>,
    /// Declared shape of each transform output component.
    pub output_shapes: Vec<PartialShape>,
}

impl MapBatchConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> MapBatchConfigBuilder {
        MapBatchConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum Parallelism {
    /// Direct cap on concurrent invocations.
    Calls(usize),
    /// Cap expressed in whole batches; the call cap is `n * batch_size`.
    Batches(usize),
}

/// Builder for [`MapBatchConfig`].
#[derive(Debug, Default)]
pub struct MapBatchConfigBuilder {
    batch_size: Option<usize>,
    parallelism: Option<Parallelism>,
    drop_remainder: bool,
    output_types: Vec<DataType>,
    output_shapes: Option<Vec<PartialShape>>,
}

impl MapBatchConfigBuilder {
    /// Sets the number of records per batch.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Caps concurrency at `parallel_calls` transform invocations.
    #[must_use]
    pub fn parallel_calls(mut self, parallel_calls: usize) -> Self {
        self.parallelism = Some(Parallelism::Calls(parallel_calls));
        self
    }

    /// Caps concurrency at `parallel_batches` whole batches
    /// (`parallel_batches * batch_size` invocations).
    #[must_use]
    pub fn parallel_batches(mut self, parallel_batches: usize) -> Self {
        self.parallelism = Some(Parallelism::Batches(parallel_batches));
        self
    }

    /// Sets whether a final short batch is dropped.
    #[must_use]
    pub fn drop_remainder(mut self, drop_remainder: bool) -> Self {
        self.drop_remainder = drop_remainder;
        self
    }

    /// Declares the element type of each transform output component.
    #[must_use]
    pub fn output_types(mut self, output_types: Vec<DataType>) -> Self {
        self.output_types = output_types;
        self
    }

    /// Declares the shape of each transform output component. Defaults to
    /// unknown shapes matching `output_types`.
    #[must_use]
    pub fn output_shapes(mut self, output_shapes: Vec<PartialShape>) -> Self {
        self.output_shapes = Some(output_shapes);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `batch_size` or the parallelism cap is
    /// missing or zero, no output types are declared, or the shape count
    /// does not match the type count.
    pub fn build(self) -> Result<MapBatchConfig> {
        let batch_size = self.batch_size.unwrap_or(0);
        if batch_size == 0 {
            return Err(PipelineError::invalid_argument(
                "batch_size must be greater than zero",
            ));
        }
        let parallel_calls = match self.parallelism {
            Some(Parallelism::Calls(n)) => {
                if n == 0 {
                    return Err(PipelineError::invalid_argument(
                        "parallel_calls must be greater than zero",
                    ));
                }
                n
            }
            Some(Parallelism::Batches(n)) => {
                if n == 0 {
                    return Err(PipelineError::invalid_argument(
                        "parallel_batches must be greater than zero",
                    ));
                }
                n * batch_size
            }
            None => {
                return Err(PipelineError::invalid_argument(
                    "one of parallel_calls or parallel_batches is required",
                ));
            }
        };
        if self.output_types.is_empty() {
            return Err(PipelineError::invalid_argument(
                "at least one output type must be declared",
            ));
        }
        let output_shapes = self
            .output_shapes
            .unwrap_or_else(|| vec![PartialShape::unknown(); self.output_types.len()]);
        if output_shapes.len() != self.output_types.len() {
            return Err(PipelineError::invalid_argument(format!(
                "{} output shapes declared for {} output types",
                output_shapes.len(),
                self.output_types.len()
            )));
        }
        Ok(MapBatchConfig {
            batch_size,
            parallel_calls,
            drop_remainder: self.drop_remainder,
            output_types: self.output_types,
            output_shapes,
        })
    }
}

/// Dataset applying a transform and batching the results in one operator.
pub struct MapBatchDataset {
    input: Arc<dyn Dataset>,
    transform: Arc<dyn MapTransform>,
    config: MapBatchConfig,
    batched_shapes: Vec<PartialShape>,
}

impl MapBatchDataset {
    /// Creates the dataset over `input` with the given transform and
    /// configuration.
    #[must_use]
    pub fn new(
        input: Arc<dyn Dataset>,
        transform: Arc<dyn MapTransform>,
        config: MapBatchConfig,
    ) -> Self {
        let leading = config.drop_remainder.then_some(config.batch_size);
        let batched_shapes = config
            .output_shapes
            .iter()
            .map(|shape| shape.prepend(leading))
            .collect();
        Self {
            input,
            transform,
            config,
            batched_shapes,
        }
    }

    fn build_iterator(&self, prefix: &str) -> MapBatchIterator {
        let prefix = format!("{prefix}::map_batch");
        let upstream = self.input.make_iterator(&prefix);
        MapBatchIterator::new(
            upstream,
            Arc::clone(&self.transform),
            self.config.clone(),
            prefix,
        )
    }
}

impl Dataset for MapBatchDataset {
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator> {
        Box::new(self.build_iterator(prefix))
    }

    fn output_types(&self) -> &[DataType] {
        &self.config.output_types
    }

    fn output_shapes(&self) -> &[PartialShape] {
        &self.batched_shapes
    }
}

/// Iterator over a [`MapBatchDataset`].
///
/// Holds the ring of in-flight batches; dropping it cancels the dispatcher,
/// waits for in-flight invocations to drain, and joins the dispatcher
/// thread, so no callback runs after the drop returns.
pub struct MapBatchIterator {
    shared: Arc<Shared>,
    prefix: String,
}

impl MapBatchIterator {
    fn new(
        upstream: Box<dyn DatasetIterator>,
        transform: Arc<dyn MapTransform>,
        config: MapBatchConfig,
        prefix: String,
    ) -> Self {
        let ring_len = config.parallel_calls.div_ceil(config.batch_size);
        let slots: Box<[SlotCell]> = (0..ring_len)
            .map(|_| SlotCell::new(config.batch_size))
            .collect();
        let shared = Arc::new(Shared {
            config,
            transform,
            inner: Mutex::new(Inner {
                upstream,
                call_counter: 0,
                input_index: 0,
                output_index: 0,
                num_calls: 0,
                cancelled: false,
                end_reached: false,
                dispatcher: None,
            }),
            inner_cv: parking_lot::Condvar::new(),
            slots,
        });
        Self { shared, prefix }
    }

    fn ensure_dispatcher(&self, inner: &mut Inner, ctx: &Context) -> Result<()> {
        if inner.dispatcher.is_none() {
            let shared = Arc::clone(&self.shared);
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name("rill-map-batch-dispatcher".to_string())
                .spawn(move || run_dispatcher(&shared, &ctx))
                .map_err(|e| {
                    PipelineError::internal(format!("failed to start dispatcher thread: {e}"))
                })?;
            inner.dispatcher = Some(handle);
        }
        Ok(())
    }
}

impl DatasetIterator for MapBatchIterator {
    fn get_next(&mut self, ctx: &Context) -> Result<Option<Record>> {
        let batch_size = self.shared.config.batch_size as u64;
        let slot_index = {
            let mut inner = self.shared.inner.lock();
            self.ensure_dispatcher(&mut inner, ctx)?;
            // Once upstream has ended, slots that were never scheduled can
            // never drain; answer end-of-sequence for them directly.
            if inner.end_reached && inner.call_counter <= inner.input_index * batch_size {
                return Ok(None);
            }
            (inner.input_index % self.shared.ring_len()) as usize
        };

        let mut state = self.shared.slots[slot_index].wait_ready();
        let outcome = finalize(&self.shared, &mut state);
        state.reset(self.shared.config.batch_size);
        drop(state);

        let mut inner = self.shared.inner.lock();
        inner.input_index += 1;
        self.shared.inner_cv.notify_all();
        drop(inner);

        outcome
    }

    fn save(&mut self, writer: &mut dyn StateWriter) -> Result<()> {
        checkpoint::save(&self.shared, &self.prefix, writer)
    }

    fn restore(&mut self, ctx: &Context, reader: &dyn StateReader) -> Result<()> {
        checkpoint::restore(&self.shared, &self.prefix, ctx, reader)
    }
}

impl Drop for MapBatchIterator {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.cancelled = true;
        self.shared.inner_cv.notify_all();
        while inner.num_calls > 0 {
            self.shared.inner_cv.wait(&mut inner);
        }
        let dispatcher = inner.dispatcher.take();
        drop(inner);
        if let Some(handle) = dispatcher {
            let _ = handle.join();
        }
    }
}

/// Turns a drained slot into the consumer-visible outcome.
///
/// Precedence: an empty slot is end of sequence even if an error was also
/// recorded; a non-empty slot surfaces its error before any size handling;
/// a short slot emits or ends the stream per `drop_remainder`.
fn finalize(shared: &Shared, state: &mut SlotState) -> Result<Option<Record>> {
    debug_assert_eq!(state.num_calls, 0);
    let batch_size = shared.config.batch_size;

    if state.num_elements == 0 {
        return Ok(None);
    }
    if let Err(error) = &state.status {
        state.output.clear();
        return Err(error.clone());
    }
    if state.num_elements < batch_size {
        if shared.config.drop_remainder {
            state.output.clear();
            return Ok(None);
        }
        let rows = state.num_elements;
        let record = state
            .output
            .drain(..)
            .map(|buffer| buffer.into_tensor(rows))
            .collect::<Result<Record>>()?;
        return Ok(Some(record));
    }
    let record = state
        .output
        .drain(..)
        .map(|buffer| buffer.into_tensor(batch_size))
        .collect::<Result<Record>>()?;
    Ok(Some(record))
}
