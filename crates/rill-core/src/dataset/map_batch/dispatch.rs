//! Invocation scheduling.
//!
//! One dispatcher thread per iterator refills in-flight work. Under the
//! global lock it claims the next `(slot, offset)` pair and pulls the
//! matching upstream record, so record `j` always lands at offset
//! `j % batch_size` of batch `j / batch_size`; the lock is released only to
//! hand the record to the runtime's worker pool, where the user transform
//! runs. The completion callback routes the result into the slot and frees
//! a parallelism token.
//!
//! Lock order is global-then-slot: the dispatcher records end-of-input and
//! pull errors with the slot lock nested inside the global one. Completion
//! callbacks go the other way around and therefore use two disjoint
//! critical sections, never nested: slot bookkeeping first, then the global
//! decrement.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::dataset::{DatasetIterator, MapTransform, Record};
use crate::error::{PipelineError, Result};
use crate::runtime::Context;
use crate::tensor::slab::BatchBuffer;
use crate::tensor::Tensor;

use super::slot::{SlotCell, SlotState};
use super::MapBatchConfig;

/// State shared between the consumer, the dispatcher, and invocation
/// callbacks.
pub(super) struct Shared {
    pub config: MapBatchConfig,
    pub transform: Arc<dyn MapTransform>,
    pub inner: Mutex<Inner>,
    pub inner_cv: Condvar,
    pub slots: Box<[SlotCell]>,
}

/// Scheduler state under the global lock.
pub(super) struct Inner {
    pub upstream: Box<dyn DatasetIterator>,
    /// Total invocations ever claimed; `call_counter % batch_size` is the
    /// next offset, `call_counter / batch_size` the next batch index.
    pub call_counter: u64,
    /// Next batch the consumer will read.
    pub input_index: u64,
    /// Next batch still being scheduled.
    pub output_index: u64,
    /// Invocations currently in flight, bounded by the parallelism cap.
    pub num_calls: usize,
    pub cancelled: bool,
    /// Set once an upstream pull reports end of sequence.
    pub end_reached: bool,
    pub dispatcher: Option<JoinHandle<()>>,
}

impl Shared {
    pub fn ring_len(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Whether the dispatcher may claim another invocation: a parallelism
    /// token is free, the ring has room, and upstream end has not been
    /// reached at a slot boundary. After end of input the in-progress slot
    /// is still driven to its boundary so its call count drains, but no new
    /// slot is started.
    fn can_schedule(&self, inner: &Inner) -> bool {
        inner.num_calls < self.config.parallel_calls
            && inner.output_index - inner.input_index < self.ring_len()
            && !(inner.end_reached && inner.call_counter % self.config.batch_size as u64 == 0)
    }
}

/// Dispatcher loop. Runs on a dedicated thread until cancelled.
pub(super) fn run_dispatcher(shared: &Arc<Shared>, ctx: &Context) {
    tracing::debug!(
        batch_size = shared.config.batch_size,
        parallel_calls = shared.config.parallel_calls,
        ring = shared.slots.len(),
        "map_batch dispatcher started"
    );
    let mut inner = shared.inner.lock();
    loop {
        while !inner.cancelled && !shared.can_schedule(&inner) {
            shared.inner_cv.wait(&mut inner);
        }
        if inner.cancelled {
            tracing::debug!("map_batch dispatcher exiting");
            return;
        }

        while shared.can_schedule(&inner) {
            let slot_index = (inner.output_index % shared.ring_len()) as usize;
            let offset = (inner.call_counter % shared.config.batch_size as u64) as usize;
            inner.call_counter += 1;
            inner.num_calls += 1;
            let slot_fully_scheduled = offset + 1 == shared.config.batch_size;

            // The pull happens here, with the global lock held, so records
            // are claimed in upstream order.
            let pulled = inner.upstream.get_next(ctx);
            match pulled {
                Ok(Some(record)) => {
                    let task_shared = Arc::clone(shared);
                    let task_ctx = ctx.clone();
                    MutexGuard::unlocked(&mut inner, || {
                        ctx.runner().spawn(Box::new(move || {
                            invoke(&task_shared, &task_ctx, slot_index, offset, record);
                        }));
                    });
                }
                Ok(None) => {
                    inner.end_reached = true;
                    let slot = &shared.slots[slot_index];
                    slot.note_end_of_input();
                    slot.complete_call();
                    inner.num_calls -= 1;
                    shared.inner_cv.notify_all();
                }
                Err(error) => {
                    let slot = &shared.slots[slot_index];
                    slot.merge_status(error);
                    slot.complete_call();
                    inner.num_calls -= 1;
                    shared.inner_cv.notify_all();
                }
            }

            if slot_fully_scheduled {
                inner.output_index += 1;
            }
        }
    }
}

/// Invocation body: run the transform against the claimed record.
fn invoke(shared: &Arc<Shared>, ctx: &Context, slot_index: usize, offset: usize, record: Record) {
    let done_shared = Arc::clone(shared);
    shared.transform.run_async(
        ctx,
        record,
        Box::new(move |result| transform_done(&done_shared, slot_index, offset, result)),
    );
}

/// Transform completion: route the result into the slot.
///
/// The element count rises on every completion, successful or not; that is
/// what distinguishes a failed batch from an empty one at finalization.
fn transform_done(shared: &Arc<Shared>, slot_index: usize, offset: usize, result: Result<Record>) {
    {
        let mut state = shared.slots[slot_index].lock();
        match result {
            Ok(values) => {
                if let Err(error) = write_result(shared, &mut state, offset, &values) {
                    state.merge(error);
                }
                // `values` is released here, before completion is signalled.
            }
            Err(error) => state.merge(error),
        }
        state.num_elements += 1;
    }
    complete_call(shared, slot_index);
}

/// Allocates the slot's output on first use and writes one result row.
fn write_result(
    shared: &Shared,
    state: &mut SlotState,
    offset: usize,
    values: &[Tensor],
) -> Result<()> {
    let config = &shared.config;
    if values.len() != config.output_types.len() {
        return Err(PipelineError::invalid_argument(format!(
            "transform produced {} components, expected {}",
            values.len(),
            config.output_types.len()
        )));
    }
    if !state.output_allocated {
        let mut buffers = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            if value.dtype() != &config.output_types[i] {
                return Err(PipelineError::invalid_argument(format!(
                    "transform component {i} has type {}, declared {}",
                    value.dtype(),
                    config.output_types[i]
                )));
            }
            if !config.output_shapes[i].is_compatible_with(value.shape()) {
                return Err(PipelineError::invalid_argument(format!(
                    "transform component {i} has shape {:?}, incompatible with declared {}",
                    value.shape(),
                    config.output_shapes[i]
                )));
            }
            buffers.push(BatchBuffer::new(
                config.output_types[i].clone(),
                value.shape(),
                config.batch_size,
            )?);
        }
        state.output = buffers;
        state.output_allocated = true;
    }
    for (i, value) in values.iter().enumerate() {
        state.output[i].write_row(offset, value)?;
    }
    Ok(())
}

/// Finishes one invocation from a completion callback: slot bookkeeping
/// first, then the global in-flight decrement. Two separate critical
/// sections keep the lock order acyclic.
fn complete_call(shared: &Shared, slot_index: usize) {
    shared.slots[slot_index].complete_call();

    let mut inner = shared.inner.lock();
    debug_assert!(inner.num_calls > 0, "global call count underflow");
    inner.num_calls -= 1;
    shared.inner_cv.notify_all();
}
