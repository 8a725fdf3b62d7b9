//! Ring slot state.
//!
//! Each slot of the batch ring is a [`SlotCell`]: a mutex-guarded
//! [`SlotState`] plus a condition variable. The consumer parks on the
//! condvar until the slot's outstanding call count drains to zero;
//! invocation callbacks update the state and signal it.
//!
//! The slot lock is always the innermost lock. Callbacks that also touch the
//! global scheduler state take the slot lock and the global lock in two
//! separate critical sections, never nested.

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{PipelineError, Result};
use crate::tensor::slab::BatchBuffer;

/// Mutable state of one batch under assembly.
pub(super) struct SlotState {
    /// One buffer per output component; empty until the first successful
    /// invocation allocates them.
    pub output: Vec<BatchBuffer>,
    /// Whether `output` has been populated.
    pub output_allocated: bool,
    /// Transform completions recorded for this batch (successful or not).
    pub num_elements: usize,
    /// Invocations still outstanding for this batch.
    pub num_calls: usize,
    /// Whether any invocation for this batch observed upstream end.
    pub end_of_input: bool,
    /// Aggregated batch status, first error wins.
    pub status: Result<()>,
}

impl SlotState {
    fn new(batch_size: usize) -> Self {
        Self {
            output: Vec::new(),
            output_allocated: false,
            num_elements: 0,
            num_calls: batch_size,
            end_of_input: false,
            status: Ok(()),
        }
    }

    /// Resets the slot for the next batch cycling through it.
    pub fn reset(&mut self, batch_size: usize) {
        self.output.clear();
        self.output_allocated = false;
        self.num_elements = 0;
        self.num_calls = batch_size;
        self.end_of_input = false;
        self.status = Ok(());
    }

    /// Merges a status into the slot, keeping the earliest error.
    pub fn merge(&mut self, error: PipelineError) {
        if self.status.is_ok() {
            self.status = Err(error);
        }
    }
}

/// A ring cell: slot state plus its wait/notify machinery.
pub(super) struct SlotCell {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl SlotCell {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(SlotState::new(batch_size)),
            ready: Condvar::new(),
        }
    }

    /// Locks the slot state.
    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    /// Merges a status under the slot lock.
    pub fn merge_status(&self, error: PipelineError) {
        self.state.lock().merge(error);
    }

    /// Records that an invocation for this slot observed upstream end.
    pub fn note_end_of_input(&self) {
        self.state.lock().end_of_input = true;
    }

    /// Marks one outstanding invocation as finished and wakes waiters.
    pub fn complete_call(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.num_calls > 0, "slot call count underflow");
        state.num_calls -= 1;
        self.ready.notify_all();
    }

    /// Blocks until no invocations remain outstanding, returning the locked
    /// state for finalization.
    pub fn wait_ready(&self) -> MutexGuard<'_, SlotState> {
        let mut state = self.state.lock();
        while state.num_calls > 0 {
            self.ready.wait(&mut state);
        }
        state
    }
}
