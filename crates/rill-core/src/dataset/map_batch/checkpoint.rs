//! Ring-state checkpoint codec.
//!
//! `save` drains in-flight work to a quiescent point, then writes the
//! upstream iterator's state followed by the scheduler counters and every
//! slot. `restore` reads the same layout back. Key layout, relative to the
//! iterator's prefix:
//!
//! - `call_counter`, `input_batch`, `output_batch`, `batch_results_size`
//! - per slot `i`: `batch_results_{i}_num_calls`, `_num_elements`,
//!   `_output_size`, `_end_of_input` / `_output_allocated` (presence-only),
//!   `_output_{k}` tensors, `_status_code` and, for errors, `_status_msg`.
//!
//! A short slot stores only its first `num_elements` rows so uninitialized
//! buffer tail is never serialized; restore re-inflates such tensors into
//! full-size buffers, with `num_elements` still recording the truth.

use crate::checkpoint::{ScalarValue, StateReader, StateWriter};
use crate::error::{PipelineError, Result};
use crate::runtime::Context;
use crate::tensor::slab::BatchBuffer;

use super::dispatch::Shared;
use super::slot::SlotCell;

fn full_name(prefix: &str, name: &str) -> String {
    format!("{prefix}.{name}")
}

fn slot_key(prefix: &str, index: usize, name: &str) -> String {
    full_name(prefix, &format!("batch_results_{index}_{name}"))
}

fn write_u64(writer: &mut dyn StateWriter, key: &str, value: u64) -> Result<()> {
    let value = i64::try_from(value)
        .map_err(|_| PipelineError::internal(format!("counter overflow for key `{key}`")))?;
    writer.write_scalar(key, ScalarValue::Int(value))
}

fn read_u64(reader: &dyn StateReader, key: &str) -> Result<u64> {
    let value = reader.read_scalar(key)?.as_int()?;
    u64::try_from(value)
        .map_err(|_| PipelineError::data_loss(format!("negative counter for key `{key}`")))
}

fn read_usize(reader: &dyn StateReader, key: &str) -> Result<usize> {
    usize::try_from(read_u64(reader, key)?)
        .map_err(|_| PipelineError::data_loss(format!("counter overflow for key `{key}`")))
}

pub(super) fn save(shared: &Shared, prefix: &str, writer: &mut dyn StateWriter) -> Result<()> {
    let mut inner = shared.inner.lock();
    while inner.num_calls > 0 {
        shared.inner_cv.wait(&mut inner);
    }
    debug_assert_eq!(inner.num_calls, 0);

    inner.upstream.save(writer)?;
    write_u64(writer, &full_name(prefix, "call_counter"), inner.call_counter)?;
    write_u64(writer, &full_name(prefix, "input_batch"), inner.input_index)?;
    write_u64(writer, &full_name(prefix, "output_batch"), inner.output_index)?;
    write_u64(
        writer,
        &full_name(prefix, "batch_results_size"),
        shared.ring_len(),
    )?;
    for (index, slot) in shared.slots.iter().enumerate() {
        write_slot(shared, prefix, writer, index, slot)?;
    }
    tracing::debug!(
        call_counter = inner.call_counter,
        input_batch = inner.input_index,
        output_batch = inner.output_index,
        "map_batch state saved"
    );
    Ok(())
}

fn write_slot(
    shared: &Shared,
    prefix: &str,
    writer: &mut dyn StateWriter,
    index: usize,
    slot: &SlotCell,
) -> Result<()> {
    let state = slot.lock();
    if state.end_of_input {
        writer.write_scalar(
            &slot_key(prefix, index, "end_of_input"),
            ScalarValue::Text(String::new()),
        )?;
    }
    write_u64(
        writer,
        &slot_key(prefix, index, "num_calls"),
        state.num_calls as u64,
    )?;
    write_u64(
        writer,
        &slot_key(prefix, index, "num_elements"),
        state.num_elements as u64,
    )?;
    if state.output_allocated {
        writer.write_scalar(
            &slot_key(prefix, index, "output_allocated"),
            ScalarValue::Text(String::new()),
        )?;
    }
    write_u64(
        writer,
        &slot_key(prefix, index, "output_size"),
        state.output.len() as u64,
    )?;
    // A short slot stores only the rows that were produced.
    let rows = state.num_elements.min(shared.config.batch_size);
    for (k, buffer) in state.output.iter().enumerate() {
        writer.write_tensor(
            &slot_key(prefix, index, &format!("output_{k}")),
            &buffer.to_tensor(rows)?,
        )?;
    }
    match &state.status {
        Ok(()) => writer.write_scalar(&slot_key(prefix, index, "status_code"), ScalarValue::Int(0))?,
        Err(error) => {
            writer.write_scalar(
                &slot_key(prefix, index, "status_code"),
                ScalarValue::Int(error.code()),
            )?;
            writer.write_scalar(
                &slot_key(prefix, index, "status_msg"),
                ScalarValue::Text(error.message().to_string()),
            )?;
        }
    }
    Ok(())
}

/// # Panics
///
/// Panics if the checkpoint's ring length does not match the configured
/// ring length; that mismatch means the checkpoint belongs to a different
/// configuration and no consistent state can be rebuilt.
pub(super) fn restore(
    shared: &Shared,
    prefix: &str,
    ctx: &Context,
    reader: &dyn StateReader,
) -> Result<()> {
    let mut inner = shared.inner.lock();
    inner.upstream.restore(ctx, reader)?;
    inner.call_counter = read_u64(reader, &full_name(prefix, "call_counter"))?;
    inner.input_index = read_u64(reader, &full_name(prefix, "input_batch"))?;
    inner.output_index = read_u64(reader, &full_name(prefix, "output_batch"))?;
    let ring = read_u64(reader, &full_name(prefix, "batch_results_size"))?;
    assert!(
        ring == shared.ring_len(),
        "restored ring length {ring} does not match configured ring length {}",
        shared.ring_len()
    );
    let mut end_reached = false;
    for (index, slot) in shared.slots.iter().enumerate() {
        end_reached |= read_slot(shared, prefix, reader, index, slot)?;
    }
    inner.end_reached = end_reached;
    tracing::debug!(
        call_counter = inner.call_counter,
        input_batch = inner.input_index,
        output_batch = inner.output_index,
        end_reached,
        "map_batch state restored"
    );
    Ok(())
}

/// Reads one slot back; returns its end-of-input flag.
fn read_slot(
    shared: &Shared,
    prefix: &str,
    reader: &dyn StateReader,
    index: usize,
    slot: &SlotCell,
) -> Result<bool> {
    let batch_size = shared.config.batch_size;
    let mut state = slot.lock();
    state.end_of_input = reader.contains(&slot_key(prefix, index, "end_of_input"));
    state.num_calls = read_usize(reader, &slot_key(prefix, index, "num_calls"))?;
    state.num_elements = read_usize(reader, &slot_key(prefix, index, "num_elements"))?;
    state.output_allocated = reader.contains(&slot_key(prefix, index, "output_allocated"));
    let output_size = read_usize(reader, &slot_key(prefix, index, "output_size"))?;
    state.output.clear();
    for k in 0..output_size {
        let tensor = reader.read_tensor(&slot_key(prefix, index, &format!("output_{k}")))?;
        let rows = tensor.dim0().ok_or_else(|| {
            PipelineError::data_loss(format!(
                "slot {index} component {k} has no leading dimension"
            ))
        })?;
        if rows > batch_size {
            return Err(PipelineError::data_loss(format!(
                "slot {index} component {k} has {rows} rows for batch size {batch_size}"
            )));
        }
        // Short tensors were stored truncated; rebuild the full-size buffer
        // with the stored rows at the leading slice.
        let mut buffer =
            BatchBuffer::new(tensor.dtype().clone(), &tensor.shape()[1..], batch_size)?;
        buffer.write_rows_from(&tensor, rows)?;
        state.output.push(buffer);
    }
    let code = reader
        .read_scalar(&slot_key(prefix, index, "status_code"))?
        .as_int()?;
    state.status = if code == 0 {
        Ok(())
    } else {
        let message = reader
            .read_scalar(&slot_key(prefix, index, "status_msg"))?
            .as_text()?
            .to_string();
        Err(PipelineError::from_code(code, message))
    };
    Ok(state.end_of_input)
}
