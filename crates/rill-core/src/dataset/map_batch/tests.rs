use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arrow_array::types::Int64Type;
use arrow_array::{Array, Int64Array};
use arrow_schema::DataType;

use crate::checkpoint::{MemoryState, StateReader};
use crate::dataset::slices::TensorSlicesDataset;
use crate::dataset::{Dataset, DatasetIterator, MapTransform, Record};
use crate::error::{PipelineError, Result};
use crate::runtime::Context;
use crate::tensor::{PartialShape, Tensor};

use super::{MapBatchConfig, MapBatchDataset};

fn ctx() -> Context {
    Context::with_threads(4).unwrap()
}

fn range_source(n: i64) -> Arc<TensorSlicesDataset> {
    let values: Vec<i64> = (0..n).collect();
    Arc::new(
        TensorSlicesDataset::new(vec![
            Tensor::from_vec::<Int64Type>(&[values.len()], values).unwrap()
        ])
        .unwrap(),
    )
}

fn scalar_input(record: &Record) -> Result<i64> {
    record[0]
        .values()
        .as_any()
        .downcast_ref::<Int64Array>()
        .map(|a| a.value(0))
        .ok_or_else(|| PipelineError::invalid_argument("expected an int64 scalar record"))
}

fn square() -> Arc<dyn MapTransform> {
    Arc::new(|record: Record| -> Result<Record> {
        let x = scalar_input(&record)?;
        Ok(vec![Tensor::scalar::<Int64Type>(x * x)])
    })
}

fn scalar_config(batch_size: usize, parallel_calls: usize, drop_remainder: bool) -> MapBatchConfig {
    MapBatchConfig::builder()
        .batch_size(batch_size)
        .parallel_calls(parallel_calls)
        .drop_remainder(drop_remainder)
        .output_types(vec![DataType::Int64])
        .output_shapes(vec![PartialShape::scalar()])
        .build()
        .unwrap()
}

fn squares_dataset(
    n: i64,
    batch_size: usize,
    parallel_calls: usize,
    drop_remainder: bool,
) -> MapBatchDataset {
    MapBatchDataset::new(
        range_source(n),
        square(),
        scalar_config(batch_size, parallel_calls, drop_remainder),
    )
}

fn batch_values(record: &Record) -> Vec<i64> {
    record[0]
        .values()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .values()
        .to_vec()
}

fn collect_batches(iter: &mut dyn DatasetIterator, ctx: &Context) -> Vec<Vec<i64>> {
    let mut batches = Vec::new();
    while let Some(record) = iter.get_next(ctx).unwrap() {
        batches.push(batch_values(&record));
    }
    batches
}

#[test]
fn test_builder_requires_positive_batch_size() {
    let err = MapBatchConfig::builder()
        .batch_size(0)
        .parallel_calls(1)
        .output_types(vec![DataType::Int64])
        .build()
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
    assert!(err.message().contains("batch_size"));
}

#[test]
fn test_builder_requires_positive_parallelism() {
    let err = MapBatchConfig::builder()
        .batch_size(2)
        .parallel_calls(0)
        .output_types(vec![DataType::Int64])
        .build()
        .unwrap_err();
    assert!(err.message().contains("parallel_calls"));

    let err = MapBatchConfig::builder()
        .batch_size(2)
        .parallel_batches(0)
        .output_types(vec![DataType::Int64])
        .build()
        .unwrap_err();
    assert!(err.message().contains("parallel_batches"));

    let err = MapBatchConfig::builder()
        .batch_size(2)
        .output_types(vec![DataType::Int64])
        .build()
        .unwrap_err();
    assert!(err.message().contains("parallel_calls or parallel_batches"));
}

#[test]
fn test_builder_derives_parallelism_from_batches() {
    let config = MapBatchConfig::builder()
        .batch_size(3)
        .parallel_batches(2)
        .output_types(vec![DataType::Int64])
        .build()
        .unwrap();
    assert_eq!(config.parallel_calls, 6);
}

#[test]
fn test_builder_validates_output_declaration() {
    let err = MapBatchConfig::builder()
        .batch_size(2)
        .parallel_calls(2)
        .build()
        .unwrap_err();
    assert!(err.message().contains("output type"));

    let err = MapBatchConfig::builder()
        .batch_size(2)
        .parallel_calls(2)
        .output_types(vec![DataType::Int64])
        .output_shapes(vec![PartialShape::scalar(), PartialShape::scalar()])
        .build()
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
}

#[test]
fn test_batched_output_shapes() {
    let dropped = squares_dataset(6, 4, 4, true);
    assert_eq!(dropped.output_shapes(), &[PartialShape::known(&[4])]);
    assert_eq!(dropped.output_types(), &[DataType::Int64]);

    let padded = squares_dataset(6, 4, 4, false);
    assert_eq!(padded.output_shapes(), &[PartialShape::new(vec![None])]);
}

#[test]
fn test_pairs_of_squares() {
    let ds = squares_dataset(6, 2, 2, false);
    let ctx = ctx();
    let mut iter = ds.build_iterator("root");

    let batches = collect_batches(&mut iter, &ctx);
    assert_eq!(batches, vec![vec![0, 1], vec![4, 9], vec![16, 25]]);

    // End of sequence is sticky.
    assert!(iter.get_next(&ctx).unwrap().is_none());
    assert!(iter.get_next(&ctx).unwrap().is_none());
}

#[test]
fn test_drop_remainder_discards_short_batch() {
    let ds = squares_dataset(6, 4, 4, true);
    let batches = collect_batches(&mut ds.build_iterator("root"), &ctx());
    assert_eq!(batches, vec![vec![0, 1, 4, 9]]);
}

#[test]
fn test_short_final_batch_is_emitted() {
    let ds = squares_dataset(6, 4, 4, false);
    let ctx = ctx();
    let mut iter = ds.build_iterator("root");

    let full = iter.get_next(&ctx).unwrap().unwrap();
    assert_eq!(full[0].shape(), &[4]);
    assert_eq!(batch_values(&full), vec![0, 1, 4, 9]);

    let short = iter.get_next(&ctx).unwrap().unwrap();
    assert_eq!(short[0].shape(), &[2]);
    assert_eq!(batch_values(&short), vec![16, 25]);

    assert!(iter.get_next(&ctx).unwrap().is_none());
}

#[test]
fn test_unit_batches() {
    let ds = squares_dataset(4, 1, 1, false);
    let batches = collect_batches(&mut ds.build_iterator("root"), &ctx());
    assert_eq!(batches, vec![vec![0], vec![1], vec![4], vec![9]]);
}

#[test]
fn test_exact_multiple_has_no_short_batch() {
    for drop_remainder in [false, true] {
        let ds = squares_dataset(8, 4, 8, drop_remainder);
        let batches = collect_batches(&mut ds.build_iterator("root"), &ctx());
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }
}

#[test]
fn test_empty_upstream() {
    let ds = squares_dataset(0, 2, 2, false);
    let ctx = ctx();
    let mut iter = ds.build_iterator("root");
    assert!(iter.get_next(&ctx).unwrap().is_none());
    assert!(iter.get_next(&ctx).unwrap().is_none());
}

#[test]
fn test_transform_error_poisons_only_its_batch() {
    let transform: Arc<dyn MapTransform> = Arc::new(|record: Record| -> Result<Record> {
        let x = scalar_input(&record)?;
        if x == 7 {
            return Err(PipelineError::internal("transform failed on record 7"));
        }
        Ok(vec![Tensor::scalar::<Int64Type>(x * x)])
    });
    let ds = MapBatchDataset::new(range_source(20), transform, scalar_config(4, 4, false));
    let ctx = ctx();
    let mut iter = ds.build_iterator("root");

    let first = iter.get_next(&ctx).unwrap().unwrap();
    assert_eq!(batch_values(&first), vec![0, 1, 4, 9]);

    let err = iter.get_next(&ctx).unwrap_err();
    assert_eq!(err, PipelineError::internal("transform failed on record 7"));

    // Later batches are unaffected.
    let third = iter.get_next(&ctx).unwrap().unwrap();
    assert_eq!(batch_values(&third), vec![64, 81, 100, 121]);
    let fourth = iter.get_next(&ctx).unwrap().unwrap();
    assert_eq!(batch_values(&fourth), vec![144, 169, 196, 225]);
    let fifth = iter.get_next(&ctx).unwrap().unwrap();
    assert_eq!(batch_values(&fifth), vec![256, 289, 324, 361]);
    assert!(iter.get_next(&ctx).unwrap().is_none());
}

#[test]
fn test_component_count_mismatch_is_an_error() {
    let transform: Arc<dyn MapTransform> = Arc::new(|record: Record| -> Result<Record> {
        let x = scalar_input(&record)?;
        Ok(vec![
            Tensor::scalar::<Int64Type>(x),
            Tensor::scalar::<Int64Type>(x),
        ])
    });
    let ds = MapBatchDataset::new(range_source(4), transform, scalar_config(2, 2, false));
    let err = ds.build_iterator("root").get_next(&ctx()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
    assert!(err.message().contains("components"));
}

#[test]
fn test_inconsistent_result_shape_is_an_error() {
    let transform: Arc<dyn MapTransform> = Arc::new(|record: Record| -> Result<Record> {
        let x = scalar_input(&record)?;
        let len = if x % 2 == 0 { 2 } else { 3 };
        Ok(vec![Tensor::from_vec::<Int64Type>(&[len], vec![x; len])?])
    });
    let config = MapBatchConfig::builder()
        .batch_size(2)
        .parallel_calls(1)
        .output_types(vec![DataType::Int64])
        .build()
        .unwrap();
    let ds = MapBatchDataset::new(range_source(2), transform, config);
    let err = ds.build_iterator("root").get_next(&ctx()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
    assert!(err.message().contains("number of elements does not match"));
}

#[test]
fn test_large_parallel_run_upholds_invariants() {
    let transform: Arc<dyn MapTransform> = Arc::new(|record: Record| -> Result<Record> {
        let x = scalar_input(&record)?;
        // Uneven latency exercises out-of-order completion.
        if x % 7 == 0 {
            thread::sleep(Duration::from_micros(300));
        }
        Ok(vec![Tensor::scalar::<Int64Type>(x * x)])
    });
    let ds = MapBatchDataset::new(range_source(1000), transform, scalar_config(10, 32, false));
    let ctx = Context::with_threads(8).unwrap();
    let mut iter = ds.build_iterator("root");

    let shared = Arc::clone(&iter.shared);
    let stop = Arc::new(AtomicBool::new(false));
    let spy = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut violations = Vec::new();
            while !stop.load(Ordering::Relaxed) {
                {
                    let inner = shared.inner.lock();
                    if inner.num_calls > shared.config.parallel_calls {
                        violations.push(format!("{} calls in flight", inner.num_calls));
                    }
                    if inner.output_index < inner.input_index
                        || inner.output_index - inner.input_index > shared.ring_len()
                    {
                        violations.push(format!(
                            "ring indices out of range: input {} output {}",
                            inner.input_index, inner.output_index
                        ));
                    }
                }
                thread::sleep(Duration::from_micros(200));
            }
            violations
        })
    };

    let batches = collect_batches(&mut iter, &ctx);
    stop.store(true, Ordering::Relaxed);
    let violations = spy.join().unwrap();
    assert!(violations.is_empty(), "{violations:?}");

    assert_eq!(batches.len(), 100);
    assert!(batches.iter().all(|b| b.len() == 10));
    let flat: Vec<i64> = batches.into_iter().flatten().collect();
    let expected: Vec<i64> = (0..1000).map(|x| x * x).collect();
    assert_eq!(flat, expected);
}

#[test]
fn test_save_restore_mid_stream() {
    let ds = squares_dataset(100, 10, 20, false);
    let ctx = ctx();

    let reference = collect_batches(&mut ds.build_iterator("root"), &ctx);
    assert_eq!(reference.len(), 10);

    let mut first = ds.build_iterator("root");
    for expected in reference.iter().take(3) {
        let record = first.get_next(&ctx).unwrap().unwrap();
        assert_eq!(&batch_values(&record), expected);
    }
    let mut state = MemoryState::new();
    first.save(&mut state).unwrap();
    drop(first);

    let mut resumed = ds.build_iterator("root");
    resumed.restore(&ctx, &state).unwrap();
    let tail = collect_batches(&mut resumed, &ctx);
    assert_eq!(tail.as_slice(), &reference[3..]);
}

#[test]
fn test_save_before_first_call() {
    let ds = squares_dataset(20, 4, 8, false);
    let ctx = ctx();

    let mut state = MemoryState::new();
    ds.build_iterator("root").save(&mut state).unwrap();

    let mut resumed = ds.build_iterator("root");
    resumed.restore(&ctx, &state).unwrap();
    let batches = collect_batches(&mut resumed, &ctx);
    assert_eq!(batches, collect_batches(&mut ds.build_iterator("root"), &ctx));
}

#[test]
fn test_save_after_end() {
    let ds = squares_dataset(4, 2, 2, false);
    let ctx = ctx();

    let mut iter = ds.build_iterator("root");
    let _ = collect_batches(&mut iter, &ctx);
    let mut state = MemoryState::new();
    iter.save(&mut state).unwrap();
    drop(iter);

    let mut resumed = ds.build_iterator("root");
    resumed.restore(&ctx, &state).unwrap();
    assert!(resumed.get_next(&ctx).unwrap().is_none());
}

#[test]
fn test_save_restore_with_end_of_input_in_ring() {
    // The final short batch sits in the ring, end-of-input already
    // observed, when the checkpoint is taken.
    let ds = squares_dataset(5, 2, 4, false);
    let ctx = ctx();

    let reference = collect_batches(&mut ds.build_iterator("root"), &ctx);
    assert_eq!(reference, vec![vec![0, 1], vec![4, 9], vec![16]]);

    let mut first = ds.build_iterator("root");
    let _ = first.get_next(&ctx).unwrap().unwrap();
    let _ = first.get_next(&ctx).unwrap().unwrap();
    let mut state = MemoryState::new();
    first.save(&mut state).unwrap();
    drop(first);

    let mut resumed = ds.build_iterator("root");
    resumed.restore(&ctx, &state).unwrap();
    let tail = collect_batches(&mut resumed, &ctx);
    assert_eq!(tail, vec![vec![16]]);
    assert!(resumed.get_next(&ctx).unwrap().is_none());
}

#[test]
fn test_checkpoint_key_layout() {
    let ds = squares_dataset(10, 2, 2, false);
    let ctx = ctx();
    let mut iter = ds.build_iterator("root");
    let _ = iter.get_next(&ctx).unwrap();

    let mut state = MemoryState::new();
    iter.save(&mut state).unwrap();

    for key in [
        "root::map_batch.call_counter",
        "root::map_batch.input_batch",
        "root::map_batch.output_batch",
        "root::map_batch.batch_results_size",
        "root::map_batch.batch_results_0_num_calls",
        "root::map_batch.batch_results_0_num_elements",
        "root::map_batch.batch_results_0_output_size",
        "root::map_batch.batch_results_0_status_code",
        "root::map_batch::tensor_slices.index",
    ] {
        assert!(state.contains(key), "missing key {key}");
    }
}

#[test]
#[should_panic(expected = "does not match configured ring length")]
fn test_restore_ring_mismatch_is_fatal() {
    let ctx = ctx();
    let mut state = MemoryState::new();
    // Ring of two slots.
    squares_dataset(10, 10, 20, false)
        .build_iterator("root")
        .save(&mut state)
        .unwrap();

    // Ring of one slot.
    let mut other = squares_dataset(10, 10, 10, false).build_iterator("root");
    let _ = other.restore(&ctx, &state);
}

#[test]
fn test_drop_waits_for_in_flight_callbacks() {
    let calls = Arc::new(AtomicU64::new(0));
    let transform: Arc<dyn MapTransform> = {
        let calls = Arc::clone(&calls);
        Arc::new(move |record: Record| -> Result<Record> {
            thread::sleep(Duration::from_millis(2));
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(record)
        })
    };
    let ds = MapBatchDataset::new(range_source(1000), transform, scalar_config(4, 8, false));
    let ctx = ctx();

    let mut iter = ds.build_iterator("root");
    let _ = iter.get_next(&ctx).unwrap().unwrap();
    drop(iter);

    let snapshot = calls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), snapshot);
}
