//! Squares a range of integers through the fused map-and-batch operator,
//! snapshotting mid-stream and resuming from the checkpoint.

use std::sync::Arc;

use arrow_array::types::Int64Type;
use arrow_array::{Array, Int64Array};
use arrow_schema::DataType;

use rill_core::checkpoint::MemoryState;
use rill_core::dataset::map_batch::{MapBatchConfig, MapBatchDataset};
use rill_core::dataset::slices::TensorSlicesDataset;
use rill_core::dataset::{Dataset, DatasetIterator, MapTransform, Record};
use rill_core::tensor::{PartialShape, Tensor};
use rill_core::{Context, Result};

fn main() -> Result<()> {
    let source = Arc::new(TensorSlicesDataset::new(vec![Tensor::from_vec::<Int64Type>(
        &[10],
        (0..10).collect(),
    )?])?);
    let transform: Arc<dyn MapTransform> = Arc::new(|record: Record| -> Result<Record> {
        let x = record[0]
            .values()
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 input")
            .value(0);
        Ok(vec![Tensor::scalar::<Int64Type>(x * x)])
    });
    let config = MapBatchConfig::builder()
        .batch_size(4)
        .parallel_calls(8)
        .output_types(vec![DataType::Int64])
        .output_shapes(vec![PartialShape::scalar()])
        .build()?;
    let dataset = MapBatchDataset::new(source, transform, config);
    let ctx = Context::default();

    let mut iter = dataset.make_iterator("example");
    let first = iter.get_next(&ctx)?.expect("first batch");
    println!("first batch:   {:?}", values(&first));

    // Snapshot mid-stream, then resume with a fresh iterator.
    let mut snapshot = MemoryState::new();
    iter.save(&mut snapshot)?;
    drop(iter);

    let mut resumed = dataset.make_iterator("example");
    resumed.restore(&ctx, &snapshot)?;
    while let Some(batch) = resumed.get_next(&ctx)? {
        println!("resumed batch: {:?}", values(&batch));
    }
    Ok(())
}

fn values(record: &Record) -> Vec<i64> {
    record[0]
        .values()
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 output")
        .values()
        .to_vec()
}
