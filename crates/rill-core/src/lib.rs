//! # Rill Core
//!
//! The core engine for Rill, a small lazy data-pipeline library: datasets
//! describe record streams, iterators pull records on demand, and operators
//! compose. The centerpiece is the fused map-and-batch operator
//! ([`dataset::map_batch`]), which applies a user transform with bounded
//! parallelism and assembles the results into fixed-size batches of Arrow
//! tensors.
//!
//! This crate provides:
//! - **Tensors**: shape-tagged Arrow primitive arrays ([`tensor`])
//! - **Datasets**: lazy sources and operators with checkpointable iterators
//!   ([`dataset`])
//! - **Runtime**: the worker-pool handle iterators schedule work through
//!   ([`runtime`])
//! - **Checkpointing**: the key-value state surface iterators persist
//!   through ([`checkpoint`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use rill_core::dataset::map_batch::{MapBatchConfig, MapBatchDataset};
//!
//! let squares = MapBatchDataset::new(
//!     source,
//!     Arc::new(|record: Record| Ok(vec![square(&record[0])?])),
//!     MapBatchConfig::builder()
//!         .batch_size(32)
//!         .parallel_calls(64)
//!         .output_types(vec![DataType::Int64])
//!         .build()?,
//! );
//! let mut iter = squares.make_iterator("train");
//! while let Some(batch) = iter.get_next(&ctx)? {
//!     // ...
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod runtime;
pub mod tensor;

pub use dataset::{Dataset, DatasetIterator, MapTransform, Record};
pub use error::{PipelineError, Result};
pub use runtime::Context;
pub use tensor::{PartialShape, Tensor};
