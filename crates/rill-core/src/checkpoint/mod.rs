//! Iterator checkpoint surface.
//!
//! Iterators persist their state through a key-value interface:
//! [`StateWriter`] to save, [`StateReader`] to restore. Keys are fully
//! qualified names built by each iterator from its prefix; values are either
//! scalars ([`ScalarValue`]) or tensors.
//!
//! Presence-only flags follow a convention: the writer stores an empty text
//! scalar under the flag's key, and the reader tests the key with
//! [`StateReader::contains`].
//!
//! [`MemoryState`] is an in-process store implementing both traits. The host
//! runtime normally supplies a durable implementation; the in-memory one
//! backs tests and examples.

use fxhash::FxHashMap;

use crate::error::{PipelineError, Result};
use crate::tensor::Tensor;

/// A scalar checkpoint value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// A 64-bit signed integer.
    Int(i64),
    /// A text value. The empty string doubles as a presence-only flag.
    Text(String),
}

impl ScalarValue {
    /// Reads the value as an integer.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if the value is text.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Text(_) => Err(PipelineError::failed_precondition(
                "expected an integer scalar, found text",
            )),
        }
    }

    /// Reads the value as text.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if the value is an integer.
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Self::Text(v) => Ok(v),
            Self::Int(_) => Err(PipelineError::failed_precondition(
                "expected a text scalar, found an integer",
            )),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Sink for iterator state during a save.
pub trait StateWriter {
    /// Stores a scalar under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Implementations may fail on storage errors.
    fn write_scalar(&mut self, key: &str, value: ScalarValue) -> Result<()>;

    /// Stores a tensor under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Implementations may fail on storage errors.
    fn write_tensor(&mut self, key: &str, value: &Tensor) -> Result<()>;
}

/// Source of iterator state during a restore.
pub trait StateReader {
    /// Reads the scalar stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent and `FailedPrecondition` if
    /// it holds a tensor.
    fn read_scalar(&self, key: &str) -> Result<ScalarValue>;

    /// Reads the tensor stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent and `FailedPrecondition` if
    /// it holds a scalar.
    fn read_tensor(&self, key: &str) -> Result<Tensor>;

    /// Whether any value is stored under `key`.
    fn contains(&self, key: &str) -> bool;
}

#[derive(Debug, Clone)]
enum Entry {
    Scalar(ScalarValue),
    Tensor(Tensor),
}

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryState {
    entries: FxHashMap<String, Entry>,
}

impl MemoryState {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl StateWriter for MemoryState {
    fn write_scalar(&mut self, key: &str, value: ScalarValue) -> Result<()> {
        self.entries.insert(key.to_string(), Entry::Scalar(value));
        Ok(())
    }

    fn write_tensor(&mut self, key: &str, value: &Tensor) -> Result<()> {
        self.entries
            .insert(key.to_string(), Entry::Tensor(value.clone()));
        Ok(())
    }
}

impl StateReader for MemoryState {
    fn read_scalar(&self, key: &str) -> Result<ScalarValue> {
        match self.entries.get(key) {
            Some(Entry::Scalar(value)) => Ok(value.clone()),
            Some(Entry::Tensor(_)) => Err(PipelineError::failed_precondition(format!(
                "checkpoint entry `{key}` holds a tensor, not a scalar"
            ))),
            None => Err(PipelineError::not_found(format!(
                "no checkpoint entry for key `{key}`"
            ))),
        }
    }

    fn read_tensor(&self, key: &str) -> Result<Tensor> {
        match self.entries.get(key) {
            Some(Entry::Tensor(value)) => Ok(value.clone()),
            Some(Entry::Scalar(_)) => Err(PipelineError::failed_precondition(format!(
                "checkpoint entry `{key}` holds a scalar, not a tensor"
            ))),
            None => Err(PipelineError::not_found(format!(
                "no checkpoint entry for key `{key}`"
            ))),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}
