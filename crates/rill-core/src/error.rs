//! Pipeline status model.
//!
//! Every fallible operation in the crate returns [`PipelineError`]. The enum
//! is a closed set of status kinds with stable numeric codes so that a status
//! can round-trip through a checkpoint as `(code, message)`.
//!
//! Batch slots aggregate statuses with first-error-wins semantics: once a
//! slot holds an error, later errors for the same slot are dropped.

/// Result type for rill-core operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type shared by datasets, iterators, and the checkpoint surface.
///
/// Upstream iterators and user transforms report failures with whatever
/// variant fits; the operator merges them into per-batch statuses without
/// inspecting the kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The operation was cancelled (teardown in progress).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An error of unknown provenance, e.g. a status code this build does
    /// not recognize.
    #[error("unknown: {0}")]
    Unknown(String),

    /// A configuration value or runtime argument violates a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested checkpoint entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The system is not in a state required for the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An index or cursor is outside its valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The requested feature is not implemented.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An internal invariant was violated.
    #[error("internal: {0}")]
    Internal(String),

    /// Persisted state is missing or corrupt.
    #[error("data loss: {0}")]
    DataLoss(String),
}

impl PipelineError {
    /// Shorthand for [`PipelineError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Shorthand for [`PipelineError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Shorthand for [`PipelineError::FailedPrecondition`].
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition(message.into())
    }

    /// Shorthand for [`PipelineError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Shorthand for [`PipelineError::DataLoss`].
    pub fn data_loss(message: impl Into<String>) -> Self {
        Self::DataLoss(message.into())
    }

    /// Stable numeric code used when a status is serialized.
    ///
    /// Code `0` is reserved for "ok" and never produced here.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Cancelled(_) => 1,
            Self::Unknown(_) => 2,
            Self::InvalidArgument(_) => 3,
            Self::NotFound(_) => 5,
            Self::FailedPrecondition(_) => 9,
            Self::OutOfRange(_) => 11,
            Self::Unimplemented(_) => 12,
            Self::Internal(_) => 13,
            Self::DataLoss(_) => 15,
        }
    }

    /// The human-readable message carried by this error.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Cancelled(m)
            | Self::Unknown(m)
            | Self::InvalidArgument(m)
            | Self::NotFound(m)
            | Self::FailedPrecondition(m)
            | Self::OutOfRange(m)
            | Self::Unimplemented(m)
            | Self::Internal(m)
            | Self::DataLoss(m) => m,
        }
    }

    /// Rebuilds an error from a serialized `(code, message)` pair.
    ///
    /// Codes that are not part of the closed set come back as
    /// [`PipelineError::Unknown`] so a checkpoint written by a newer build
    /// still restores.
    #[must_use]
    pub fn from_code(code: i64, message: String) -> Self {
        match code {
            1 => Self::Cancelled(message),
            3 => Self::InvalidArgument(message),
            5 => Self::NotFound(message),
            9 => Self::FailedPrecondition(message),
            11 => Self::OutOfRange(message),
            12 => Self::Unimplemented(message),
            13 => Self::Internal(message),
            15 => Self::DataLoss(message),
            _ => Self::Unknown(message),
        }
    }
}
