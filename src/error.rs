use std::path::PathBuf;

use thiserror::Error;

use crate::blosc::BloscError;
use crate::dtype::Dtype;

/// Errors raised by [`Carray`](crate::Carray) operations and its collaborators.
///
/// Every error is fatal to the failing operation only; the array is left in
/// the state it was in before the call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CarrayError {
    /// A mutation was attempted on an array opened in read-only mode.
    #[error("array is read-only")]
    ReadOnly,
    /// An index or trim count outside the valid range.
    #[error("index {index} is out of range for an array of length {len}")]
    OutOfRange {
        /// The offending index (or count).
        index: i64,
        /// The array length at the time of the call.
        len: usize,
    },
    /// Input element type incompatible with the array's element type.
    #[error("element type `{actual}` is incompatible with array type `{expected}`")]
    TypeMismatch {
        /// The array's element type.
        expected: Dtype,
        /// The element type of the input.
        actual: Dtype,
    },
    /// A structurally invalid argument.
    #[error("invalid argument: {_0}")]
    InvalidArgument(String),
    /// An operation the array does not support.
    #[error("not supported: {_0}")]
    NotSupported(String),
    /// An atom too large for the chunk compression pipeline.
    #[error("atom size {_0} exceeds the supported maximum")]
    TypeTooLarge(u64),
    /// A codec failure.
    #[error(transparent)]
    Blosc(#[from] BloscError),
    /// A filesystem error (missing chunk file, missing metadata, I/O failure).
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Malformed persisted metadata.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Array creation at a root directory that already exists.
    #[error("root directory {} already exists", _0.display())]
    RootExists(PathBuf),
}
