use thiserror::Error;

/// Failures of [`crate::VectorIndex`] mutation and reconstruction.
///
/// Every variant leaves the index exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("dimension mismatch for chunk {chunk_id}: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        chunk_id: String,
    },

    #[error("duplicate chunk id: {0}")]
    DuplicateChunkId(String),

    #[error("vector for chunk {0} has zero or non-finite norm")]
    ZeroVector(String),

    #[error("corrupt index data: {0}")]
    Corrupt(String),
}
