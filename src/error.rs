//! Error handling utilities shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::Stage;

/// Convenient result type used throughout the crate.
pub type Result<T, E = SftpackError> = std::result::Result<T, E>;

/// Domain-specific error describing failures during configuration, IO, encoding, or packing.
///
/// Per-record problems (malformed turns, oversize or degenerate examples) are not errors; they
/// surface as [`crate::validate::Rejection`] values and the record is dropped.
#[derive(Debug, Error)]
pub enum SftpackError {
    /// Preprocessing configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Filesystem IO error with optional context path.
    #[error("io error while processing {path:?}: {source}")]
    Io {
        /// Underlying IO error returned by the standard library.
        source: std::io::Error,
        /// Target path associated with the IO failure if available.
        path: Option<PathBuf>,
    },
    /// Error bubbled up from the `tokenizers` crate.
    #[error("huggingface tokenizers error: {0}")]
    Tokenizers(String),
    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A closed bin did not add up to the block capacity. Aborts the batch.
    #[error(
        "packed block length mismatch: expected {expected}, got input_ids={input_ids} \
         group_ids={group_ids} labels={labels}"
    )]
    PackedLengthMismatch {
        /// Configured block capacity.
        expected: usize,
        /// Accumulated token count.
        input_ids: usize,
        /// Accumulated group tag count.
        group_ids: usize,
        /// Accumulated label count.
        labels: usize,
    },
    /// Every record was filtered out before anything could be emitted.
    #[error("{}", empty_dataset_message(.0))]
    EmptyDataset(Stage),
    /// Catch-all variant for invariants that should not occur.
    #[error("internal error: {0}")]
    Internal(String),
}

fn empty_dataset_message(stage: &Stage) -> &'static str {
    match stage {
        Stage::Pretrain => "cannot find sufficient samples, consider increasing dataset size",
        Stage::Supervised => "cannot find valid samples, check the record format",
    }
}

impl From<tokenizers::Error> for SftpackError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizers(err.to_string())
    }
}

impl From<serde_json::Error> for SftpackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl SftpackError {
    /// Helper constructor that attaches an optional path when wrapping IO errors.
    pub fn io(source: std::io::Error, path: Option<PathBuf>) -> Self {
        Self::Io { source, path }
    }
}
