//! Admission filters applied before and after encoding.

use std::fmt;

use log::warn;

use crate::config::PreprocessConfig;
use crate::record::{EncodedExample, RawRecord};

/// Reason a record or encoded example was dropped. Always recovered locally.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Prompt turn count is even or the response count is not exactly one.
    Malformed {
        /// Number of prompt turns found.
        prompt_turns: usize,
        /// Number of response turns found.
        response_turns: usize,
    },
    /// The encoder returned the discard sentinel.
    Discarded,
    /// Encoded length leaves no room for a padding position.
    Oversize {
        /// Encoded length.
        length: usize,
        /// Largest admissible length.
        limit: usize,
    },
    /// Long example that is almost entirely masked.
    Degenerate {
        /// Encoded length.
        length: usize,
        /// Fraction of labels equal to the ignore sentinel.
        ignored_fraction: f64,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed {
                prompt_turns,
                response_turns,
            } => write!(
                f,
                "malformed record with {prompt_turns} prompt and {response_turns} response turns"
            ),
            Self::Discarded => f.write_str("empty example"),
            Self::Oversize { length, limit } => {
                write!(f, "lengthy example with length {length} > {limit}")
            }
            Self::Degenerate {
                length,
                ignored_fraction,
            } => write!(
                f,
                "wasteful example with length {length} and {:.1}% ignored labels",
                ignored_fraction * 100.0
            ),
        }
    }
}

/// Encoded example that passed the packing filters.
///
/// Its length is within `1..cutoff_len`, so it always fits an empty bin with room for padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted(EncodedExample);

impl Admitted {
    /// Borrows the wrapped example.
    #[must_use]
    pub fn example(&self) -> &EncodedExample {
        &self.0
    }

    /// Number of positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; admitted examples are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Structural and budget-based admission filter.
#[derive(Debug, Clone, Copy)]
pub struct ExampleValidator {
    cutoff_len: usize,
    wastage_length_ratio: f64,
    wastage_ignored_ratio: f64,
}

impl ExampleValidator {
    /// Creates a validator from a [`PreprocessConfig`].
    #[must_use]
    pub fn new(cfg: &PreprocessConfig) -> Self {
        Self {
            cutoff_len: cfg.cutoff_len,
            wastage_length_ratio: cfg.wastage_length_ratio,
            wastage_ignored_ratio: cfg.wastage_ignored_ratio,
        }
    }

    /// Rejects records whose turn counts do not describe a prompt/response dialog.
    pub fn check_record(&self, record: &RawRecord) -> Result<(), Rejection> {
        if record.is_well_formed() {
            return Ok(());
        }
        let rejection = Rejection::Malformed {
            prompt_turns: record.prompt.len(),
            response_turns: record.response.len(),
        };
        warn!("dropped invalid example: {record}");
        Err(rejection)
    }

    /// Admission for the one-example-per-record mode: only the discard sentinel is dropped.
    pub fn admit_unpacked(&self, example: EncodedExample) -> Result<EncodedExample, Rejection> {
        if example.is_empty() {
            return Err(Rejection::Discarded);
        }
        Ok(example)
    }

    /// Admission for the packing mode: oversize and wasteful examples are dropped.
    pub fn admit_for_packing(&self, example: EncodedExample) -> Result<Admitted, Rejection> {
        if example.is_empty() {
            return Err(Rejection::Discarded);
        }
        let length = example.len();
        let limit = self.cutoff_len - 1;
        if length > limit {
            let rejection = Rejection::Oversize { length, limit };
            warn!("dropped {rejection}");
            return Err(rejection);
        }

        let ignored_fraction = example.ignored_count() as f64 / length as f64;
        if length as f64 > self.wastage_length_ratio * self.cutoff_len as f64
            && ignored_fraction > self.wastage_ignored_ratio
        {
            let rejection = Rejection::Degenerate {
                length,
                ignored_fraction,
            };
            warn!("dropped {rejection}");
            return Err(rejection);
        }
        Ok(Admitted(example))
    }
}
