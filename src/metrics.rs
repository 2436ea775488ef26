//! Counters describing what a preprocessing run kept, dropped, and emitted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::PackedBlock;
use crate::validate::Rejection;

/// Per-batch counters; batches are combined with [`BatchStats::merge`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchStats {
    /// Raw records seen.
    pub records: usize,
    /// Records dropped for bad turn counts.
    pub malformed: usize,
    /// Records the encoder discarded as empty.
    pub discarded: usize,
    /// Encoded examples longer than `cutoff_len - 1`.
    pub oversize: usize,
    /// Encoded examples dropped by the wastage filter.
    pub degenerate: usize,
    /// Examples that reached the output (unpacked mode) or the packer.
    pub admitted: usize,
    /// Examples appended to a block whole.
    pub placed_examples: usize,
    /// Fragments cut to a bin's remaining capacity.
    pub truncated_fragments: usize,
    /// Pass-1 deferrals made by the placement bias.
    pub deferred_candidates: usize,
    /// Blocks emitted.
    pub blocks: usize,
    /// Padding positions across all blocks.
    pub padding_tokens: usize,
    /// Positions emitted across all blocks or unpacked records.
    pub emitted_tokens: usize,
}

impl BatchStats {
    /// Counts a dropped record or example.
    pub fn record_rejection(&mut self, rejection: &Rejection) {
        match rejection {
            Rejection::Malformed { .. } => self.malformed += 1,
            Rejection::Discarded => self.discarded += 1,
            Rejection::Oversize { .. } => self.oversize += 1,
            Rejection::Degenerate { .. } => self.degenerate += 1,
        }
    }

    /// Adds another batch's counters into this one.
    pub fn merge(&mut self, other: &BatchStats) {
        self.records += other.records;
        self.malformed += other.malformed;
        self.discarded += other.discarded;
        self.oversize += other.oversize;
        self.degenerate += other.degenerate;
        self.admitted += other.admitted;
        self.placed_examples += other.placed_examples;
        self.truncated_fragments += other.truncated_fragments;
        self.deferred_candidates += other.deferred_candidates;
        self.blocks += other.blocks;
        self.padding_tokens += other.padding_tokens;
        self.emitted_tokens += other.emitted_tokens;
    }

    /// Total records or examples dropped by any filter.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.malformed + self.discarded + self.oversize + self.degenerate
    }

    /// Share of emitted positions holding real tokens rather than padding.
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        if self.emitted_tokens == 0 {
            return 0.0;
        }
        1.0 - self.padding_tokens as f64 / self.emitted_tokens as f64
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "records {} | admitted {} | dropped {} (malformed {}, empty {}, oversize {}, wasteful {})",
            self.records,
            self.admitted,
            self.dropped(),
            self.malformed,
            self.discarded,
            self.oversize,
            self.degenerate
        )?;
        if self.blocks > 0 {
            writeln!(
                f,
                "blocks {} | fill {:.2}% | fragments {} | deferred {}",
                self.blocks,
                self.fill_ratio() * 100.0,
                self.truncated_fragments,
                self.deferred_candidates
            )?;
        }
        Ok(())
    }
}

/// Serializable report of a packing run, printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackingSummary {
    /// Block capacity.
    pub cutoff_len: usize,
    /// Blocks emitted.
    pub blocks: usize,
    /// Positions holding real tokens.
    pub real_tokens: usize,
    /// Positions that contribute to the loss.
    pub trainable_tokens: usize,
    /// `real_tokens / (blocks * cutoff_len)`.
    pub fill_ratio: f64,
    /// Merged batch counters.
    pub stats: BatchStats,
}

impl PackingSummary {
    /// Summarises emitted blocks together with the run's counters.
    #[must_use]
    pub fn new(cutoff_len: usize, blocks: &[PackedBlock], stats: BatchStats) -> Self {
        let trainable_tokens = blocks.iter().map(PackedBlock::trainable_tokens).sum();
        let real_tokens = stats.emitted_tokens.saturating_sub(stats.padding_tokens);
        Self {
            cutoff_len,
            blocks: blocks.len(),
            real_tokens,
            trainable_tokens,
            fill_ratio: stats.fill_ratio(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_counters() {
        let mut total = BatchStats {
            records: 2,
            blocks: 1,
            padding_tokens: 3,
            emitted_tokens: 8,
            ..BatchStats::default()
        };
        let other = BatchStats {
            records: 1,
            malformed: 1,
            blocks: 1,
            padding_tokens: 1,
            emitted_tokens: 8,
            ..BatchStats::default()
        };
        total.merge(&other);
        assert_eq!(total.records, 3);
        assert_eq!(total.dropped(), 1);
        assert!((total.fill_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn rejections_land_in_their_counter() {
        let mut stats = BatchStats::default();
        stats.record_rejection(&Rejection::Oversize {
            length: 10,
            limit: 9,
        });
        stats.record_rejection(&Rejection::Discarded);
        assert_eq!(stats.oversize, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.fill_ratio(), 0.0);
    }

    #[test]
    fn summary_counts_real_and_trainable_tokens() {
        let block = crate::block::BlockEmitter::new(4)
            .emit(vec![1, 5, 6, 0], vec![1, 1, 1, 1], vec![-100, 5, 6, -100])
            .expect("block");
        let stats = BatchStats {
            blocks: 1,
            padding_tokens: 1,
            emitted_tokens: 4,
            ..BatchStats::default()
        };
        let summary = PackingSummary::new(4, &[block], stats);
        assert_eq!(summary.real_tokens, 3);
        assert_eq!(summary.trainable_tokens, 2);
        assert!((summary.fill_ratio - 0.75).abs() < f64::EPSILON);
    }
}
