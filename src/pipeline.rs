//! Batch-level preprocessing: validation, encoding, and packing of raw records.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::block::{PackedBlock, UnpackedRecord};
use crate::budget::LengthBudget;
use crate::config::PreprocessConfig;
use crate::encoder::{EncodePolicy, TurnEncoder};
use crate::error::{Result, SftpackError};
use crate::metrics::BatchStats;
use crate::packer::BinPacker;
use crate::record::RawRecord;
use crate::template::Template;
use crate::tokenizer::TokenizerHandle;
use crate::validate::{Admitted, ExampleValidator};

const BATCH_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Output of a full preprocessing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedDataset {
    /// One record per admitted example.
    Unpacked(Vec<UnpackedRecord>),
    /// Fixed-capacity packed blocks.
    Packed(Vec<PackedBlock>),
}

impl ProcessedDataset {
    /// Number of emitted rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Unpacked(records) => records.len(),
            Self::Packed(blocks) => blocks.len(),
        }
    }

    /// Returns `true` when nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dataset plus the merged counters of every batch.
#[must_use]
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// Emitted rows in input order.
    pub dataset: ProcessedDataset,
    /// Counters summed across batches.
    pub stats: BatchStats,
}

/// Runs the encode → validate → pack pipeline over batches of raw records.
///
/// Each batch is a pure function of its records, the configuration, and a generator seeded
/// from `seed` and the batch index, so batches can run concurrently and reproducibly.
pub struct Preprocessor<'a> {
    cfg: PreprocessConfig,
    template: &'a dyn Template,
    tokenizer: &'a dyn TokenizerHandle,
    budget: &'a dyn LengthBudget,
    validator: ExampleValidator,
    packer: Option<BinPacker>,
}

impl<'a> Preprocessor<'a> {
    /// Validates the configuration and wires the collaborators together.
    pub fn new(
        cfg: PreprocessConfig,
        template: &'a dyn Template,
        tokenizer: &'a dyn TokenizerHandle,
        budget: &'a dyn LengthBudget,
    ) -> Result<Self> {
        cfg.validate()?;
        let packer = if cfg.packing_enabled() {
            Some(BinPacker::new(&cfg, tokenizer)?)
        } else {
            None
        };
        Ok(Self {
            validator: ExampleValidator::new(&cfg),
            cfg,
            template,
            tokenizer,
            budget,
            packer,
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &PreprocessConfig {
        &self.cfg
    }

    fn encoder(&self) -> TurnEncoder<'_> {
        TurnEncoder::new(
            self.template,
            self.tokenizer,
            self.budget,
            EncodePolicy::from_config(&self.cfg),
        )
    }

    /// Generator for the batch at `batch_index`.
    #[must_use]
    pub fn batch_rng(&self, batch_index: usize) -> StdRng {
        StdRng::seed_from_u64(self.cfg.seed ^ (batch_index as u64).wrapping_mul(BATCH_SEED_MIX))
    }

    /// Encodes one batch without packing: one output record per admitted example.
    pub fn preprocess_supervised(
        &self,
        records: &[RawRecord],
    ) -> Result<(Vec<UnpackedRecord>, BatchStats)> {
        let encoder = self.encoder();
        let mut stats = BatchStats::default();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            stats.records += 1;
            if let Err(rejection) = self.validator.check_record(record) {
                stats.record_rejection(&rejection);
                continue;
            }
            match self.validator.admit_unpacked(encoder.encode(record)?) {
                Ok(example) => {
                    stats.admitted += 1;
                    stats.emitted_tokens += example.len();
                    rows.push(UnpackedRecord::new(
                        example,
                        record.images.clone(),
                        record.videos.clone(),
                    ));
                }
                Err(rejection) => stats.record_rejection(&rejection),
            }
        }
        Ok((rows, stats))
    }

    /// Encodes and packs one batch into fixed-capacity blocks.
    pub fn preprocess_packed<R: Rng + ?Sized>(
        &self,
        records: &[RawRecord],
        rng: &mut R,
    ) -> Result<(Vec<PackedBlock>, BatchStats)> {
        let packer = self.packer.as_ref().ok_or_else(|| {
            SftpackError::InvalidConfig("packing is disabled in the configuration".into())
        })?;
        let encoder = self.encoder();
        let mut stats = BatchStats::default();
        let mut candidates: Vec<Admitted> = Vec::with_capacity(records.len());
        for record in records {
            stats.records += 1;
            if let Err(rejection) = self.validator.check_record(record) {
                stats.record_rejection(&rejection);
                continue;
            }
            match self.validator.admit_for_packing(encoder.encode(record)?) {
                Ok(admitted) => candidates.push(admitted),
                Err(rejection) => stats.record_rejection(&rejection),
            }
        }
        stats.admitted = candidates.len();

        let outcome = packer.pack(&candidates, rng)?;
        stats.merge(&outcome.stats);
        Ok((outcome.blocks, stats))
    }

    /// Repeats records for each epoch and processes them in parallel batches.
    pub fn run(&self, records: &[RawRecord]) -> Result<PreprocessOutput> {
        let epochs = self.cfg.epoch_count()?;
        let expanded;
        let records = if epochs > 1 {
            let mut rng = StdRng::seed_from_u64(self.cfg.seed);
            expanded = expand_epochs(records, epochs, &mut rng);
            expanded.as_slice()
        } else {
            records
        };

        let batch_size = self.cfg.batch_size;
        let (dataset, stats) = if self.packer.is_some() {
            let batches = records
                .par_chunks(batch_size)
                .enumerate()
                .map(|(batch_index, batch)| {
                    let mut rng = self.batch_rng(batch_index);
                    let result = self.preprocess_packed(batch, &mut rng)?;
                    self.log_batch(batch_index, &result.1);
                    Ok(result)
                })
                .collect::<Result<Vec<_>>>()?;
            let mut stats = BatchStats::default();
            let mut blocks = Vec::new();
            for (batch_blocks, batch_stats) in batches {
                stats.merge(&batch_stats);
                blocks.extend(batch_blocks);
            }
            (ProcessedDataset::Packed(blocks), stats)
        } else {
            let batches = records
                .par_chunks(batch_size)
                .enumerate()
                .map(|(batch_index, batch)| {
                    let result = self.preprocess_supervised(batch)?;
                    self.log_batch(batch_index, &result.1);
                    Ok(result)
                })
                .collect::<Result<Vec<_>>>()?;
            let mut stats = BatchStats::default();
            let mut rows = Vec::new();
            for (batch_rows, batch_stats) in batches {
                stats.merge(&batch_stats);
                rows.extend(batch_rows);
            }
            (ProcessedDataset::Unpacked(rows), stats)
        };

        if stats.dropped() > 0 {
            warn!(
                "dropped {} of {} records ({} malformed, {} empty, {} oversize, {} wasteful)",
                stats.dropped(),
                stats.records,
                stats.malformed,
                stats.discarded,
                stats.oversize,
                stats.degenerate
            );
        }
        if dataset.is_empty() {
            return Err(SftpackError::EmptyDataset(self.cfg.stage));
        }
        Ok(PreprocessOutput { dataset, stats })
    }

    fn log_batch(&self, batch_index: usize, stats: &BatchStats) {
        if self.cfg.show_progress {
            info!(
                "batch {:>5} records {:>6} admitted {:>6} blocks {:>6} dropped {:>5}",
                batch_index,
                stats.records,
                stats.admitted,
                stats.blocks,
                stats.dropped()
            );
        }
    }
}

/// Concatenates `epochs` copies of `records`: the first in input order, the rest shuffled.
pub fn expand_epochs<R: Rng + ?Sized>(
    records: &[RawRecord],
    epochs: usize,
    rng: &mut R,
) -> Vec<RawRecord> {
    let mut expanded = Vec::with_capacity(records.len() * epochs);
    expanded.extend_from_slice(records);
    for _ in 1..epochs {
        let start = expanded.len();
        expanded.extend_from_slice(records);
        expanded[start..].shuffle(rng);
    }
    expanded
}
