//! Greedy two-pass bin packing of admitted examples into fixed-capacity blocks.
//!
//! Candidates are visited in their original order. A candidate that fits the open bin is
//! appended whole. A candidate that overflows is handled according to how it starts:
//!
//! * a fragment (first token is not the begin-of-sequence marker) is cut to the remaining
//!   capacity and closes the bin;
//! * a fresh sequence stays pending while later unused candidates no shorter than the minimum
//!   fragment floor top up the bin; the bin is then closed. In pass 1 the scan moves past the
//!   pending candidate, in pass 2 the candidate is retried in the fresh bin.
//!
//! Pass 1 may also defer anomalously long candidates from a bin's first slots (the placement
//! bias). Pass 2 re-offers every unused candidate without the bias, and whatever bin is still
//! open afterwards is flushed, so every admitted candidate ends up in exactly one block.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::block::{BlockEmitter, GroupId, PackedBlock};
use crate::config::PreprocessConfig;
use crate::error::{Result, SftpackError};
use crate::metrics::BatchStats;
use crate::record::{EncodedExample, Label, TokenId, IGNORE_INDEX};
use crate::tokenizer::TokenizerHandle;
use crate::validate::Admitted;

/// Pass-1 rejection rule for long candidates offered to a given bin slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BiasRule {
    /// Group id of the slot the rule applies to.
    pub group_id: GroupId,
    /// Candidates longer than `length_factor * cutoff_len` are considered anomalous.
    pub length_factor: usize,
    /// An anomalous candidate is kept only when a draw from `0..=100` is at most this value.
    pub keep_percent: u32,
}

/// Slot rules applied when the placement bias is enabled.
///
/// The length factors exceed anything an admitted candidate can reach, so these rules never
/// fire; they are kept as configured rather than reinterpreted.
pub const DEFAULT_BIAS_RULES: [BiasRule; 2] = [
    BiasRule {
        group_id: 1,
        length_factor: 500,
        keep_percent: 10,
    },
    BiasRule {
        group_id: 2,
        length_factor: 800,
        keep_percent: 20,
    },
];

/// Transient state of the block being filled.
#[derive(Debug)]
struct Bin {
    remaining: usize,
    group_id: GroupId,
    input_ids: Vec<TokenId>,
    group_ids: Vec<GroupId>,
    labels: Vec<Label>,
}

impl Bin {
    fn new(cutoff_len: usize) -> Self {
        Self {
            remaining: cutoff_len,
            group_id: 1,
            input_ids: Vec::with_capacity(cutoff_len),
            group_ids: Vec::with_capacity(cutoff_len),
            labels: Vec::with_capacity(cutoff_len),
        }
    }

    fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    fn append(&mut self, example: &EncodedExample, take: usize) {
        self.input_ids.extend_from_slice(&example.input_ids()[..take]);
        self.labels.extend_from_slice(&example.labels()[..take]);
        self.group_ids
            .extend(std::iter::repeat(self.group_id).take(take));
        self.remaining -= take;
    }

    fn pad(&mut self, pad_id: TokenId) -> usize {
        let count = self.remaining;
        self.input_ids.extend(std::iter::repeat(pad_id).take(count));
        self.labels.extend(std::iter::repeat(IGNORE_INDEX).take(count));
        self.group_ids
            .extend(std::iter::repeat(self.group_id).take(count));
        self.remaining = 0;
        count
    }
}

/// Blocks and counters produced by one packing session.
#[derive(Debug, Clone, Default)]
pub struct PackOutcome {
    /// Emitted blocks in emission order.
    pub blocks: Vec<PackedBlock>,
    /// Placement counters; only the packing fields are populated.
    pub stats: BatchStats,
}

/// Greedy bin packer with attention-group tagging.
#[derive(Debug, Clone)]
pub struct BinPacker {
    cutoff_len: usize,
    neat_packing: bool,
    min_fragment_len: usize,
    bias_rules: Vec<BiasRule>,
    bos_token_id: Option<TokenId>,
    pad_token_id: TokenId,
    emitter: BlockEmitter,
}

impl BinPacker {
    /// Creates a packer from a [`PreprocessConfig`] and the tokenizer's special ids.
    pub fn new(cfg: &PreprocessConfig, tokenizer: &dyn TokenizerHandle) -> Result<Self> {
        let pad_token_id = tokenizer.pad_token_id().ok_or_else(|| {
            SftpackError::InvalidConfig("packing requires a pad or eos token".into())
        })?;
        let bias_rules = if cfg.placement_bias {
            DEFAULT_BIAS_RULES.to_vec()
        } else {
            Vec::new()
        };
        Ok(Self {
            cutoff_len: cfg.cutoff_len,
            neat_packing: cfg.neat_packing,
            min_fragment_len: cfg.min_fragment_len,
            bias_rules,
            bos_token_id: tokenizer.bos_token_id(),
            pad_token_id,
            emitter: BlockEmitter::new(cfg.cutoff_len),
        })
    }

    /// Replaces the placement-bias rules; an empty list disables the bias.
    #[must_use]
    pub fn with_bias_rules(mut self, rules: Vec<BiasRule>) -> Self {
        self.bias_rules = rules;
        self
    }

    /// Packs `candidates` into blocks. `rng` is only drawn from when a bias rule matches.
    pub fn pack<R: Rng + ?Sized>(&self, candidates: &[Admitted], rng: &mut R) -> Result<PackOutcome> {
        let mut outcome = PackOutcome::default();
        let mut used = vec![false; candidates.len()];
        let mut bin = Bin::new(self.cutoff_len);

        for pass in 1..=2 {
            let mut index = 0;
            while index < candidates.len() {
                if used[index] {
                    index += 1;
                    continue;
                }
                let candidate = candidates[index].example();
                let length = candidate.len();

                if pass == 1 && self.defers(bin.group_id, length, rng) {
                    outcome.stats.deferred_candidates += 1;
                    index += 1;
                    continue;
                }

                if length <= bin.remaining {
                    self.place(&mut bin, candidate, &mut outcome.stats);
                    used[index] = true;
                    index += 1;
                    if bin.remaining == 0 {
                        outcome.blocks.push(self.close(&mut bin, &mut outcome.stats)?);
                    }
                    continue;
                }

                if bin.is_empty() {
                    return Err(SftpackError::Internal(format!(
                        "candidate of length {length} does not fit an empty bin of {}",
                        self.cutoff_len
                    )));
                }

                if !self.starts_sequence(candidate) {
                    let take = bin.remaining;
                    bin.append(candidate, take);
                    used[index] = true;
                    outcome.stats.truncated_fragments += 1;
                    outcome.blocks.push(self.close(&mut bin, &mut outcome.stats)?);
                    index += 1;
                    continue;
                }

                self.top_up(&mut bin, candidates, &mut used, index + 1, &mut outcome.stats);
                outcome.blocks.push(self.close(&mut bin, &mut outcome.stats)?);
                // Pass 1 leaves the pending candidate for pass 2; pass 2 retries it in the fresh bin.
                if pass == 1 {
                    index += 1;
                }
            }
        }

        if !bin.is_empty() {
            outcome.blocks.push(self.close(&mut bin, &mut outcome.stats)?);
        }
        Ok(outcome)
    }

    fn starts_sequence(&self, example: &EncodedExample) -> bool {
        self.bos_token_id
            .is_some_and(|bos| example.input_ids().first() == Some(&bos))
    }

    fn defers<R: Rng + ?Sized>(&self, group_id: GroupId, length: usize, rng: &mut R) -> bool {
        self.bias_rules.iter().any(|rule| {
            rule.group_id == group_id
                && length > rule.length_factor.saturating_mul(self.cutoff_len)
                && rng.gen_range(0..=100u32) > rule.keep_percent
        })
    }

    fn place(&self, bin: &mut Bin, example: &EncodedExample, stats: &mut BatchStats) {
        bin.append(example, example.len());
        if self.neat_packing {
            bin.group_id += 1;
        }
        stats.placed_examples += 1;
    }

    fn top_up(
        &self,
        bin: &mut Bin,
        candidates: &[Admitted],
        used: &mut [bool],
        start: usize,
        stats: &mut BatchStats,
    ) {
        for current in start..candidates.len() {
            if used[current] {
                continue;
            }
            if bin.remaining < self.min_fragment_len {
                break;
            }
            let length = candidates[current].len();
            if length > bin.remaining || length < self.min_fragment_len {
                continue;
            }
            self.place(bin, candidates[current].example(), stats);
            used[current] = true;
        }
    }

    fn close(&self, bin: &mut Bin, stats: &mut BatchStats) -> Result<PackedBlock> {
        stats.padding_tokens += bin.pad(self.pad_token_id);
        let full = std::mem::replace(bin, Bin::new(self.cutoff_len));
        let block = self.emitter.emit(full.input_ids, full.group_ids, full.labels)?;
        stats.blocks += 1;
        stats.emitted_tokens += block.len();
        Ok(block)
    }
}
