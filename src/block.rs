//! Emitted output units and the final length check.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SftpackError};
use crate::record::{EncodedExample, Label, TokenId, IGNORE_INDEX};

/// Attention-group tag; positions sharing a tag may attend to each other.
pub type GroupId = u32;

/// Fixed-capacity training block produced by the packer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackedBlock {
    input_ids: Vec<TokenId>,
    group_ids: Vec<GroupId>,
    labels: Vec<Label>,
}

impl PackedBlock {
    /// Token ids, exactly `cutoff_len` long.
    #[must_use]
    pub fn input_ids(&self) -> &[TokenId] {
        &self.input_ids
    }

    /// Attention-group tags, starting at 1 and non-decreasing.
    #[must_use]
    pub fn group_ids(&self) -> &[GroupId] {
        &self.group_ids
    }

    /// Labels aligned with [`Self::input_ids`].
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Block capacity.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Returns `true` for a zero-capacity block, which the emitter never produces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of positions that contribute to the loss.
    #[must_use]
    pub fn trainable_tokens(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&label| label != IGNORE_INDEX)
            .count()
    }

    /// `(group_id, start, end)` for each contiguous run of tags.
    #[must_use]
    pub fn group_spans(&self) -> Vec<(GroupId, usize, usize)> {
        let mut spans: Vec<(GroupId, usize, usize)> = Vec::new();
        for (pos, &group) in self.group_ids.iter().enumerate() {
            match spans.last_mut() {
                Some((current, _, end)) if *current == group => *end = pos + 1,
                _ => spans.push((group, pos, pos + 1)),
            }
        }
        spans
    }
}

/// One example per record, used when packing is disabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnpackedRecord {
    /// Token ids.
    pub input_ids: Vec<TokenId>,
    /// All ones, same length as `input_ids`.
    pub attention_mask: Vec<u8>,
    /// Labels aligned with `input_ids`.
    pub labels: Vec<Label>,
    /// Image references carried over from the raw record.
    #[serde(default)]
    pub images: Vec<String>,
    /// Video references carried over from the raw record.
    #[serde(default)]
    pub videos: Vec<String>,
}

impl UnpackedRecord {
    /// Wraps an encoded example with a full attention mask.
    #[must_use]
    pub fn new(example: EncodedExample, images: Vec<String>, videos: Vec<String>) -> Self {
        let (input_ids, labels) = example.into_parts();
        let attention_mask = vec![1; input_ids.len()];
        Self {
            input_ids,
            attention_mask,
            labels,
            images,
            videos,
        }
    }
}

/// Turns closed bin buffers into [`PackedBlock`]s, enforcing the exact-length invariant.
#[derive(Debug, Clone, Copy)]
pub struct BlockEmitter {
    cutoff_len: usize,
}

impl BlockEmitter {
    /// Creates an emitter for blocks of `cutoff_len` positions.
    #[must_use]
    pub fn new(cutoff_len: usize) -> Self {
        Self { cutoff_len }
    }

    /// Block capacity.
    #[must_use]
    pub fn cutoff_len(&self) -> usize {
        self.cutoff_len
    }

    /// Finalises buffers into a block. Any length mismatch is a construction defect and fatal.
    pub fn emit(
        &self,
        input_ids: Vec<TokenId>,
        group_ids: Vec<GroupId>,
        labels: Vec<Label>,
    ) -> Result<PackedBlock> {
        let expected = self.cutoff_len;
        if input_ids.len() != expected || group_ids.len() != expected || labels.len() != expected
        {
            return Err(SftpackError::PackedLengthMismatch {
                expected,
                input_ids: input_ids.len(),
                group_ids: group_ids.len(),
                labels: labels.len(),
            });
        }
        let block = PackedBlock {
            input_ids,
            group_ids,
            labels,
        };
        debug!(
            "emitted block: groups={} trainable={}",
            block.group_spans().len(),
            block.trainable_tokens()
        );
        Ok(block)
    }
}
