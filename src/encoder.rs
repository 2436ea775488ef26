//! Linearises a multi-turn record into a bounded token/label array.
//!
//! Each prompt/response exchange is truncated against the remaining budget through a
//! [`LengthBudget`]. Prompt spans are masked unless `train_on_prompt` is set; with
//! `mask_history` only the most recent response is trained on and exchanges are budgeted
//! newest-first, so the oldest ones are the first to be dropped.

use log::warn;

use crate::budget::LengthBudget;
use crate::config::PreprocessConfig;
use crate::error::{Result, SftpackError};
use crate::record::{label_for, EncodedExample, Label, RawRecord, TokenId, Turn, IGNORE_INDEX};
use crate::template::Template;
use crate::tokenizer::TokenizerHandle;

/// Truncation and masking settings for one encoding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePolicy {
    /// Maximum number of positions in the encoded example.
    pub cutoff_len: usize,
    /// Keeps prompt spans trainable.
    pub train_on_prompt: bool,
    /// Masks all but the most recent response.
    pub mask_history: bool,
}

impl EncodePolicy {
    /// Derives the policy from a [`PreprocessConfig`], reserving a padding slot when packing.
    #[must_use]
    pub fn from_config(cfg: &PreprocessConfig) -> Self {
        Self {
            cutoff_len: cfg.encode_budget(),
            train_on_prompt: cfg.train_on_prompt,
            mask_history: cfg.mask_history,
        }
    }
}

/// Encodes [`RawRecord`]s using borrowed collaborators.
#[derive(Clone, Copy)]
pub struct TurnEncoder<'a> {
    template: &'a dyn Template,
    tokenizer: &'a dyn TokenizerHandle,
    budget: &'a dyn LengthBudget,
    policy: EncodePolicy,
}

impl<'a> TurnEncoder<'a> {
    /// Creates an encoder.
    pub fn new(
        template: &'a dyn Template,
        tokenizer: &'a dyn TokenizerHandle,
        budget: &'a dyn LengthBudget,
        policy: EncodePolicy,
    ) -> Self {
        Self {
            template,
            tokenizer,
            budget,
            policy,
        }
    }

    /// Returns the active policy.
    #[must_use]
    pub fn policy(&self) -> EncodePolicy {
        self.policy
    }

    /// Encodes one record. Returns [`EncodedExample::discarded`] when there is nothing to train on.
    pub fn encode(&self, record: &RawRecord) -> Result<EncodedExample> {
        if record.system.as_deref() == Some("") {
            return self.encode_plain_text(record);
        }
        self.encode_dialog(record)
    }

    fn encode_dialog(&self, record: &RawRecord) -> Result<EncodedExample> {
        let EncodePolicy {
            cutoff_len,
            train_on_prompt,
            mask_history,
        } = self.policy;

        let (prefix_ids, prefix_labels) =
            self.template
                .multimodal_prefix(self.tokenizer, &record.images, &record.videos)?;
        let mut pairs = self.template.encode_multiturn(
            self.tokenizer,
            &record.messages(),
            record.system.as_deref(),
            record.tools.as_deref(),
        )?;

        let shared_eos = if self.template.efficient_eos() {
            Some(self.tokenizer.eos_token_id().ok_or_else(|| {
                SftpackError::InvalidConfig("efficient_eos requires an eos token".into())
            })?)
        } else {
            None
        };

        let mut total_length = prefix_ids.len() + usize::from(shared_eos.is_some());
        // Placeholders must match the attached media one to one, so they are never clipped.
        if !prefix_ids.is_empty() && total_length >= cutoff_len {
            warn!(
                "discarding record whose {} multimodal placeholder tokens leave no room within {cutoff_len}",
                prefix_ids.len()
            );
            return Ok(EncodedExample::discarded());
        }
        if mask_history {
            pairs.reverse();
        }

        let mut turns: Vec<(Vec<TokenId>, Vec<Label>)> = Vec::with_capacity(pairs.len());
        for (turn_idx, (mut source_ids, mut target_ids)) in pairs.into_iter().enumerate() {
            if total_length >= cutoff_len {
                break;
            }
            let (source_len, target_len) = self.budget.split(
                source_ids.len(),
                target_ids.len(),
                cutoff_len - total_length,
            );
            source_ids.truncate(source_len);
            target_ids.truncate(target_len);
            total_length += source_ids.len() + target_ids.len();

            let mut labels: Vec<Label> = if train_on_prompt {
                source_ids.iter().copied().map(label_for).collect()
            } else {
                let mut masked = vec![IGNORE_INDEX; source_ids.len()];
                if let (Some(eos), Some(first)) = (shared_eos, masked.first_mut()) {
                    *first = label_for(eos);
                }
                masked
            };
            if mask_history && turn_idx != 0 {
                labels.extend(std::iter::repeat(IGNORE_INDEX).take(target_ids.len()));
            } else {
                labels.extend(target_ids.iter().copied().map(label_for));
            }

            let mut ids = source_ids;
            ids.extend(target_ids);
            turns.push((ids, labels));
        }
        if mask_history {
            turns.reverse();
        }

        let mut input_ids = prefix_ids;
        let mut labels = prefix_labels;
        for (ids, turn_labels) in turns {
            input_ids.extend(ids);
            labels.extend(turn_labels);
        }
        if let Some(eos) = shared_eos {
            input_ids.push(eos);
            labels.push(label_for(eos));
        }
        EncodedExample::new(input_ids, labels)
    }

    /// Flat continued-pretraining sample: no template, no special tokens, nothing masked.
    fn encode_plain_text(&self, record: &RawRecord) -> Result<EncodedExample> {
        fn first_content(turns: &[Turn]) -> &str {
            turns.first().map_or("", |turn| turn.content.as_str())
        }
        let response = first_content(&record.response);
        let prompt = first_content(&record.prompt);
        let text = if !response.is_empty() {
            response
        } else if !prompt.is_empty() {
            prompt
        } else {
            return Ok(EncodedExample::discarded());
        };

        let mut input_ids = self.tokenizer.encode(text, false)?;
        input_ids.truncate(self.policy.cutoff_len);
        let labels = input_ids.iter().copied().map(label_for).collect();
        EncodedExample::new(input_ids, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ProportionalBudget;
    use crate::record::Role;
    use crate::template::EncodedPair;
    use crate::tokenizer::testing::{WordTokenizer, EOS};

    const IG: Label = IGNORE_INDEX;

    /// Template returning pre-baked exchange pairs.
    pub(crate) struct FixedTemplate {
        pub(crate) pairs: Vec<EncodedPair>,
        pub(crate) efficient_eos: bool,
    }

    impl Template for FixedTemplate {
        fn efficient_eos(&self) -> bool {
            self.efficient_eos
        }

        fn encode_multiturn(
            &self,
            _tokenizer: &dyn TokenizerHandle,
            _messages: &[Turn],
            _system: Option<&str>,
            _tools: Option<&str>,
        ) -> Result<Vec<EncodedPair>> {
            Ok(self.pairs.clone())
        }
    }

    fn policy(cutoff_len: usize, train_on_prompt: bool, mask_history: bool) -> EncodePolicy {
        EncodePolicy {
            cutoff_len,
            train_on_prompt,
            mask_history,
        }
    }

    fn encode(template: &FixedTemplate, policy: EncodePolicy, record: &RawRecord) -> EncodedExample {
        let tokenizer = WordTokenizer::default();
        TurnEncoder::new(template, &tokenizer, &ProportionalBudget, policy)
            .encode(record)
            .expect("encode")
    }

    fn two_turns(efficient_eos: bool) -> FixedTemplate {
        FixedTemplate {
            pairs: vec![(vec![10], vec![11]), (vec![12], vec![13])],
            efficient_eos,
        }
    }

    #[test]
    fn single_turn_masks_prompt() {
        let template = FixedTemplate {
            pairs: vec![(vec![10, 11], vec![20, 21])],
            efficient_eos: false,
        };
        let example = encode(&template, policy(16, false, false), &RawRecord::default());
        assert_eq!(example.input_ids(), &[10, 11, 20, 21]);
        assert_eq!(example.labels(), &[IG, IG, 20, 21]);
    }

    #[test]
    fn train_on_prompt_keeps_prompt_labels() {
        let template = FixedTemplate {
            pairs: vec![(vec![10, 11], vec![20])],
            efficient_eos: false,
        };
        let example = encode(&template, policy(16, true, false), &RawRecord::default());
        assert_eq!(example.labels(), &[10, 11, 20]);
    }

    #[test]
    fn mask_history_trains_on_last_turn_only() {
        let example = encode(&two_turns(false), policy(16, false, true), &RawRecord::default());
        assert_eq!(example.input_ids(), &[10, 11, 12, 13]);
        assert_eq!(example.labels(), &[IG, IG, IG, 13]);
    }

    #[test]
    fn cutoff_drops_latest_turns_without_mask_history() {
        let example = encode(&two_turns(false), policy(2, false, false), &RawRecord::default());
        assert_eq!(example.input_ids(), &[10, 11]);
        assert_eq!(example.labels(), &[IG, 11]);
    }

    #[test]
    fn cutoff_drops_oldest_turns_with_mask_history() {
        let example = encode(&two_turns(false), policy(2, false, true), &RawRecord::default());
        assert_eq!(example.input_ids(), &[12, 13]);
        assert_eq!(example.labels(), &[IG, 13]);
    }

    #[test]
    fn efficient_eos_marks_turn_boundaries() {
        let template = FixedTemplate {
            pairs: vec![(vec![10, 11], vec![20]), (vec![12], vec![21])],
            efficient_eos: true,
        };
        let example = encode(&template, policy(16, false, false), &RawRecord::default());
        let eos = Label::from(EOS);
        assert_eq!(example.input_ids(), &[10, 11, 20, 12, 21, EOS]);
        assert_eq!(example.labels(), &[eos, IG, 20, eos, 21, eos]);
    }

    #[test]
    fn efficient_eos_reserves_its_slot() {
        let template = FixedTemplate {
            pairs: vec![(vec![10, 11, 12], vec![20, 21, 22])],
            efficient_eos: true,
        };
        let example = encode(&template, policy(4, false, false), &RawRecord::default());
        assert_eq!(example.len(), 4);
        assert_eq!(example.input_ids().last(), Some(&EOS));
    }

    /// Emits one placeholder id per attached image ahead of the fixed pairs.
    struct ImageTemplate(FixedTemplate);

    impl Template for ImageTemplate {
        fn efficient_eos(&self) -> bool {
            self.0.efficient_eos
        }

        fn encode_multiturn(
            &self,
            tokenizer: &dyn TokenizerHandle,
            messages: &[Turn],
            system: Option<&str>,
            tools: Option<&str>,
        ) -> Result<Vec<EncodedPair>> {
            self.0.encode_multiturn(tokenizer, messages, system, tools)
        }

        fn multimodal_prefix(
            &self,
            _tokenizer: &dyn TokenizerHandle,
            images: &[String],
            _videos: &[String],
        ) -> Result<(Vec<TokenId>, Vec<Label>)> {
            Ok((vec![99; images.len()], vec![IG; images.len()]))
        }
    }

    fn with_images(count: usize) -> RawRecord {
        RawRecord {
            images: (0..count).map(|i| format!("img{i}.png")).collect(),
            ..RawRecord::default()
        }
    }

    #[test]
    fn placeholder_prefix_filling_the_cutoff_discards_the_record() {
        let tokenizer = WordTokenizer::default();
        let template = ImageTemplate(FixedTemplate {
            pairs: vec![(vec![10, 11], vec![20, 21])],
            efficient_eos: true,
        });
        let policy = policy(4, false, false);
        let encoder = TurnEncoder::new(&template, &tokenizer, &ProportionalBudget, policy);

        for images in [3, 4, 6] {
            let example = encoder.encode(&with_images(images)).expect("encode");
            assert!(example.is_empty(), "{images} placeholders should not fit");
        }

        let example = encoder.encode(&with_images(2)).expect("encode");
        assert_eq!(example.len(), 4);
        assert_eq!(&example.input_ids()[..2], &[99, 99]);
        assert_eq!(example.input_ids().last(), Some(&EOS));
    }

    #[test]
    fn placeholder_prefix_without_shared_eos_is_bounded_by_cutoff() {
        let tokenizer = WordTokenizer::default();
        let template = ImageTemplate(two_turns(false));
        let policy = policy(3, false, false);
        let encoder = TurnEncoder::new(&template, &tokenizer, &ProportionalBudget, policy);

        assert!(encoder.encode(&with_images(3)).expect("encode").is_empty());
        let example = encoder.encode(&with_images(1)).expect("encode");
        assert_eq!(example.input_ids(), &[99, 10, 11]);
        assert_eq!(example.labels(), &[IG, IG, 11]);
    }

    #[test]
    fn encoded_lengths_always_match() {
        for cutoff in 1..12 {
            for mask_history in [false, true] {
                let template = FixedTemplate {
                    pairs: vec![
                        (vec![1, 2, 3], vec![4, 5, 6, 7]),
                        (vec![8], vec![9, 10]),
                        (vec![11, 12], vec![13]),
                    ],
                    efficient_eos: cutoff % 2 == 0,
                };
                let example = encode(
                    &template,
                    policy(cutoff, false, mask_history),
                    &RawRecord::default(),
                );
                assert_eq!(example.input_ids().len(), example.labels().len());
                assert!(example.len() <= cutoff);
            }
        }
    }

    #[test]
    fn plain_text_trains_on_everything() {
        let record = RawRecord {
            prompt: vec![Turn::new(Role::User, "5 6")],
            response: vec![Turn::new(Role::Assistant, "7 8 9")],
            system: Some(String::new()),
            ..RawRecord::default()
        };
        let example = encode(&two_turns(false), policy(16, false, false), &record);
        assert_eq!(example.input_ids(), &[7, 8, 9]);
        assert_eq!(example.labels(), &[7, 8, 9]);
        assert_eq!(example.ignored_count(), 0);
    }

    #[test]
    fn plain_text_falls_back_to_prompt_and_truncates() {
        let record = RawRecord {
            prompt: vec![Turn::new(Role::User, "5 6 7")],
            response: vec![Turn::new(Role::Assistant, "")],
            system: Some(String::new()),
            ..RawRecord::default()
        };
        let example = encode(&two_turns(false), policy(2, false, false), &record);
        assert_eq!(example.input_ids(), &[5, 6]);
    }

    #[test]
    fn plain_text_without_content_is_discarded() {
        let record = RawRecord {
            system: Some(String::new()),
            ..RawRecord::single_turn("", "")
        };
        let example = encode(&two_turns(false), policy(16, false, false), &record);
        assert!(example.is_empty());
    }

    #[test]
    fn encoding_is_idempotent() {
        let template = two_turns(true);
        let first = encode(&template, policy(5, false, true), &RawRecord::default());
        let second = encode(&template, policy(5, false, true), &RawRecord::default());
        assert_eq!(first, second);
    }
}
