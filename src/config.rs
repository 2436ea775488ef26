//! Configuration builders controlling turn encoding, packing, and chat templates.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SftpackError};

/// Training stage the records are prepared for; only affects how an empty result is reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Continued pretraining on flat text.
    Pretrain,
    /// Supervised fine-tuning on dialog records.
    #[default]
    Supervised,
}

/// Configuration for turn encoding and block packing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Token capacity of one training block.
    pub cutoff_len: usize,
    /// Keeps prompt spans trainable instead of masking them.
    pub train_on_prompt: bool,
    /// Trains on the most recent turn only and gives it truncation priority.
    pub mask_history: bool,
    /// Packs many examples into fixed-capacity blocks.
    pub packing: bool,
    /// Tags packed sub-sequences with distinct group ids. Implies `packing`.
    pub neat_packing: bool,
    /// Shortest example the forward scan will use to top up an overflowing bin.
    pub min_fragment_len: usize,
    /// Examples longer than this fraction of `cutoff_len` are checked for wastage.
    pub wastage_length_ratio: f64,
    /// Ignored-label fraction above which a long example is dropped before packing.
    pub wastage_ignored_ratio: f64,
    /// Enables the probabilistic first-slot rejection of long candidates in pass 1.
    pub placement_bias: bool,
    /// Seed for the per-batch random generators.
    pub seed: u64,
    /// Number of times the record set is repeated; must be a whole number.
    pub num_epochs: f64,
    /// Records handed to a single packing invocation.
    pub batch_size: usize,
    /// Stage used to report an empty result.
    pub stage: Stage,
    /// Enables per-batch summaries through the `log` facade.
    pub show_progress: bool,
}

impl PreprocessConfig {
    /// Returns a builder initialised with [`PreprocessConfig::default`].
    #[must_use]
    pub fn builder() -> PreprocessBuilder {
        PreprocessBuilder::default()
    }

    /// Loads a configuration from JSON; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
        let cfg: PreprocessConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Returns `true` when encoded examples are packed into blocks.
    #[must_use]
    pub fn packing_enabled(&self) -> bool {
        self.packing || self.neat_packing
    }

    /// Token budget handed to the turn encoder. Packing reserves one slot for padding.
    #[must_use]
    pub fn encode_budget(&self) -> usize {
        if self.packing_enabled() {
            self.cutoff_len - 1
        } else {
            self.cutoff_len
        }
    }

    /// Number of epoch copies, rejecting fractional values.
    pub fn epoch_count(&self) -> Result<usize> {
        let epochs = self.num_epochs;
        if !epochs.is_finite() || epochs.fract() != 0.0 {
            return Err(SftpackError::InvalidConfig(format!(
                "num_epochs ({epochs}) must be a whole number"
            )));
        }
        if epochs < 1.0 {
            return Err(SftpackError::InvalidConfig(format!(
                "num_epochs ({epochs}) must be at least 1"
            )));
        }
        Ok(epochs as usize)
    }

    /// Validates the invariants required for preprocessing.
    pub fn validate(&self) -> Result<()> {
        if self.cutoff_len < 2 {
            return Err(SftpackError::InvalidConfig(format!(
                "cutoff_len ({}) must be at least 2",
                self.cutoff_len
            )));
        }
        if self.batch_size == 0 {
            return Err(SftpackError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        for (name, ratio) in [
            ("wastage_length_ratio", self.wastage_length_ratio),
            ("wastage_ignored_ratio", self.wastage_ignored_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(SftpackError::InvalidConfig(format!(
                    "{name} ({ratio}) must be within (0, 1]"
                )));
            }
        }
        self.epoch_count()?;
        Ok(())
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            cutoff_len: 2048,
            train_on_prompt: false,
            mask_history: false,
            packing: false,
            neat_packing: false,
            min_fragment_len: 300,
            wastage_length_ratio: 0.8,
            wastage_ignored_ratio: 0.8,
            placement_bias: true,
            seed: 42,
            num_epochs: 1.0,
            batch_size: 1000,
            stage: Stage::Supervised,
            show_progress: false,
        }
    }
}

/// Builder for [`PreprocessConfig`].
#[derive(Debug, Default, Clone)]
pub struct PreprocessBuilder {
    cfg: PreprocessConfig,
}

impl PreprocessBuilder {
    /// Creates a builder with [`PreprocessConfig::default`] settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block capacity.
    #[must_use]
    pub fn cutoff_len(mut self, value: usize) -> Self {
        self.cfg.cutoff_len = value;
        self
    }

    /// Keeps prompt spans trainable.
    #[must_use]
    pub fn train_on_prompt(mut self, enabled: bool) -> Self {
        self.cfg.train_on_prompt = enabled;
        self
    }

    /// Masks every response except the most recent one.
    #[must_use]
    pub fn mask_history(mut self, enabled: bool) -> Self {
        self.cfg.mask_history = enabled;
        self
    }

    /// Enables packing with a single shared attention group per block.
    #[must_use]
    pub fn packing(mut self, enabled: bool) -> Self {
        self.cfg.packing = enabled;
        self
    }

    /// Enables packing with per-example attention groups.
    #[must_use]
    pub fn neat_packing(mut self, enabled: bool) -> Self {
        self.cfg.neat_packing = enabled;
        self
    }

    /// Overrides the minimum fragment floor used when topping up a bin.
    #[must_use]
    pub fn min_fragment_len(mut self, value: usize) -> Self {
        self.cfg.min_fragment_len = value;
        self
    }

    /// Configures the wastage filter thresholds.
    #[must_use]
    pub fn wastage_thresholds(mut self, length_ratio: f64, ignored_ratio: f64) -> Self {
        self.cfg.wastage_length_ratio = length_ratio;
        self.cfg.wastage_ignored_ratio = ignored_ratio;
        self
    }

    /// Enables or disables the placement-bias heuristic.
    #[must_use]
    pub fn placement_bias(mut self, enabled: bool) -> Self {
        self.cfg.placement_bias = enabled;
        self
    }

    /// Sets the seed for per-batch generators.
    #[must_use]
    pub fn seed(mut self, value: u64) -> Self {
        self.cfg.seed = value;
        self
    }

    /// Sets the epoch repeat count.
    #[must_use]
    pub fn num_epochs(mut self, value: f64) -> Self {
        self.cfg.num_epochs = value;
        self
    }

    /// Sets how many records a single invocation processes.
    #[must_use]
    pub fn batch_size(mut self, value: usize) -> Self {
        self.cfg.batch_size = value;
        self
    }

    /// Sets the training stage.
    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.cfg.stage = stage;
        self
    }

    /// Enables or disables per-batch logging.
    #[must_use]
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.cfg.show_progress = enabled;
        self
    }

    /// Finalises the builder, returning a validated [`PreprocessConfig`].
    pub fn build(mut self) -> Result<PreprocessConfig> {
        if self.cfg.neat_packing {
            self.cfg.packing = true;
        }
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Rendering rules for [`crate::template::ChatTemplate`].
///
/// Every format string substitutes `{content}` with the turn text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplateConfig {
    /// Format for user (and observation) turns.
    pub user_format: String,
    /// Format for assistant turns.
    pub assistant_format: String,
    /// Format for the system text, rendered ahead of the first user turn.
    pub system_format: String,
    /// Format for the tool specification, rendered after the system text.
    pub tools_format: String,
    /// System text used when a record carries none.
    pub default_system: String,
    /// Appends one shared end-of-sequence token instead of one per turn.
    pub efficient_eos: bool,
    /// Prepends the begin-of-sequence token to the first prompt span.
    pub add_bos: bool,
    /// Placeholder token injected for each image reference.
    pub image_token: Option<String>,
    /// Placeholder token injected for each video reference.
    pub video_token: Option<String>,
    /// Number of placeholder tokens per image or video.
    pub mm_seqlen: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            user_format: "<|user|>\n{content}\n<|assistant|>\n".into(),
            assistant_format: "{content}".into(),
            system_format: "<|system|>\n{content}\n".into(),
            tools_format: "<|tools|>\n{content}\n".into(),
            default_system: String::new(),
            efficient_eos: false,
            add_bos: true,
            image_token: None,
            video_token: None,
            mm_seqlen: 1,
        }
    }
}

impl TemplateConfig {
    /// Loads a template description from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
        let cfg: TemplateConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates that the turn formats carry a content placeholder.
    pub fn validate(&self) -> Result<()> {
        for (name, format) in [
            ("user_format", &self.user_format),
            ("assistant_format", &self.assistant_format),
        ] {
            if !format.contains("{content}") {
                return Err(SftpackError::InvalidConfig(format!(
                    "{name} must contain a {{content}} placeholder"
                )));
            }
        }
        if (self.image_token.is_some() || self.video_token.is_some()) && self.mm_seqlen == 0 {
            return Err(SftpackError::InvalidConfig(
                "mm_seqlen must be greater than zero when multimodal tokens are set".into(),
            ));
        }
        Ok(())
    }
}
