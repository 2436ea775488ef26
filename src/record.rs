//! Record types flowing through the pipeline: raw dialog records and encoded examples.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SftpackError};

/// Token identifier used throughout the crate.
pub type TokenId = u32;
/// Training label; either a real token id or [`IGNORE_INDEX`].
pub type Label = i64;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: Label = -100;

/// Speaker of a single turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human or caller turn.
    User,
    /// Model turn.
    Assistant,
    /// Tool invocation emitted by the model.
    Function,
    /// Tool result fed back to the model.
    Observation,
}

/// A single `{role, content}` turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    /// Speaker of the turn.
    pub role: Role,
    /// Raw turn text.
    pub content: String,
}

impl Turn {
    /// Convenience constructor.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One multi-turn training record as read from disk.
///
/// `system == Some("")` marks a flat continued-pretraining sample; `None` means the template
/// default applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RawRecord {
    /// Alternating turns ending just before the response; count must be odd.
    #[serde(default)]
    pub prompt: Vec<Turn>,
    /// Exactly one response turn.
    #[serde(default)]
    pub response: Vec<Turn>,
    /// Optional system text.
    #[serde(default)]
    pub system: Option<String>,
    /// Optional tool specification.
    #[serde(default)]
    pub tools: Option<String>,
    /// Image references, passed through untouched.
    #[serde(default)]
    pub images: Vec<String>,
    /// Video references, passed through untouched.
    #[serde(default)]
    pub videos: Vec<String>,
}

impl RawRecord {
    /// Single-exchange dialog record.
    pub fn single_turn(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt: vec![Turn::new(Role::User, prompt)],
            response: vec![Turn::new(Role::Assistant, response)],
            ..Self::default()
        }
    }

    /// Returns `true` when the prompt/response turn counts describe a well-formed dialog.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.prompt.len() % 2 == 1 && self.response.len() == 1
    }

    /// Returns the prompt followed by the response, the order templates render in.
    #[must_use]
    pub fn messages(&self) -> Vec<Turn> {
        self.prompt
            .iter()
            .chain(self.response.iter())
            .cloned()
            .collect()
    }
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, turn) in self.prompt.iter().chain(self.response.iter()).enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {:?}", turn.role, turn.content)?;
        }
        f.write_str("]")
    }
}

/// Token ids with aligned training labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EncodedExample {
    input_ids: Vec<TokenId>,
    labels: Vec<Label>,
}

impl EncodedExample {
    /// Builds an example, rejecting misaligned ids and labels.
    pub fn new(input_ids: Vec<TokenId>, labels: Vec<Label>) -> Result<Self> {
        if input_ids.len() != labels.len() {
            return Err(SftpackError::Internal(format!(
                "input_ids ({}) and labels ({}) differ in length",
                input_ids.len(),
                labels.len()
            )));
        }
        Ok(Self { input_ids, labels })
    }

    /// The discard sentinel `([], [])`.
    pub fn discarded() -> Self {
        Self::default()
    }

    /// Token ids.
    #[must_use]
    pub fn input_ids(&self) -> &[TokenId] {
        &self.input_ids
    }

    /// Labels aligned with [`Self::input_ids`].
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Number of positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Returns `true` for the discard sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Count of positions excluded from the loss.
    #[must_use]
    pub fn ignored_count(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&label| label == IGNORE_INDEX)
            .count()
    }

    /// Consumes the example, returning its ids and labels.
    #[must_use]
    pub fn into_parts(self) -> (Vec<TokenId>, Vec<Label>) {
        (self.input_ids, self.labels)
    }
}

/// Converts a token id into the label that trains on it.
#[must_use]
pub fn label_for(id: TokenId) -> Label {
    Label::from(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_deserializes_with_optional_fields() {
        let line = r#"{"prompt":[{"role":"user","content":"hi"}],"response":[{"role":"assistant","content":"yo"}]}"#;
        let record: RawRecord = serde_json::from_str(line).expect("valid record");
        assert!(record.is_well_formed());
        assert_eq!(record.system, None);
        assert!(record.images.is_empty());
        assert_eq!(record.messages().len(), 2);
    }

    #[test]
    fn even_prompt_count_is_malformed() {
        let mut record = RawRecord::single_turn("a", "b");
        record.prompt.push(Turn::new(Role::Assistant, "c"));
        assert!(!record.is_well_formed());
    }

    #[test]
    fn encoded_example_rejects_mismatched_lengths() {
        assert!(EncodedExample::new(vec![1, 2], vec![1]).is_err());
        let example = EncodedExample::new(vec![1, 2], vec![IGNORE_INDEX, 2]).expect("aligned");
        assert_eq!(example.ignored_count(), 1);
    }
}
