//! Tokenizer collaborator used by templates and the packer.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Result, SftpackError};
use crate::record::TokenId;

/// Text-to-id conversion plus the special ids the pipeline relies on.
pub trait TokenizerHandle: Send + Sync {
    /// Encodes text into token ids.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>>;

    /// Decodes token ids back into text.
    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String>;

    /// Begin-of-sequence marker, if the vocabulary has one.
    fn bos_token_id(&self) -> Option<TokenId>;

    /// End-of-sequence marker, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<TokenId>;

    /// Padding token, if the vocabulary has one.
    fn pad_token_id(&self) -> Option<TokenId>;
}

/// Names of the special tokens looked up in the vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpecialTokens {
    /// Begin-of-sequence token.
    pub bos: Option<String>,
    /// End-of-sequence token.
    pub eos: Option<String>,
    /// Padding token; falls back to `eos` when unset.
    pub pad: Option<String>,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: Some("<s>".into()),
            eos: Some("</s>".into()),
            pad: None,
        }
    }
}

/// Thin wrapper around `tokenizers::Tokenizer` that resolves special ids once.
#[must_use]
#[derive(Debug, Clone)]
pub struct HfTokenizer {
    inner: Tokenizer,
    bos: Option<TokenId>,
    eos: Option<TokenId>,
    pad: Option<TokenId>,
}

impl HfTokenizer {
    /// Loads a `tokenizer.json` from disk.
    pub fn from_file<P: AsRef<Path>>(path: P, specials: &SpecialTokens) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SftpackError::InvalidConfig(format!(
                "tokenizer file {path:?} does not exist"
            )));
        }
        let tokenizer = Tokenizer::from_file(path)?;
        Self::from_tokenizer(tokenizer, specials)
    }

    /// Wraps an existing Hugging Face [`Tokenizer`].
    pub fn from_tokenizer(tokenizer: Tokenizer, specials: &SpecialTokens) -> Result<Self> {
        let lookup = |token: &Option<String>| -> Result<Option<TokenId>> {
            match token {
                None => Ok(None),
                Some(content) => tokenizer.token_to_id(content).map(Some).ok_or_else(|| {
                    SftpackError::InvalidConfig(format!(
                        "special token {content:?} is missing from the vocabulary"
                    ))
                }),
            }
        };
        let bos = lookup(&specials.bos)?;
        let eos = lookup(&specials.eos)?;
        let pad = lookup(&specials.pad)?.or(eos);
        Ok(Self {
            inner: tokenizer,
            bos,
            eos,
            pad,
        })
    }

    /// Provides immutable access to the underlying tokenizer.
    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }

    /// Looks up a single token in the vocabulary.
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.inner.token_to_id(token)
    }
}

impl TokenizerHandle for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        let encoding = self.inner.encode(text, add_special_tokens)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String> {
        Ok(self.inner.decode(ids, skip_special_tokens)?)
    }

    fn bos_token_id(&self) -> Option<TokenId> {
        self.bos
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        self.eos
    }

    fn pad_token_id(&self) -> Option<TokenId> {
        self.pad
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Whitespace tokenizer with a growable vocabulary for unit tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    pub(crate) const BOS: TokenId = 1;
    pub(crate) const EOS: TokenId = 2;
    pub(crate) const PAD: TokenId = 0;

    /// Maps numeric words to themselves and every other word to a fresh id from 1000.
    #[derive(Debug, Default)]
    pub(crate) struct WordTokenizer {
        vocab: Mutex<HashMap<String, TokenId>>,
    }

    impl WordTokenizer {
        fn id_for(&self, word: &str) -> TokenId {
            if let Ok(id) = word.parse::<TokenId>() {
                return id;
            }
            let mut vocab = self.vocab.lock().expect("vocab lock");
            let next = 1000 + vocab.len() as TokenId;
            *vocab.entry(word.to_string()).or_insert(next)
        }
    }

    impl TokenizerHandle for WordTokenizer {
        fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
            let mut ids = Vec::new();
            if add_special_tokens {
                ids.push(BOS);
            }
            ids.extend(text.split_whitespace().map(|word| self.id_for(word)));
            Ok(ids)
        }

        fn decode(&self, ids: &[TokenId], _skip_special_tokens: bool) -> Result<String> {
            let vocab = self.vocab.lock().expect("vocab lock");
            let words = ids
                .iter()
                .map(|id| {
                    vocab
                        .iter()
                        .find(|(_, value)| *value == id)
                        .map_or_else(|| id.to_string(), |(word, _)| word.clone())
                })
                .collect::<Vec<_>>();
            Ok(words.join(" "))
        }

        fn bos_token_id(&self) -> Option<TokenId> {
            Some(BOS)
        }

        fn eos_token_id(&self) -> Option<TokenId> {
            Some(EOS)
        }

        fn pad_token_id(&self) -> Option<TokenId> {
            Some(PAD)
        }
    }
}
