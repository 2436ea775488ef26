//! Chat template collaborator: renders turns into per-exchange token id pairs.

use crate::config::TemplateConfig;
use crate::error::{Result, SftpackError};
use crate::record::{Label, Role, TokenId, Turn, IGNORE_INDEX};
use crate::tokenizer::TokenizerHandle;

/// Prompt and response token ids for one exchange.
pub type EncodedPair = (Vec<TokenId>, Vec<TokenId>);

/// Turns a dialog into token id pairs, one per prompt/response exchange.
pub trait Template: Send + Sync {
    /// Whether a single shared end-of-sequence token is appended once at the end.
    fn efficient_eos(&self) -> bool;

    /// Encodes `messages` (prompt turns followed by the response) into exchange pairs.
    fn encode_multiturn(
        &self,
        tokenizer: &dyn TokenizerHandle,
        messages: &[Turn],
        system: Option<&str>,
        tools: Option<&str>,
    ) -> Result<Vec<EncodedPair>>;

    /// Leading ids/labels injected for image and video references.
    fn multimodal_prefix(
        &self,
        _tokenizer: &dyn TokenizerHandle,
        _images: &[String],
        _videos: &[String],
    ) -> Result<(Vec<TokenId>, Vec<Label>)> {
        Ok((Vec::new(), Vec::new()))
    }
}

/// Format-string template driven by [`TemplateConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChatTemplate {
    cfg: TemplateConfig,
}

impl ChatTemplate {
    /// Creates a template after validating its formats.
    pub fn new(cfg: TemplateConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TemplateConfig {
        &self.cfg
    }

    fn render(format: &str, content: &str) -> String {
        format.replace("{content}", content)
    }

    fn placeholder_ids(
        &self,
        tokenizer: &dyn TokenizerHandle,
        token: Option<&String>,
        count: usize,
    ) -> Result<Vec<TokenId>> {
        let Some(token) = token else {
            return Ok(Vec::new());
        };
        if count == 0 {
            return Ok(Vec::new());
        }
        let ids = tokenizer.encode(token, false)?;
        let [id] = ids.as_slice() else {
            return Err(SftpackError::InvalidConfig(format!(
                "multimodal placeholder {token:?} must encode to exactly one token"
            )));
        };
        Ok(vec![*id; count * self.cfg.mm_seqlen])
    }
}

impl Template for ChatTemplate {
    fn efficient_eos(&self) -> bool {
        self.cfg.efficient_eos
    }

    fn encode_multiturn(
        &self,
        tokenizer: &dyn TokenizerHandle,
        messages: &[Turn],
        system: Option<&str>,
        tools: Option<&str>,
    ) -> Result<Vec<EncodedPair>> {
        if messages.len() % 2 != 0 {
            return Err(SftpackError::Internal(format!(
                "template expects prompt/response pairs, got {} messages",
                messages.len()
            )));
        }
        let system = system.unwrap_or(&self.cfg.default_system);
        let eos = if self.cfg.efficient_eos {
            None
        } else {
            Some(tokenizer.eos_token_id().ok_or_else(|| {
                SftpackError::InvalidConfig("template requires an eos token".into())
            })?)
        };

        let mut pairs = Vec::with_capacity(messages.len() / 2);
        for (idx, exchange) in messages.chunks_exact(2).enumerate() {
            let (query, answer) = (&exchange[0], &exchange[1]);
            let mut source_text = String::new();
            if idx == 0 {
                if !system.is_empty() {
                    source_text.push_str(&Self::render(&self.cfg.system_format, system));
                }
                if let Some(tools) = tools.filter(|tools| !tools.is_empty()) {
                    source_text.push_str(&Self::render(&self.cfg.tools_format, tools));
                }
            }
            let query_format = match query.role {
                Role::Assistant | Role::Function => &self.cfg.assistant_format,
                Role::User | Role::Observation => &self.cfg.user_format,
            };
            source_text.push_str(&Self::render(query_format, &query.content));

            let mut source_ids = Vec::new();
            if idx == 0 && self.cfg.add_bos {
                if let Some(bos) = tokenizer.bos_token_id() {
                    source_ids.push(bos);
                }
            }
            source_ids.extend(tokenizer.encode(&source_text, false)?);

            let target_text = Self::render(&self.cfg.assistant_format, &answer.content);
            let mut target_ids = tokenizer.encode(&target_text, false)?;
            if let Some(eos) = eos {
                target_ids.push(eos);
            }
            pairs.push((source_ids, target_ids));
        }
        Ok(pairs)
    }

    fn multimodal_prefix(
        &self,
        tokenizer: &dyn TokenizerHandle,
        images: &[String],
        videos: &[String],
    ) -> Result<(Vec<TokenId>, Vec<Label>)> {
        let mut ids = self.placeholder_ids(tokenizer, self.cfg.image_token.as_ref(), images.len())?;
        ids.extend(self.placeholder_ids(tokenizer, self.cfg.video_token.as_ref(), videos.len())?);
        let labels = vec![IGNORE_INDEX; ids.len()];
        Ok((ids, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::testing::{WordTokenizer, BOS, EOS};

    fn plain_template(efficient_eos: bool) -> ChatTemplate {
        ChatTemplate::new(TemplateConfig {
            user_format: "{content}".into(),
            assistant_format: "{content}".into(),
            system_format: "{content} ".into(),
            tools_format: "{content} ".into(),
            efficient_eos,
            ..TemplateConfig::default()
        })
        .expect("valid template")
    }

    #[test]
    fn encodes_one_pair_per_exchange() {
        let tokenizer = WordTokenizer::default();
        let messages = vec![
            Turn::new(Role::User, "10 11"),
            Turn::new(Role::Assistant, "20"),
            Turn::new(Role::User, "12"),
            Turn::new(Role::Assistant, "21 22"),
        ];
        let pairs = plain_template(false)
            .encode_multiturn(&tokenizer, &messages, None, None)
            .expect("encode");
        assert_eq!(
            pairs,
            vec![
                (vec![BOS, 10, 11], vec![20, EOS]),
                (vec![12], vec![21, 22, EOS]),
            ]
        );
    }

    #[test]
    fn system_and_tools_prefix_first_prompt_only() {
        let tokenizer = WordTokenizer::default();
        let messages = vec![
            Turn::new(Role::User, "10"),
            Turn::new(Role::Assistant, "20"),
        ];
        let pairs = plain_template(true)
            .encode_multiturn(&tokenizer, &messages, Some("7"), Some("8"))
            .expect("encode");
        assert_eq!(pairs, vec![(vec![BOS, 7, 8, 10], vec![20])]);
    }

    #[test]
    fn multimodal_prefix_repeats_placeholder() {
        let tokenizer = WordTokenizer::default();
        let template = ChatTemplate::new(TemplateConfig {
            image_token: Some("99".into()),
            mm_seqlen: 2,
            ..TemplateConfig::default()
        })
        .expect("valid template");
        let (ids, labels) = template
            .multimodal_prefix(&tokenizer, &["a.png".into()], &[])
            .expect("prefix");
        assert_eq!(ids, vec![99, 99]);
        assert_eq!(labels, vec![IGNORE_INDEX, IGNORE_INDEX]);
    }
}
