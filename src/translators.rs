use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    languages::language_name,
    prompts::build_single_message_prompt,
    responses::{ParseError, parse_single},
    transport::{ChatPrompt, ChatTransport, TransportError},
};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TranslationResult {
    pub translation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toned_original: Option<String>,
}

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Translation failed after {0} attempt(s)")]
    Exhausted(usize),
}

/// Bounded retry for single-message translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(500),
        }
    }
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// One attempt at translating `text` into `target_lang` (a language code).
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        tone: Option<&str>,
    ) -> Result<TranslationResult, TranslateError>;
}

pub struct DryRunTranslator;

#[async_trait]
impl Translator for DryRunTranslator {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        tone: Option<&str>,
    ) -> Result<TranslationResult, TranslateError> {
        Ok(TranslationResult {
            translation: format!("[DRY:{}] {}", target_lang, text),
            toned_original: tone.map(|tone| format!("[DRY:{}] {}", tone, text)),
        })
    }
}

pub struct LlmTranslator<T: ChatTransport> {
    pub transport: T,
}

impl<T: ChatTransport> LlmTranslator<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T> Translator for LlmTranslator<T>
where
    T: ChatTransport,
{
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        tone: Option<&str>,
    ) -> Result<TranslationResult, TranslateError> {
        let target_name = language_name(target_lang);
        let prompt = build_single_message_prompt(text, target_name, tone);
        debug!(%prompt, "single-message prompt");

        let reply = self.transport.complete(&ChatPrompt::new(prompt)).await?;

        if tone.is_none() {
            let translation = reply.trim();
            if translation.is_empty() {
                return Err(ParseError::Empty.into());
            }
            return Ok(TranslationResult {
                translation: translation.to_string(),
                toned_original: None,
            });
        }

        let parsed = parse_single(&reply)?;
        Ok(TranslationResult {
            translation: parsed.translation,
            toned_original: parsed.toned_original,
        })
    }
}

/// Retries `translator` up to `policy.max_attempts` times with a fixed delay,
/// returning the last error once attempts run out.
pub async fn translate_with_retry<T>(
    translator: &T,
    policy: &RetryPolicy,
    text: &str,
    target_lang: &str,
    tone: Option<&str>,
) -> Result<TranslationResult, TranslateError>
where
    T: Translator + ?Sized,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match translator.translate(text, target_lang, tone).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "translation attempt failed"
                );
                last_error = Some(e);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or(TranslateError::Exhausted(policy.max_attempts)))
}
