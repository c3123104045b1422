use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
    batch::BatchPolicy,
    languages::{DEFAULT_AGENT_LANGUAGE, DEFAULT_CUSTOMER_LANGUAGE},
    translators::RetryPolicy,
};

#[derive(Deserialize, Debug, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:1234/v1".into(),
            api_key: None,
            model: "openai/gpt-oss-20b".into(),
            timeout_secs: 60,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TranslationConfig {
    pub max_batch_rounds: usize,
    pub max_single_attempts: usize,
    pub retry_delay_ms: u64,
    pub structured_output: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            max_batch_rounds: 2,
            max_single_attempts: 2,
            retry_delay_ms: 500,
            structured_output: false,
        }
    }
}

impl TranslationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_single_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_rounds: self.max_batch_rounds,
            round_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub customer_language: String,
    pub agent_language: String,
    pub rate_limit_cooldown_secs: u64,
    /// Translate new customer messages for the agent as they arrive.
    pub auto_translate: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            customer_language: DEFAULT_CUSTOMER_LANGUAGE.into(),
            agent_language: DEFAULT_AGENT_LANGUAGE.into(),
            rate_limit_cooldown_secs: 60,
            auto_translate: true,
        }
    }
}

impl SessionConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("Invalid config '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.llm.model, "openai/gpt-oss-20b");
        assert_eq!(config.translation.max_batch_rounds, 2);
        assert_eq!(config.session.customer_language, "zh");
        assert_eq!(config.session.rate_limit_cooldown(), Duration::from_secs(60));
        assert!(config.session.auto_translate);
    }

    #[test]
    fn sections_override_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [llm]
            api_base = "https://api.openai.com/v1"
            api_key = "sk-test"
            model = "gpt-4o-mini"

            [translation]
            max_single_attempts = 5
            retry_delay_ms = 250
            structured_output = true

            [session]
            customer_language = "th"
            auto_translate = false
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.llm.timeout_secs, 60);
        assert!(config.translation.structured_output);
        assert_eq!(config.session.customer_language, "th");
        assert_eq!(config.session.agent_language, "en");
        assert!(!config.session.auto_translate);

        let retry = config.translation.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.delay, Duration::from_millis(250));
        assert_eq!(config.translation.batch_policy().max_rounds, 2);
    }
}
