use std::{
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    batch::{BatchOptions, BatchOutcome, BatchTranslator},
    configs::SessionConfig,
    languages::{DEFAULT_AGENT_LANGUAGE, DEFAULT_CUSTOMER_LANGUAGE},
    prompts::PendingMessage,
    translators::{RetryPolicy, TranslateError, TranslationResult, Translator, translate_with_retry},
    transport::ChatTransport,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Agent,
    Customer,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_language: Option<String>,
}

impl ChatMessage {
    pub fn needs_translation(&self) -> bool {
        self.translated_text.is_none()
    }
}

/// Chat history of one agent/customer conversation, stored as JSON.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_language: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read transcript '{}'", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid transcript '{}'", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write transcript '{}'", path.display()))
    }

    /// `(customer, agent)` language codes, falling back to the given defaults.
    pub fn languages_or(&self, customer: &str, agent: &str) -> (String, String) {
        (
            self.customer_language.clone().unwrap_or_else(|| customer.to_string()),
            self.agent_language.clone().unwrap_or_else(|| agent.to_string()),
        )
    }

    /// Appends a new message and returns its id.
    ///
    /// The message is tagged with the sender's language and the language it
    /// translates into. An empty `translated` is stored as untranslated.
    pub fn add_message(
        &mut self,
        text: impl Into<String>,
        sender: Sender,
        translated: Option<String>,
        tone: Option<String>,
    ) -> String {
        let (customer, agent) =
            self.languages_or(DEFAULT_CUSTOMER_LANGUAGE, DEFAULT_AGENT_LANGUAGE);
        let (language, translated_language) = match sender {
            Sender::Agent => (agent, customer),
            Sender::Customer => (customer, agent),
        };

        let id = uuid::Uuid::new_v4().to_string();
        self.messages.push(ChatMessage {
            id: id.clone(),
            text: text.into(),
            translated_text: translated.filter(|t| !t.is_empty()),
            sender,
            tone,
            timestamp: chrono::Utc::now().timestamp_millis(),
            language,
            translated_language: Some(translated_language),
        });
        id
    }

    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn pending(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.needs_translation())
    }

    /// Splits untranslated messages into `(to customer language, to agent language)`.
    ///
    /// Agent messages are translated for the customer and customer messages for
    /// the agent; conversation order is kept within each group.
    pub fn partition_pending(&self) -> (Vec<PendingMessage>, Vec<PendingMessage>) {
        let mut to_customer = Vec::new();
        let mut to_agent = Vec::new();
        for message in self.pending() {
            let pending = PendingMessage::new(message.id.clone(), message.text.clone());
            match message.sender {
                Sender::Agent => to_customer.push(pending),
                Sender::Customer => to_agent.push(pending),
            }
        }
        (to_customer, to_agent)
    }

    pub fn apply_translation(&mut self, id: &str, text: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.translated_text = Some(text.to_string());
                true
            }
            None => false,
        }
    }
}

/// Cooldown before a manual retry is allowed after a rate-limited batch.
#[derive(Debug, Clone)]
pub struct RetryGate {
    cooldown: Duration,
    until: Option<Instant>,
}

impl RetryGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            until: None,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.until = Some(now + self.cooldown);
    }

    /// Arms the gate when a batch ended rate-limited with messages left over.
    pub fn observe(&mut self, outcome: &BatchOutcome, now: Instant) {
        if outcome.is_rate_limited && !outcome.is_complete() {
            self.arm(now);
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("rate limited, retry allowed in {}s", .remaining.as_secs().max(1))]
    CoolingDown { remaining: Duration },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub requested: usize,
    pub translated: usize,
    pub failed_ids: Vec<String>,
    pub is_rate_limited: bool,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.failed_ids.len()
    }
}

/// Drives batch translation for one conversation at a time.
pub struct SessionTranslator<T: ChatTransport> {
    batch: BatchTranslator<T>,
    gate: RetryGate,
    retry: RetryPolicy,
    auto_translate: bool,
    customer_language: String,
    agent_language: String,
}

impl<T: ChatTransport> SessionTranslator<T> {
    pub fn new(batch: BatchTranslator<T>, config: &SessionConfig) -> Self {
        Self {
            batch,
            gate: RetryGate::new(config.rate_limit_cooldown()),
            retry: RetryPolicy::default(),
            auto_translate: config.auto_translate,
            customer_language: config.customer_language.clone(),
            agent_language: config.agent_language.clone(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_auto_translate(mut self, enabled: bool) -> Self {
        self.auto_translate = enabled;
        self
    }

    pub fn gate(&self) -> &RetryGate {
        &self.gate
    }

    pub fn batch(&self) -> &BatchTranslator<T> {
        &self.batch
    }

    /// Translates every untranslated message in `transcript`, writing each
    /// translation into the transcript as soon as it arrives.
    pub async fn translate_missing<F>(
        &mut self,
        transcript: &mut Transcript,
        mut on_translated: F,
    ) -> Result<BatchReport, SessionError>
    where
        F: FnMut(&str, &str) + Send,
    {
        let remaining = self.gate.remaining(Instant::now());
        if !remaining.is_zero() {
            return Err(SessionError::CoolingDown { remaining });
        }

        let (to_customer, to_agent) = transcript.partition_pending();
        let requested = to_customer.len() + to_agent.len();
        if requested == 0 {
            return Ok(BatchReport::default());
        }

        let (customer_language, agent_language) =
            transcript.languages_or(&self.customer_language, &self.agent_language);

        info!(
            to_customer = to_customer.len(),
            to_agent = to_agent.len(),
            %customer_language,
            %agent_language,
            "translating pending messages"
        );

        let mut sink = |id: &str, text: &str| {
            transcript.apply_translation(id, text);
            on_translated(id, text);
        };
        let outcome = self
            .batch
            .batch_translate(
                &to_customer,
                &to_agent,
                BatchOptions::new(&customer_language, &agent_language).on_partial_result(&mut sink),
            )
            .await;

        self.gate.observe(&outcome, Instant::now());
        if outcome.is_rate_limited {
            warn!(
                cooldown_secs = self.gate.remaining(Instant::now()).as_secs(),
                "batch translation was rate limited"
            );
        }

        Ok(BatchReport {
            requested,
            translated: outcome.resolved.len(),
            failed_ids: outcome.failed_ids,
            is_rate_limited: outcome.is_rate_limited,
        })
    }

    /// Translates an agent's draft into the customer language, in `tone` if
    /// one is set, before it is sent.
    pub async fn preview_reply<R>(
        &self,
        translator: &R,
        transcript: &Transcript,
        text: &str,
        tone: Option<&str>,
    ) -> Result<TranslationResult, TranslateError>
    where
        R: Translator + ?Sized,
    {
        let (customer_language, _) =
            transcript.languages_or(&self.customer_language, &self.agent_language);
        translate_with_retry(translator, &self.retry, text, &customer_language, tone).await
    }

    /// Adds a message to `transcript` and returns its id.
    ///
    /// With auto-translation on, a customer message that arrives without a
    /// translation is translated into the agent language right away. If that
    /// fails the message stays pending for the next batch.
    pub async fn add_message<R>(
        &self,
        translator: &R,
        transcript: &mut Transcript,
        text: &str,
        sender: Sender,
        translated: Option<String>,
        tone: Option<String>,
    ) -> String
    where
        R: Translator + ?Sized,
    {
        transcript
            .customer_language
            .get_or_insert_with(|| self.customer_language.clone());
        transcript
            .agent_language
            .get_or_insert_with(|| self.agent_language.clone());

        let id = transcript.add_message(text, sender, translated, tone);
        let needs_translation = transcript.message(&id).is_some_and(ChatMessage::needs_translation);
        if sender != Sender::Customer || !self.auto_translate || !needs_translation {
            return id;
        }

        let (_, agent_language) =
            transcript.languages_or(&self.customer_language, &self.agent_language);
        match translate_with_retry(translator, &self.retry, text, &agent_language, None).await {
            Ok(result) => {
                transcript.apply_translation(&id, &result.translation);
            }
            Err(e) => {
                warn!(%id, error = %e, "customer message left untranslated");
            }
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::BatchPolicy,
        translators::{DryRunTranslator, LlmTranslator},
        transport::{TransportError, testing::ScriptedTransport},
    };

    fn message(id: &str, text: &str, sender: Sender, translated: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            text: text.into(),
            translated_text: translated.map(String::from),
            sender,
            tone: None,
            timestamp: 0,
            language: String::new(),
            translated_language: None,
        }
    }

    fn transcript() -> Transcript {
        Transcript {
            customer_language: None,
            agent_language: None,
            messages: vec![
                message("c1", "你好", Sender::Customer, None),
                message("a1", "Hi there", Sender::Agent, Some("你好呀")),
                message("a2", "How can I help?", Sender::Agent, None),
                message("c2", "我的订单", Sender::Customer, None),
            ],
        }
    }

    fn session(transport: ScriptedTransport) -> SessionTranslator<ScriptedTransport> {
        let batch = BatchTranslator::new(
            transport,
            BatchPolicy {
                max_rounds: 2,
                round_delay: Duration::ZERO,
            },
        );
        SessionTranslator::new(batch, &SessionConfig::default())
    }

    #[test]
    fn pending_messages_are_partitioned_by_sender() {
        let (to_customer, to_agent) = transcript().partition_pending();

        assert_eq!(to_customer, vec![PendingMessage::new("a2", "How can I help?")]);
        assert_eq!(
            to_agent,
            vec![
                PendingMessage::new("c1", "你好"),
                PendingMessage::new("c2", "我的订单")
            ]
        );
    }

    #[test]
    fn transcript_json_uses_camel_case() {
        let json = r#"{
            "customerLanguage": "th",
            "messages": [
                {"id": "m1", "text": "Hello", "sender": "agent", "translatedText": "สวัสดี", "timestamp": 1}
            ]
        }"#;
        let transcript: Transcript = serde_json::from_str(json).unwrap();

        assert_eq!(transcript.customer_language.as_deref(), Some("th"));
        assert_eq!(transcript.messages[0].sender, Sender::Agent);
        assert!(!transcript.messages[0].needs_translation());

        let out = serde_json::to_value(&transcript).unwrap();
        assert_eq!(out["messages"][0]["translatedText"], "สวัสดี");
        assert!(out.get("agentLanguage").is_none());
    }

    #[test]
    fn transcript_survives_save_and_load() {
        let path = std::env::temp_dir().join(format!("babel-fish-{}.json", std::process::id()));
        let original = transcript();

        original.save(&path).unwrap();
        let loaded = Transcript::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn translations_are_written_into_the_transcript() {
        let mut session = session(ScriptedTransport::replying(&[
            r#"{"toCustomerLanguage":["我能帮您什么？"],"toAgentLanguage":["Hello","My order"]}"#,
        ]));
        let mut transcript = transcript();
        let mut seen = Vec::new();

        let report = session
            .translate_missing(&mut transcript, |id, _| seen.push(id.to_string()))
            .await
            .unwrap();

        assert_eq!(report.requested, 3);
        assert_eq!(report.translated, 3);
        assert_eq!(report.failed(), 0);
        assert_eq!(seen, vec!["a2", "c1", "c2"]);
        assert_eq!(transcript.pending().count(), 0);
        assert_eq!(
            transcript.messages[3].translated_text.as_deref(),
            Some("My order")
        );
        assert!(
            session.batch().transport().prompts()[0].contains("Translate to Chinese:")
        );
    }

    #[tokio::test]
    async fn transcript_languages_override_session_defaults() {
        let mut session = session(ScriptedTransport::replying(&[
            r#"{"toCustomerLanguage":["x"],"toAgentLanguage":["y","z"]}"#,
        ]));
        let mut transcript = transcript();
        transcript.customer_language = Some("vi".into());

        session.translate_missing(&mut transcript, |_, _| {}).await.unwrap();

        assert!(
            session.batch().transport().prompts()[0].contains("Translate to Vietnamese:")
        );
    }

    #[tokio::test]
    async fn nothing_pending_is_a_no_op() {
        let mut session = session(ScriptedTransport::default());
        let mut transcript = Transcript::default();

        let report = session.translate_missing(&mut transcript, |_, _| {}).await.unwrap();

        assert_eq!(report, BatchReport::default());
        assert_eq!(session.batch().transport().calls(), 0);
    }

    #[tokio::test]
    async fn rate_limited_failure_blocks_manual_retry() {
        let mut session = session(ScriptedTransport::new(vec![
            Err(TransportError::Status(429)),
            Err(TransportError::Status(429)),
        ]));
        let mut transcript = transcript();

        let report = session.translate_missing(&mut transcript, |_, _| {}).await.unwrap();
        assert!(report.is_rate_limited);
        assert_eq!(report.failed(), 3);
        assert!(!session.gate().is_open(Instant::now()));

        let err = session
            .translate_missing(&mut transcript, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CoolingDown { .. }));
        assert_eq!(session.batch().transport().calls(), 2);
    }

    #[test]
    fn gate_counts_down_and_reopens() {
        let mut gate = RetryGate::new(Duration::from_secs(60));
        let start = Instant::now();
        assert!(gate.is_open(start));

        gate.arm(start);
        assert_eq!(gate.remaining(start), Duration::from_secs(60));
        assert_eq!(
            gate.remaining(start + Duration::from_secs(45)),
            Duration::from_secs(15)
        );
        assert!(gate.is_open(start + Duration::from_secs(61)));
    }

    #[test]
    fn gate_ignores_complete_or_unthrottled_outcomes() {
        let mut gate = RetryGate::new(Duration::from_secs(60));
        let now = Instant::now();
        let outcome = BatchOutcome {
            resolved: Default::default(),
            failed_ids: vec!["a".into()],
            is_rate_limited: false,
            rounds: 2,
        };

        gate.observe(&outcome, now);
        assert!(gate.is_open(now));

        gate.observe(
            &BatchOutcome {
                failed_ids: vec![],
                is_rate_limited: true,
                ..outcome
            },
            now,
        );
        assert!(gate.is_open(now));
    }

    fn no_retry_delay() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn added_messages_carry_sender_languages() {
        let mut transcript = Transcript {
            customer_language: Some("th".into()),
            ..Transcript::default()
        };

        let customer = transcript.add_message("สวัสดี", Sender::Customer, None, None);
        let agent = transcript.add_message(
            "Hello",
            Sender::Agent,
            Some("สวัสดีครับ".into()),
            Some("formal".into()),
        );

        assert_ne!(customer, agent);
        let message = transcript.message(&customer).unwrap();
        assert_eq!(message.language, "th");
        assert_eq!(message.translated_language.as_deref(), Some("en"));
        assert!(message.needs_translation());
        assert!(message.timestamp > 0);

        let message = transcript.message(&agent).unwrap();
        assert_eq!(message.language, "en");
        assert_eq!(message.translated_language.as_deref(), Some("th"));
        assert_eq!(message.translated_text.as_deref(), Some("สวัสดีครับ"));
        assert_eq!(message.tone.as_deref(), Some("formal"));
    }

    #[test]
    fn empty_preview_is_stored_as_untranslated() {
        let mut transcript = Transcript::default();

        let id = transcript.add_message("Hi", Sender::Agent, Some(String::new()), None);

        assert!(transcript.message(&id).unwrap().needs_translation());
        assert_eq!(transcript.pending().count(), 1);
    }

    #[test]
    fn clear_drops_history_but_keeps_languages() {
        let mut transcript = transcript();
        transcript.customer_language = Some("ko".into());

        transcript.clear();

        assert!(transcript.messages.is_empty());
        assert_eq!(transcript.customer_language.as_deref(), Some("ko"));
        let out = serde_json::to_value(&transcript).unwrap();
        assert_eq!(out["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn customer_message_is_translated_on_arrival() {
        let session = session(ScriptedTransport::default()).with_retry_policy(no_retry_delay());
        let translator = LlmTranslator::new(ScriptedTransport::new(vec![
            Err(TransportError::Status(503)),
            Ok("Where is my order?".into()),
        ]));
        let mut transcript = Transcript::default();

        let id = session
            .add_message(&translator, &mut transcript, "我的订单在哪里？", Sender::Customer, None, None)
            .await;

        let message = transcript.message(&id).unwrap();
        assert_eq!(message.translated_text.as_deref(), Some("Where is my order?"));
        assert_eq!(message.language, "zh");
        assert_eq!(transcript.agent_language.as_deref(), Some("en"));
        assert_eq!(translator.transport.calls(), 2);
        assert!(translator.transport.prompts()[0].starts_with("Translate to English."));
    }

    #[tokio::test]
    async fn failed_arrival_translation_leaves_message_pending() {
        let session = session(ScriptedTransport::default()).with_retry_policy(no_retry_delay());
        let translator = LlmTranslator::new(ScriptedTransport::new(vec![
            Err(TransportError::Status(429)),
            Err(TransportError::Status(429)),
        ]));
        let mut transcript = Transcript::default();

        let id = session
            .add_message(&translator, &mut transcript, "你好", Sender::Customer, None, None)
            .await;

        assert!(transcript.message(&id).unwrap().needs_translation());
        assert_eq!(transcript.pending().count(), 1);
    }

    #[tokio::test]
    async fn agent_and_manual_mode_messages_are_not_auto_translated() {
        let translator = LlmTranslator::new(ScriptedTransport::default());
        let mut transcript = Transcript::default();

        let session = session(ScriptedTransport::default());
        session
            .add_message(
                &translator,
                &mut transcript,
                "How can I help?",
                Sender::Agent,
                Some("我能帮您什么？".into()),
                Some("happy".into()),
            )
            .await;

        let session = session.with_auto_translate(false);
        let id = session
            .add_message(&translator, &mut transcript, "你好", Sender::Customer, None, None)
            .await;

        assert_eq!(translator.transport.calls(), 0);
        assert!(transcript.message(&id).unwrap().needs_translation());
        assert_eq!(transcript.messages[0].tone.as_deref(), Some("happy"));
    }

    #[tokio::test]
    async fn reply_preview_targets_customer_language_with_tone() {
        let session = session(ScriptedTransport::default());
        let mut transcript = Transcript::default();
        transcript.customer_language = Some("ja".into());

        let preview = session
            .preview_reply(&DryRunTranslator, &transcript, "Thanks!", Some("formal"))
            .await
            .unwrap();

        assert_eq!(preview.translation, "[DRY:ja] Thanks!");
        assert_eq!(preview.toned_original.as_deref(), Some("[DRY:formal] Thanks!"));
    }
}
