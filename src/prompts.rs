use std::fmt;

pub const TO_CUSTOMER_FIELD: &str = "toCustomerLanguage";
pub const TO_AGENT_FIELD: &str = "toAgentLanguage";

/// A chat message still waiting for a translation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingMessage {
    pub id: String,
    pub text: String,
}

impl PendingMessage {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.text)
    }
}

/// Shape the model is asked to reply with for a batch request.
///
/// Only used to describe the reply (structured output); replies are parsed
/// leniently by [`crate::responses::parse_batch`].
#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct BatchReply {
    #[serde(rename = "toCustomerLanguage")]
    pub to_customer_language: Vec<String>,
    #[serde(rename = "toAgentLanguage")]
    pub to_agent_language: Vec<String>,
}

pub fn build_single_message_prompt(
    text: &str,
    target_language_name: &str,
    tone: Option<&str>,
) -> String {
    let Some(tone) = tone else {
        return format!(
            "Translate to {target_language_name}. Only return the translation, nothing else.\n\nText: {text}"
        );
    };

    format!(
        r#"Apply a {tone} tone to this message and translate it to {target_language_name}.

Original: {text}

Return ONLY a JSON object, with no markdown and no explanation:
{{
  "tonedOriginal": "the message rewritten with {tone} tone in its original language",
  "translation": "the toned message translated to {target_language_name}"
}}"#
    )
}

fn build_message_section(messages: &[PendingMessage], header: &str) -> String {
    let mut section = format!("{}:", header);
    for (idx, message) in messages.iter().enumerate() {
        section.push_str(&format!("\n{}. {}", idx + 1, message));
    }
    section
}

fn placeholder_array(count: usize) -> &'static str {
    match count {
        0 => "[]",
        1 => r#"["translation1"]"#,
        _ => r#"["translation1", ...]"#,
    }
}

fn build_expected_output_format(customer_count: usize, agent_count: usize) -> String {
    format!(
        "{{\n  \"{}\": {},\n  \"{}\": {}\n}}",
        TO_CUSTOMER_FIELD,
        placeholder_array(customer_count),
        TO_AGENT_FIELD,
        placeholder_array(agent_count)
    )
}

/// Builds one request covering both translation directions.
///
/// Ids are shown to the model for readability only; replies are matched
/// back to messages by array position.
pub fn build_batch_prompt(
    to_customer: &[PendingMessage],
    to_agent: &[PendingMessage],
    customer_language_name: &str,
    agent_language_name: &str,
) -> String {
    let mut sections = Vec::new();
    if !to_customer.is_empty() {
        sections.push(build_message_section(
            to_customer,
            &format!("Translate to {}", customer_language_name),
        ));
    }
    if !to_agent.is_empty() {
        sections.push(build_message_section(
            to_agent,
            &format!("Translate to {}", agent_language_name),
        ));
    }

    format!(
        "You are a translator.\n\n{}\n\nReturn ONLY a JSON object with this exact structure:\n{}\n\nEach array should contain translations in the same order as the input messages.",
        sections.join("\n\n"),
        build_expected_output_format(to_customer.len(), to_agent.len())
    )
}
