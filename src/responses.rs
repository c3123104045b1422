use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::prompts::{TO_AGENT_FIELD, TO_CUSTOMER_FIELD};

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:[\w-]+)?\s*([\s\S]*?)```").expect("code fence regex"));

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("model reply is empty")]
    Empty,

    #[error("model reply is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("model reply is not a JSON object")]
    NotAnObject,

    #[error("model reply is missing string field '{0}'")]
    MissingField(&'static str),
}

/// Reply to a toned single-message request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleReply {
    pub translation: String,
    pub toned_original: Option<String>,
}

/// Batch reply with slot positions preserved.
///
/// A slot is `None` when the model put something other than a string there.
/// Arrays may be shorter or longer than the request group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    pub to_customer: Vec<Option<String>>,
    pub to_agent: Vec<Option<String>>,
}

/// Body of the first fenced block if there is one, otherwise the trimmed text.
pub fn strip_code_fence(text: &str) -> &str {
    CODE_FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|body| body.as_str())
        .unwrap_or(text)
        .trim()
}

pub fn parse_single(text: &str) -> Result<SingleReply, ParseError> {
    let cleaned = strip_code_fence(text);
    if cleaned.is_empty() {
        return Err(ParseError::Empty);
    }

    let value: Value = serde_json::from_str(cleaned)?;
    let Value::Object(map) = value else {
        return Err(ParseError::NotAnObject);
    };

    let translation = map
        .get("translation")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("translation"))?
        .to_string();
    let toned_original = map
        .get("tonedOriginal")
        .and_then(Value::as_str)
        .map(String::from);

    Ok(SingleReply {
        translation,
        toned_original,
    })
}

fn string_slots(value: Option<&Value>) -> Vec<Option<String>> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Lenient batch parse. `None` means the round made no progress.
pub fn parse_batch(text: &str) -> Option<ParsedBatch> {
    let cleaned = strip_code_fence(text);

    let value: Value = match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, reply = %text, "failed to parse batch reply");
            return None;
        }
    };

    let Value::Object(map) = value else {
        warn!(reply = %text, "batch reply is not a JSON object");
        return None;
    };

    if !map.contains_key(TO_CUSTOMER_FIELD) && !map.contains_key(TO_AGENT_FIELD) {
        warn!(reply = %text, "batch reply has neither translation array");
        return None;
    }

    Some(ParsedBatch {
        to_customer: string_slots(map.get(TO_CUSTOMER_FIELD)),
        to_agent: string_slots(map.get(TO_AGENT_FIELD)),
    })
}
