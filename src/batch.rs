//! Batch translation across both chat directions.
//!
//! A batch call runs a bounded number of rounds. Each round sends one prompt
//! covering every message still unresolved, maps the reply back onto those
//! messages by array position, and narrows the remaining set. Transport and
//! parse failures only cost the round they happen in.

use std::{collections::HashMap, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    languages::language_name,
    prompts::{PendingMessage, build_batch_prompt},
    responses::{ParsedBatch, parse_batch},
    transport::{ChatPrompt, ChatTransport, ResponseSchema, STATUS_OK, STATUS_TOO_MANY_REQUESTS},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_rounds: usize,
    pub round_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            round_delay: Duration::from_millis(500),
        }
    }
}

/// Receives `(message id, translated text)` as soon as a message resolves.
pub type PartialResultSink<'a> = &'a mut (dyn FnMut(&str, &str) + Send);

pub struct BatchOptions<'a> {
    pub customer_language_code: &'a str,
    pub agent_language_code: &'a str,
    pub on_partial_result: Option<PartialResultSink<'a>>,
}

impl<'a> BatchOptions<'a> {
    pub fn new(customer_language_code: &'a str, agent_language_code: &'a str) -> Self {
        Self {
            customer_language_code,
            agent_language_code,
            on_partial_result: None,
        }
    }

    pub fn on_partial_result(mut self, sink: PartialResultSink<'a>) -> Self {
        self.on_partial_result = Some(sink);
        self
    }
}

/// Translations resolved so far, keyed by message id. First write wins.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    entries: HashMap<String, String>,
}

impl ResultAccumulator {
    /// Returns false if `id` was already resolved; the stored text is kept.
    pub fn record(&mut self, id: &str, text: &str) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), text.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages from `group` not yet resolved, in their original order.
    pub fn unresolved(&self, group: &[PendingMessage]) -> Vec<PendingMessage> {
        group
            .iter()
            .filter(|message| !self.contains(&message.id))
            .cloned()
            .collect()
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Both directions merged, keyed by message id.
    pub resolved: HashMap<String, String>,
    /// Unresolved "to customer" ids, then unresolved "to agent" ids.
    pub failed_ids: Vec<String>,
    /// The last round's request was answered with HTTP 429.
    pub is_rate_limited: bool,
    pub rounds: usize,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

struct RoundResult {
    status: u16,
    parsed: Option<ParsedBatch>,
}

fn map_slots(
    slots: &[Option<String>],
    group: &[PendingMessage],
    accumulator: &mut ResultAccumulator,
    notify: &mut impl FnMut(&str, &str),
) -> usize {
    let mut mapped = 0;
    for (message, slot) in group.iter().zip(slots) {
        let Some(text) = slot.as_deref().filter(|text| !text.is_empty()) else {
            continue;
        };
        if accumulator.record(&message.id, text) {
            debug!(id = %message.id, %text, "mapped translation");
            notify(&message.id, text);
            mapped += 1;
        }
    }
    mapped
}

pub struct BatchTranslator<T: ChatTransport> {
    transport: T,
    policy: BatchPolicy,
    structured_output: bool,
}

impl<T: ChatTransport> BatchTranslator<T> {
    pub fn new(transport: T, policy: BatchPolicy) -> Self {
        Self {
            transport,
            policy,
            structured_output: false,
        }
    }

    /// Attach the reply JSON Schema to every request as `response_format`.
    pub fn with_structured_output(mut self, enabled: bool) -> Self {
        self.structured_output = enabled;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn run_round(
        &self,
        to_customer: &[PendingMessage],
        to_agent: &[PendingMessage],
        customer_language: &str,
        agent_language: &str,
    ) -> RoundResult {
        let prompt = build_batch_prompt(to_customer, to_agent, customer_language, agent_language);
        debug!(%prompt, "batch prompt");

        let mut request = ChatPrompt::new(prompt);
        if self.structured_output {
            request = request.with_schema(ResponseSchema::batch_reply());
        }

        match self.transport.complete(&request).await {
            Ok(reply) => {
                debug!(%reply, "batch raw reply");
                RoundResult {
                    status: STATUS_OK,
                    parsed: parse_batch(&reply),
                }
            }
            Err(e) => {
                warn!(status = e.status_code(), error = %e, "batch request failed");
                RoundResult {
                    status: e.status_code(),
                    parsed: None,
                }
            }
        }
    }

    /// Translates agent messages into the customer language and customer
    /// messages into the agent language, retrying only what is unresolved.
    ///
    /// Never fails: anything not translated once rounds run out is reported
    /// in [`BatchOutcome::failed_ids`].
    pub async fn batch_translate(
        &self,
        to_customer: &[PendingMessage],
        to_agent: &[PendingMessage],
        options: BatchOptions<'_>,
    ) -> BatchOutcome {
        let BatchOptions {
            customer_language_code,
            agent_language_code,
            mut on_partial_result,
        } = options;
        let mut notify = |id: &str, text: &str| {
            if let Some(sink) = on_partial_result.as_mut() {
                sink(id, text);
            }
        };
        let customer_language = language_name(customer_language_code);
        let agent_language = language_name(agent_language_code);

        let mut accumulator = ResultAccumulator::default();
        let mut remaining_customer = to_customer.to_vec();
        let mut remaining_agent = to_agent.to_vec();
        let mut last_status = STATUS_OK;
        let mut rounds = 0;

        while rounds < self.policy.max_rounds {
            if remaining_customer.is_empty() && remaining_agent.is_empty() {
                break;
            }
            rounds += 1;

            let round = self
                .run_round(
                    &remaining_customer,
                    &remaining_agent,
                    customer_language,
                    agent_language,
                )
                .await;
            last_status = round.status;

            if let Some(parsed) = round.parsed {
                // Positions refer to this round's remaining groups, not the originals.
                let mapped = map_slots(
                    &parsed.to_customer,
                    &remaining_customer,
                    &mut accumulator,
                    &mut notify,
                ) + map_slots(
                    &parsed.to_agent,
                    &remaining_agent,
                    &mut accumulator,
                    &mut notify,
                );
                debug!(round = rounds, mapped, "batch round mapped");
            }

            remaining_customer = accumulator.unresolved(&remaining_customer);
            remaining_agent = accumulator.unresolved(&remaining_agent);

            let remaining = remaining_customer.len() + remaining_agent.len();
            if remaining == 0 {
                break;
            }
            if rounds < self.policy.max_rounds {
                info!(
                    round = rounds,
                    max_rounds = self.policy.max_rounds,
                    remaining,
                    "retrying unresolved messages"
                );
                tokio::time::sleep(self.policy.round_delay).await;
            }
        }

        let failed_ids: Vec<String> = accumulator
            .unresolved(to_customer)
            .into_iter()
            .chain(accumulator.unresolved(to_agent))
            .map(|message| message.id)
            .collect();

        if !failed_ids.is_empty() {
            warn!(
                failed = failed_ids.len(),
                rounds,
                "message(s) could not be translated"
            );
        }

        BatchOutcome {
            resolved: accumulator.into_inner(),
            failed_ids,
            is_rate_limited: last_status == STATUS_TOO_MANY_REQUESTS,
            rounds,
        }
    }
}
