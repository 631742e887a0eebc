//! Wire events read from the agent process's stdout — one JSON object per
//! line, with cumulative text payloads turned into incremental deltas.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::trace;

/// An event emitted by the agent process.
///
/// Unknown event types and malformed lines are never fatal: partial or
/// interleaved output is expected from the stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// System bookkeeping; `subtype == "init"` carries the session token.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// One assistant turn. Text payloads are cumulative per message id.
    Assistant { message: AssistantMessage },
    /// Final event: resolved session token, cost, model, and a fallback
    /// text field used only when no incremental text was captured.
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        result: Option<String>,
    },
    /// Any event type this kernel does not interpret.
    #[serde(other)]
    Unknown,
}

/// The message body of an assistant event.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// A content block inside an assistant message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    /// Tool use, thinking, and other block types are not interpreted here.
    #[serde(other)]
    Other,
}

/// Tracks how much text has already been emitted per assistant message id,
/// so cumulative payloads can be turned into suffix-only deltas.
///
/// A new message id starts at zero — a new turn has begun, typically after
/// a tool call — so its full payload is treated as new text.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    emitted: HashMap<String, usize>,
    accumulated: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cumulative text payload for a message id. Returns the suffix
    /// not yet emitted for that id, if any, after appending it to the
    /// accumulated full text.
    pub fn push(&mut self, message_id: &str, cumulative: &str) -> Option<String> {
        let seen = self.emitted.entry(message_id.to_string()).or_insert(0);
        if cumulative.len() <= *seen {
            return None;
        }
        // A payload that is not a superset of what was already emitted can
        // put the recorded offset inside a multibyte char; skip that line
        // rather than panic mid-stream.
        let delta = cumulative.get(*seen..)?.to_string();
        *seen = cumulative.len();
        self.accumulated.push_str(&delta);
        Some(delta)
    }

    /// Use the result event's final text only if no incremental text arrived.
    pub fn fallback(&mut self, text: &str) {
        if self.accumulated.is_empty() {
            self.accumulated.push_str(text);
        }
    }

    /// The full text accumulated so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Consume the tracker, returning the full accumulated text.
    pub fn into_text(self) -> String {
        self.accumulated
    }
}

/// Incremental interpretation state for one invocation's event stream.
#[derive(Debug, Default)]
pub struct StreamState {
    pub tracker: DeltaTracker,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one stdout line, forwarding any new text to `on_delta`.
    ///
    /// Lines that fail to parse are silently skipped.
    pub fn apply_line(&mut self, line: &str, mut on_delta: impl FnMut(&str)) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let event = match serde_json::from_str::<AgentEvent>(line) {
            Ok(event) => event,
            Err(error) => {
                trace!(%error, "Skipping unparseable stream line");
                return;
            }
        };

        match event {
            AgentEvent::System { subtype, session_id } => {
                if subtype == "init" && session_id.is_some() {
                    self.session_id = session_id;
                }
            }
            AgentEvent::Assistant { message } => {
                let AssistantMessage { id, model, content } = message;
                if self.model.is_none() {
                    self.model = model;
                }
                for block in content {
                    if let ContentBlock::Text { text } = block {
                        if let Some(delta) = self.tracker.push(&id, &text) {
                            on_delta(&delta);
                        }
                    }
                }
            }
            AgentEvent::Result {
                session_id,
                total_cost_usd,
                model,
                result,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if total_cost_usd.is_some() {
                    self.cost_usd = total_cost_usd;
                }
                if model.is_some() {
                    self.model = model;
                }
                if let Some(final_text) = result {
                    self.tracker.fallback(&final_text);
                }
            }
            AgentEvent::Unknown => {}
        }
    }
}
