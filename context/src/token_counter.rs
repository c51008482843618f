//! Token estimation for budget tracking.
//!
//! Counts are **approximate**. [`TokenCounter::count`] asks the agent
//! server's tokenizer once and, on the first failure, switches permanently to
//! a character heuristic so a flaky backend costs at most one failed request.
//! [`TokenCounter::count_messages`] always uses the heuristic: compaction
//! measures the whole message list repeatedly and must not issue a request
//! per message.

use std::fmt;
use std::sync::Arc;

use annotator_providers::AgentBackend;
use annotator_types::Message;

/// Role markers and message delimiters.
pub const MESSAGE_OVERHEAD: u64 = 4;
/// Function-call envelope around a tool call's name and arguments.
pub const TOOL_CALL_OVERHEAD: u64 = 10;
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

enum CounterMode {
    Remote(Arc<dyn AgentBackend>),
    /// One-way: once entered, the remote tokenizer is never tried again.
    Fallback,
}

pub struct TokenCounter {
    mode: CounterMode,
    chars_per_token: f64,
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            CounterMode::Remote(_) => "remote",
            CounterMode::Fallback => "fallback",
        };
        f.debug_struct("TokenCounter")
            .field("mode", &mode)
            .field("chars_per_token", &self.chars_per_token)
            .finish()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::heuristic(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenCounter {
    /// Counter that tries `backend`'s tokenizer first.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn AgentBackend>, chars_per_token: f64) -> Self {
        Self {
            mode: CounterMode::Remote(backend),
            chars_per_token,
        }
    }

    /// Counter that never calls a backend.
    #[must_use]
    pub fn heuristic(chars_per_token: f64) -> Self {
        Self {
            mode: CounterMode::Fallback,
            chars_per_token,
        }
    }

    #[must_use]
    pub fn using_fallback(&self) -> bool {
        matches!(self.mode, CounterMode::Fallback)
    }

    /// Exact count from the backend tokenizer while it works; heuristic after.
    pub async fn count(&mut self, text: &str) -> u64 {
        if let CounterMode::Remote(backend) = &self.mode {
            match backend.tokenize(text).await {
                Ok(tokens) => return tokens.len() as u64,
                Err(e) => {
                    tracing::warn!(error = %e, "Tokenize failed, falling back to heuristic");
                    self.mode = CounterMode::Fallback;
                }
            }
        }
        self.estimate(text)
    }

    /// `max(1, floor(chars / chars_per_token))`. Never zero, even for `""`.
    #[must_use]
    pub fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        ((chars / self.chars_per_token) as u64).max(1)
    }

    /// Heuristic total for a request: content plus per-message overhead, plus
    /// name, arguments and envelope for each tool call.
    #[must_use]
    pub fn count_messages(&self, messages: &[Message]) -> u64 {
        messages.iter().map(|msg| self.count_message(msg)).sum()
    }

    #[must_use]
    pub fn count_message(&self, msg: &Message) -> u64 {
        let mut total = MESSAGE_OVERHEAD;
        if !msg.content().is_empty() {
            total += self.estimate(msg.content());
        }
        for call in msg.tool_calls() {
            if !call.name.is_empty() {
                total += self.estimate(&call.name);
            }
            if !call.arguments.is_empty() {
                total += self.estimate(&call.arguments);
            }
            total += TOOL_CALL_OVERHEAD;
        }
        total
    }
}
