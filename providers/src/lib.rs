//! Client for the chat-completions agent server.
//!
//! The annotator talks to a single OpenAI-compatible server exposing
//! `/v1/chat/completions`, `/tokenize` and `/health`. Everything above this
//! crate depends on the [`AgentBackend`] trait rather than the concrete
//! [`AgentClient`], so tests can substitute a scripted backend.

mod client;
pub mod retry;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

pub use annotator_types::Message;
pub use client::{AgentClient, AgentClientError, DEFAULT_BASE_URL};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Boxed future returned by [`AgentBackend`] methods.
pub type BackendFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, AgentClientError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub model: Option<String>,
    /// Tool schemas in chat-completions form. Empty means no tools offered.
    pub tools: Vec<Value>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(messages: Vec<Message>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            max_tokens,
            model: None,
            tools: Vec::new(),
        }
    }

    /// JSON request body. Tool choice is `auto` whenever tools are offered.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut payload = serde_json::json!({
            "messages": self.messages.iter().map(Message::to_wire).collect::<Vec<_>>(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(model) = &self.model {
            payload["model"] = Value::String(model.clone());
        }
        if !self.tools.is_empty() {
            payload["tools"] = Value::Array(self.tools.clone());
            payload["tool_choice"] = Value::String("auto".to_string());
        }
        payload
    }
}

/// First choice of a chat completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub message: Message,
    pub raw: Value,
}

pub trait AgentBackend: Send + Sync {
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> BackendFut<'a, ChatReply>;

    /// Token ids the server's tokenizer produces for `text`.
    fn tokenize<'a>(&'a self, text: &'a str) -> BackendFut<'a, Vec<u32>>;

    /// `Ok(true)` only when the server answers `/health` with a 2xx.
    fn health(&self) -> BackendFut<'_, bool>;
}

pub fn http_client_with_timeout(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}
