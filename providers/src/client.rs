use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::{
    AgentBackend, BackendFut, ChatReply, ChatRequest, HEALTH_TIMEOUT_SECS,
    http_client_with_timeout,
};
use annotator_types::{Message, WireError};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_ERROR_BODY_CHARS: usize = 2048;

#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("cannot connect to {base_url}")]
    Connect {
        base_url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("request error ({status}): {body}")]
    Request { status: u16, body: String },
    #[error("request failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<WireError> for AgentClientError {
    fn from(e: WireError) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// HTTP client for the agent server.
#[derive(Debug, Clone)]
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
    health_http: reqwest::Client,
    retry: RetryConfig,
}

impl AgentClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AgentClientError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http_client_with_timeout(timeout).map_err(AgentClientError::Build)?,
            health_http: http_client_with_timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
                .map_err(AgentClientError::Build)?,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_defaults() -> Result<Self, AgentClientError> {
        Self::new(
            DEFAULT_BASE_URL,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, AgentClientError> {
        let data = self
            .post_json("/v1/chat/completions", &request.to_payload())
            .await?;
        let message = data
            .pointer("/choices/0/message")
            .ok_or_else(|| AgentClientError::Malformed("missing choices[0].message".into()))?;
        let message = Message::from_wire(message)?;
        Ok(ChatReply { message, raw: data })
    }

    pub async fn tokenize(&self, text: &str) -> Result<Vec<u32>, AgentClientError> {
        let data = self.post_json("/tokenize", &json!({ "prompt": text })).await?;
        let tokens = data
            .get("tokens")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentClientError::Malformed("missing tokens".into()))?;
        tokens
            .iter()
            .map(|t| {
                t.as_u64()
                    .and_then(|t| u32::try_from(t).ok())
                    .ok_or_else(|| AgentClientError::Malformed(format!("bad token id {t}")))
            })
            .collect()
    }

    /// Never errors: any failure reads as unhealthy.
    pub async fn health_check(&self) -> bool {
        match self
            .health_http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Agent health check failed");
                false
            }
        }
    }

    async fn post_json(&self, endpoint: &str, payload: &Value) -> Result<Value, AgentClientError> {
        let url = format!("{}{endpoint}", self.base_url);
        tracing::debug!(endpoint, "Agent request");
        let started = std::time::Instant::now();

        let outcome = send_with_retry(|| self.http.post(&url).json(payload), &self.retry).await;
        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                let status = response.status();
                let body = read_capped_error_body(response).await;
                if status.is_server_error() {
                    return Err(AgentClientError::Server {
                        status: status.as_u16(),
                        body,
                    });
                }
                tracing::warn!(endpoint, status = status.as_u16(), "Agent request error");
                return Err(AgentClientError::Request {
                    status: status.as_u16(),
                    body,
                });
            }
            RetryOutcome::TimedOut { attempts } => {
                return Err(AgentClientError::Timeout { attempts });
            }
            RetryOutcome::ConnectFailed(source) => {
                return Err(AgentClientError::Connect {
                    base_url: self.base_url.clone(),
                    source,
                });
            }
            RetryOutcome::Transport { attempts, source } => {
                return Err(AgentClientError::Transport { attempts, source });
            }
        };

        let status = response.status();
        let data = response
            .json::<Value>()
            .await
            .map_err(|e| AgentClientError::Malformed(e.to_string()))?;
        tracing::debug!(
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis(),
            "Agent response"
        );
        Ok(data)
    }
}

async fn read_capped_error_body(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    if text.chars().count() > MAX_ERROR_BODY_CHARS {
        let head: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
        return format!("{head}...(truncated)");
    }
    text
}

impl AgentBackend for AgentClient {
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> BackendFut<'a, ChatReply> {
        Box::pin(AgentClient::chat(self, request))
    }

    fn tokenize<'a>(&'a self, text: &'a str) -> BackendFut<'a, Vec<u32>> {
        Box::pin(AgentClient::tokenize(self, text))
    }

    fn health(&self) -> BackendFut<'_, bool> {
        Box::pin(async move { Ok(self.health_check().await) })
    }
}
