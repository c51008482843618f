//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use annotator_context::{GlossaryStore, NewEntry};
use annotator_providers::retry::RetryConfig;
use annotator_providers::{AgentBackend, AgentClient};
use annotator_types::{EntryId, EntryStatus, PostId, ThreadId};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start a mock agent server answering `/health` with 200.
pub async fn start_agent_mock() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Every chat completion answers with `content`.
pub async fn mount_chat_reply(server: &MockServer, content: &str) {
    let body = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    });
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn mount_chat_status(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_string("unavailable"))
        .mount(server)
        .await;
}

/// Single-attempt client so failure tests stay fast.
pub fn agent(server: &MockServer) -> Arc<dyn AgentBackend> {
    Arc::new(
        AgentClient::new(&server.uri(), Duration::from_secs(5))
            .expect("client builds")
            .with_retry(RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            }),
    )
}

/// Bodies of all chat requests the server received, in order.
pub async fn chat_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/v1/chat/completions")
        .filter_map(|r| serde_json::from_slice(&r.body).ok())
        .collect()
}

pub fn create_entry(
    store: &mut GlossaryStore,
    term: &str,
    definition: &str,
    post: i64,
    thread: i64,
) -> EntryId {
    store
        .create(&NewEntry {
            term: term.to_string(),
            definition: definition.to_string(),
            tags: vec!["place".to_string()],
            status: EntryStatus::Tentative,
            post_id: PostId::new(post),
            thread_id: ThreadId::new(thread),
        })
        .expect("entry created")
}
