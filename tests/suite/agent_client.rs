//! Agent client behavior seen through the backend trait

use annotator_context::TokenCounter;
use annotator_providers::ChatRequest;
use annotator_types::{Message, ThreadId, TurnTags};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{agent, chat_bodies, mount_chat_reply, start_agent_mock};

async fn tokenize_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/tokenize")
        .count()
}

#[tokio::test]
async fn counter_uses_remote_tokenizer() {
    let server = start_agent_mock().await;
    Mock::given(method("POST"))
        .and(path("/tokenize"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"tokens": [1, 2, 3, 4, 5]})),
        )
        .mount(&server)
        .await;

    let mut counter = TokenCounter::with_backend(agent(&server), 4.0);
    assert_eq!(counter.count("a fairly long sentence of text").await, 5);
    assert!(!counter.using_fallback());
}

#[tokio::test]
async fn tokenizer_failure_is_sticky() {
    let server = start_agent_mock().await;
    Mock::given(method("POST"))
        .and(path("/tokenize"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut counter = TokenCounter::with_backend(agent(&server), 4.0);
    assert_eq!(counter.count("abcdefgh").await, 2);
    assert!(counter.using_fallback());
    assert_eq!(counter.count("abcd").await, 1);
    assert_eq!(tokenize_requests(&server).await, 1);
}

#[tokio::test]
async fn health_reports_unhealthy_without_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(!agent(&server).health().await.unwrap());
}

#[tokio::test]
async fn chat_strips_turn_tags_from_the_wire() {
    let server = start_agent_mock().await;
    mount_chat_reply(&server, "Noted.").await;

    let tagged = Message::user("Scene text").tagged(TurnTags::new(ThreadId::new(4), 2));
    let request = ChatRequest::new(vec![Message::system("sys"), tagged], 256, 0.4);
    let reply = agent(&server).chat(&request).await.unwrap();
    assert_eq!(reply.message.content(), "Noted.");

    let bodies = chat_bodies(&server).await;
    let sent = &bodies[0]["messages"][1];
    assert_eq!(sent["content"], "Scene text");
    assert!(sent.get("thread_id").is_none());
    assert!(sent.get("scene_index").is_none());
    assert!(bodies[0].get("tools").is_none());
}
