//! Compaction against an HTTP agent and a real glossary database

use annotator_context::{
    AnnotationContext, CompactionInput, CompactionState, CompactorConfig, ContextCompactor,
    GlossaryStore, PromptFrame, ThreadSummarizer, Tier, TokenCounter,
};
use annotator_types::{Role, ThreadId, TurnTags};

use crate::common::{
    agent, chat_bodies, create_entry, mount_chat_reply, mount_chat_status, start_agent_mock,
};

fn push_turn(ctx: &mut AnnotationContext, thread: i64, scene: u32, tokens: usize) {
    ctx.record_turn(
        Role::User,
        "x".repeat(tokens * 4),
        None,
        TurnTags::new(ThreadId::new(thread), scene),
    )
    .unwrap();
}

/// Threads 1 and 2 finished, thread 3 in progress; about 8200 tokens.
fn three_threads() -> (AnnotationContext, CompactionState) {
    let mut ctx = AnnotationContext::new("sys");
    push_turn(&mut ctx, 1, 0, 3000);
    push_turn(&mut ctx, 2, 0, 3000);
    push_turn(&mut ctx, 3, 0, 2200);

    let mut state = CompactionState::new();
    for thread in 1..=2 {
        state.start_new_thread(ThreadId::new(thread));
        state.advance_scene();
        state.finish_current_thread();
    }
    state.start_new_thread(ThreadId::new(3));
    (ctx, state)
}

fn compactor(server_agent: std::sync::Arc<dyn annotator_providers::AgentBackend>) -> ContextCompactor {
    ContextCompactor::new(
        CompactorConfig {
            budget: 10_000,
            ..CompactorConfig::default()
        },
        TokenCounter::heuristic(4.0),
        ThreadSummarizer::new(Some(server_agent.clone()), 512, 4.0),
        Some(server_agent),
    )
}

#[tokio::test]
async fn evicts_oldest_thread_through_agent() {
    let server = start_agent_mock().await;
    mount_chat_reply(&server, "Digest.").await;
    let dir = tempfile::tempdir().unwrap();
    let mut glossary = GlossaryStore::open(dir.path().join("annotator.db")).unwrap();
    create_entry(&mut glossary, "Shard Gate", "A portal of glass.", 1, 1);

    let (mut ctx, mut state) = three_threads();
    let mut compactor = compactor(agent(&server));
    let frame_messages = ctx.build_messages(&PromptFrame::from_state(&state, None, &[]));
    assert!(compactor.should_compact(&frame_messages));

    let input = CompactionInput {
        scene: None,
        relevant_entries: &[],
        glossary: &glossary,
    };
    let (messages, result) = compactor.compact(&mut ctx, &mut state, &input).await;

    assert_eq!(result.threads_summarized, 1);
    assert_eq!(result.highest_tier, Some(Tier::Thread));
    assert!(result.target_reached);
    assert!(result.final_tokens < result.initial_tokens);
    assert_eq!(state.completed_thread_ids(), &[ThreadId::new(2)]);
    assert_eq!(state.cumulative_summary(), "Digest.");
    assert!(ctx.history().iter().all(|m| m.thread_id() != Some(ThreadId::new(1))));
    assert_eq!(
        messages[1].content(),
        "<cumulative_summary>Digest.</cumulative_summary>"
    );
    assert_eq!(compactor.stats().activations(Tier::Thread), 1);

    let bodies = chat_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].to_string().contains("Shard Gate"));
    assert!(bodies[1].to_string().contains("Thread 1: Digest."));
}

#[tokio::test]
async fn agent_failure_falls_back_to_heuristic_summary() {
    let server = start_agent_mock().await;
    mount_chat_status(&server, 500).await;
    let dir = tempfile::tempdir().unwrap();
    let mut glossary = GlossaryStore::open(dir.path().join("annotator.db")).unwrap();
    create_entry(&mut glossary, "Shard Gate", "A portal of glass.", 1, 1);

    let (mut ctx, mut state) = three_threads();
    let mut compactor = compactor(agent(&server));
    let input = CompactionInput {
        scene: None,
        relevant_entries: &[],
        glossary: &glossary,
    };
    let (_, result) = compactor.compact(&mut ctx, &mut state, &input).await;

    assert_eq!(result.threads_summarized, 1);
    assert_eq!(
        state.cumulative_summary(),
        "Thread 1: Thread 1 processed. Created entries: Shard Gate."
    );
    assert_eq!(ctx.history().len(), 2);
}
