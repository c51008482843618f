//! Thread and chunk digests for compaction.
//!
//! Summaries come from the agent when it answers and from a deterministic
//! heuristic over glossary entry names otherwise, so summarization never
//! stops an unattended run.

use std::collections::HashSet;
use std::sync::Arc;

use annotator_providers::{AgentBackend, ChatRequest};
use annotator_types::text::{join_capped, truncate_preview};
use annotator_types::{EntryId, GlossaryEntry, Message, Role, ThreadId};

use crate::glossary::{Glossary, ThreadField};
use crate::prompts::{
    CHUNK_SUMMARY_PROMPT, CHUNK_SUMMARY_REQUEST, SUMMARY_REQUEST, THREAD_SUMMARY_PROMPT,
};
use crate::state::{ChunkSummary, PendingChunk, ThreadSummary};

pub const DEFAULT_SUMMARY_MAX_TOKENS: u32 = 512;
pub(crate) const SUMMARY_TEMPERATURE: f32 = 0.3;
const EXCERPT_TURNS: usize = 6;
const EXCERPT_TURN_CHARS: usize = 500;
const PROMPT_NAME_LIMIT: usize = 10;
const HEURISTIC_NAME_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryResult {
    pub thread_id: ThreadId,
    pub summary_text: String,
    pub entries_created: Vec<EntryId>,
    pub entries_updated: Vec<EntryId>,
    pub token_count: u64,
}

impl SummaryResult {
    #[must_use]
    pub fn into_thread_summary(self, position: u32) -> ThreadSummary {
        ThreadSummary {
            thread_id: self.thread_id,
            position,
            summary_text: self.summary_text,
            entries_created: self.entries_created,
            entries_updated: self.entries_updated,
        }
    }
}

/// Which unit a summary covers; only changes the prompt and fallback wording.
#[derive(Debug, Clone, Copy)]
enum Scope {
    Thread,
    Chunk { first_scene: u32, last_scene: u32 },
}

pub struct ThreadSummarizer {
    backend: Option<Arc<dyn AgentBackend>>,
    max_tokens: u32,
    chars_per_token: f64,
}

impl ThreadSummarizer {
    /// `backend = None` always uses the heuristic.
    #[must_use]
    pub fn new(backend: Option<Arc<dyn AgentBackend>>, max_tokens: u32, chars_per_token: f64) -> Self {
        Self {
            backend,
            max_tokens,
            chars_per_token,
        }
    }

    pub async fn summarize_thread(
        &self,
        glossary: &dyn Glossary,
        thread_id: ThreadId,
        excerpt: &[Message],
    ) -> SummaryResult {
        self.summarize(glossary, thread_id, Scope::Thread, excerpt)
            .await
    }

    pub async fn summarize_chunk(
        &self,
        glossary: &dyn Glossary,
        thread_id: ThreadId,
        chunk: PendingChunk,
        position: u32,
        excerpt: &[Message],
    ) -> ChunkSummary {
        let scope = Scope::Chunk {
            first_scene: chunk.first_scene,
            last_scene: chunk.last_scene,
        };
        let result = self.summarize(glossary, thread_id, scope, excerpt).await;
        ChunkSummary {
            thread_id,
            position,
            summary_text: result.summary_text,
            entries_created: result.entries_created,
            entries_updated: result.entries_updated,
            chunk_index: chunk.index,
            first_scene_index: chunk.first_scene,
            last_scene_index: chunk.last_scene,
        }
    }

    async fn summarize(
        &self,
        glossary: &dyn Glossary,
        thread_id: ThreadId,
        scope: Scope,
        excerpt: &[Message],
    ) -> SummaryResult {
        let (created, updated) = entries_touched(glossary, thread_id);
        tracing::debug!(
            %thread_id,
            created = created.len(),
            updated = updated.len(),
            "Summarizing"
        );

        let mut summary_text = String::new();
        if let Some(backend) = &self.backend {
            let messages = build_summary_messages(thread_id, scope, excerpt, &created, &updated);
            let request = ChatRequest::new(messages, self.max_tokens, SUMMARY_TEMPERATURE);
            match backend.chat(&request).await {
                Ok(reply) => summary_text = reply.message.content().trim().to_string(),
                Err(e) => {
                    tracing::warn!(%thread_id, error = %e, "Agent summarization failed");
                }
            }
        }
        if summary_text.is_empty() {
            tracing::info!(%thread_id, "Using heuristic summary");
            summary_text = heuristic_summary(thread_id, scope, &created, &updated);
        }

        let token_count =
            ((summary_text.chars().count() as f64 / self.chars_per_token) as u64).max(1);
        SummaryResult {
            thread_id,
            summary_text,
            entries_created: created.iter().map(|e| e.id).collect(),
            entries_updated: updated.iter().map(|e| e.id).collect(),
            token_count,
        }
    }
}

/// Entries created in the thread, and entries last updated there but created elsewhere.
fn entries_touched(
    glossary: &dyn Glossary,
    thread_id: ThreadId,
) -> (Vec<GlossaryEntry>, Vec<GlossaryEntry>) {
    let lookup = |field| {
        glossary
            .get_by_thread(thread_id, field)
            .unwrap_or_else(|e| {
                tracing::warn!(%thread_id, error = %e, "Glossary lookup failed during summarization");
                Vec::new()
            })
    };
    let created = lookup(ThreadField::FirstSeen);
    let created_ids: HashSet<EntryId> = created.iter().map(|e| e.id).collect();
    let updated = lookup(ThreadField::LastUpdated)
        .into_iter()
        .filter(|e| !created_ids.contains(&e.id))
        .collect();
    (created, updated)
}

fn terms(entries: &[GlossaryEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.term.as_str()).collect()
}

fn build_summary_messages(
    thread_id: ThreadId,
    scope: Scope,
    excerpt: &[Message],
    created: &[GlossaryEntry],
    updated: &[GlossaryEntry],
) -> Vec<Message> {
    let or_none = |s: String| if s.is_empty() { "(none)".to_string() } else { s };
    let created_str = or_none(join_capped(&terms(created), PROMPT_NAME_LIMIT));
    let updated_str = or_none(join_capped(&terms(updated), PROMPT_NAME_LIMIT));

    let (template, request) = match scope {
        Scope::Thread => (THREAD_SUMMARY_PROMPT.to_string(), SUMMARY_REQUEST),
        Scope::Chunk {
            first_scene,
            last_scene,
        } => (
            CHUNK_SUMMARY_PROMPT
                .replace("{first_scene}", &first_scene.to_string())
                .replace("{last_scene}", &last_scene.to_string()),
            CHUNK_SUMMARY_REQUEST,
        ),
    };
    let prompt = template
        .replace("{thread_id}", &thread_id.to_string())
        .replace("{entries_created}", &created_str)
        .replace("{entries_updated}", &updated_str);

    let mut messages = vec![Message::system(prompt)];
    let recent = &excerpt[excerpt.len().saturating_sub(EXCERPT_TURNS)..];
    for turn in recent {
        let content = truncate_preview(turn.content(), EXCERPT_TURN_CHARS, "...");
        match turn.role() {
            Role::User => messages.push(Message::user(content)),
            Role::Assistant => messages.push(Message::assistant(content)),
            Role::System | Role::Tool => {}
        }
    }
    messages.push(Message::user(request));
    messages
}

fn heuristic_summary(
    thread_id: ThreadId,
    scope: Scope,
    created: &[GlossaryEntry],
    updated: &[GlossaryEntry],
) -> String {
    let mut parts = vec![match scope {
        Scope::Thread => format!("Thread {thread_id} processed."),
        Scope::Chunk {
            first_scene,
            last_scene,
        } => format!("Thread {thread_id} scenes {first_scene}-{last_scene} processed."),
    }];
    if !created.is_empty() {
        parts.push(format!(
            "Created entries: {}.",
            join_capped(&terms(created), HEURISTIC_NAME_LIMIT)
        ));
    }
    if !updated.is_empty() {
        parts.push(format!(
            "Updated entries: {}.",
            join_capped(&terms(updated), HEURISTIC_NAME_LIMIT)
        ));
    }
    if created.is_empty() && updated.is_empty() {
        parts.push("No glossary changes.".to_string());
    }
    parts.join(" ")
}
