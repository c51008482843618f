//! The conversation transcript and request assembly.

use annotator_types::{GlossaryEntry, Message, Role, Scene, ThreadId, TurnTags};
use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::state::{ChunkSummary, CompactionState, ThreadSummary};

const INSTRUCTIONS: &str =
    "<instructions>Emit glossary updates using tools as specified.</instructions>";

/// Everything besides the transcript that goes into one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptFrame<'a> {
    pub cumulative_summary: Option<&'a str>,
    pub thread_summaries: &'a [ThreadSummary],
    pub chunk_summaries: &'a [ChunkSummary],
    pub current_scene: Option<&'a Scene>,
    pub relevant_entries: &'a [GlossaryEntry],
}

impl<'a> PromptFrame<'a> {
    /// Summaries from `state`, plus the scene being annotated.
    #[must_use]
    pub fn from_state(
        state: &'a CompactionState,
        current_scene: Option<&'a Scene>,
        relevant_entries: &'a [GlossaryEntry],
    ) -> Self {
        Self {
            cumulative_summary: Some(state.cumulative_summary()),
            thread_summaries: state.thread_summaries(),
            chunk_summaries: state.chunk_summaries(),
            current_scene,
            relevant_entries,
        }
    }
}

/// System prompt plus the ordered, tagged conversation history.
///
/// History is append-only except for tagged removal during compaction.
/// Turns without the relevant tag always survive removal, and survivors keep
/// their relative order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationContext {
    system_prompt: String,
    #[serde(default)]
    conversation_history: Vec<Message>,
}

impl AnnotationContext {
    #[must_use]
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            conversation_history: Vec::new(),
        }
    }

    pub(crate) fn from_parts(system_prompt: String, conversation_history: Vec<Message>) -> Self {
        Self {
            system_prompt,
            conversation_history,
        }
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.conversation_history
    }

    pub(crate) fn history_mut(&mut self) -> &mut [Message] {
        &mut self.conversation_history
    }

    /// Request messages in order: system prompt, cumulative summary, thread
    /// summaries, chunk summaries, history verbatim, then the scene payload.
    #[must_use]
    pub fn build_messages(&self, frame: &PromptFrame<'_>) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.conversation_history.len() + 5);
        messages.push(Message::system(self.system_prompt.clone()));

        if let Some(summary) = frame.cumulative_summary
            && !summary.is_empty()
        {
            messages.push(Message::system(format!(
                "<cumulative_summary>{summary}</cumulative_summary>"
            )));
        }
        if !frame.thread_summaries.is_empty() {
            messages.push(Message::system(format_thread_summaries(
                frame.thread_summaries,
            )));
        }
        if !frame.chunk_summaries.is_empty() {
            messages.push(Message::system(format_chunk_summaries(
                frame.chunk_summaries,
            )));
        }

        messages.extend(self.conversation_history.iter().cloned());

        if let Some(scene) = frame.current_scene {
            messages.push(Message::user(format_user_payload(
                scene,
                frame.relevant_entries,
            )));
        }
        messages
    }

    /// Append a turn. `Tool` turns need `tool_call_id`; `System` turns are refused.
    pub fn record_turn(
        &mut self,
        role: Role,
        content: impl Into<String>,
        tool_call_id: Option<&str>,
        tags: TurnTags,
    ) -> Result<(), ContextError> {
        let content = content.into();
        let message = match role {
            Role::System => return Err(ContextError::SystemTurn),
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
            Role::Tool => {
                let id = tool_call_id.ok_or(ContextError::MissingToolCallId)?;
                Message::tool(id, content)
            }
        };
        self.conversation_history.push(message.tagged(tags));
        Ok(())
    }

    /// Append an already-built turn, e.g. an assistant reply carrying tool calls.
    pub fn record_message(&mut self, message: Message, tags: TurnTags) -> Result<(), ContextError> {
        if message.role() == Role::System {
            return Err(ContextError::SystemTurn);
        }
        self.conversation_history.push(message.tagged(tags));
        Ok(())
    }

    /// Remove every turn tagged with `thread_id`. Returns the number removed.
    pub fn remove_thread_turns(&mut self, thread_id: ThreadId) -> usize {
        let before = self.conversation_history.len();
        self.conversation_history
            .retain(|m| m.thread_id() != Some(thread_id));
        before - self.conversation_history.len()
    }

    /// Remove turns of `thread_id` whose scene index lies in
    /// `first_scene..=last_scene`. Turns without a scene index are kept.
    pub fn remove_chunk_turns(
        &mut self,
        thread_id: ThreadId,
        first_scene: u32,
        last_scene: u32,
    ) -> usize {
        let before = self.conversation_history.len();
        self.conversation_history
            .retain(|m| !in_chunk(m, thread_id, first_scene, last_scene));
        before - self.conversation_history.len()
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ContextError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ContextError> {
        Ok(serde_json::from_value(value)?)
    }
}

pub(crate) fn in_chunk(message: &Message, thread_id: ThreadId, first: u32, last: u32) -> bool {
    message.thread_id() == Some(thread_id)
        && message
            .scene_index()
            .is_some_and(|scene| (first..=last).contains(&scene))
}

fn attr(value: &str) -> String {
    value.replace('"', "&quot;")
}

fn format_thread_summaries(summaries: &[ThreadSummary]) -> String {
    let mut lines = vec!["<thread_summaries>".to_string()];
    for summary in summaries {
        let ids: Vec<String> = summary
            .entries_created
            .iter()
            .chain(&summary.entries_updated)
            .map(ToString::to_string)
            .collect();
        let entries_attr = if ids.is_empty() {
            String::new()
        } else {
            format!(" entries=\"{}\"", ids.join(","))
        };
        lines.push(format!(
            "<thread id=\"{}\" position=\"{}\"{entries_attr}>{}</thread>",
            summary.thread_id, summary.position, summary.summary_text
        ));
    }
    lines.push("</thread_summaries>".to_string());
    lines.join("\n")
}

fn format_chunk_summaries(summaries: &[ChunkSummary]) -> String {
    let mut lines = vec!["<chunk_summaries>".to_string()];
    for summary in summaries {
        lines.push(format!(
            "<chunk thread=\"{}\" index=\"{}\" scenes=\"{}-{}\">{}</chunk>",
            summary.thread_id,
            summary.chunk_index,
            summary.first_scene_index,
            summary.last_scene_index,
            summary.summary_text
        ));
    }
    lines.push("</chunk_summaries>".to_string());
    lines.join("\n")
}

fn format_user_payload(scene: &Scene, entries: &[GlossaryEntry]) -> String {
    let mut lines = vec!["<story_passages>".to_string()];
    for post in &scene.posts {
        let mut meta = vec![format!("id=\"{}\"", post.post_id)];
        if let Some(ts) = &post.created_at {
            meta.push(format!("ts=\"{}\"", attr(ts)));
        }
        if let Some(author) = &post.author {
            meta.push(format!("author=\"{}\"", attr(author)));
        }
        let body = post.body.as_deref().unwrap_or_default().trim();
        lines.push(format!("<post {}>{body}</post>", meta.join(" ")));
    }
    lines.push("</story_passages>".to_string());

    if !entries.is_empty() {
        lines.push("<known_glossary>".to_string());
        for entry in entries {
            let tags_attr = if entry.tags.is_empty() {
                String::new()
            } else {
                format!(" tags=\"{}\"", attr(&entry.tags.join(",")))
            };
            lines.push(format!(
                "<term name=\"{}\"{tags_attr}>{}</term>",
                attr(&entry.term),
                entry.definition
            ));
        }
        lines.push("</known_glossary>".to_string());
    }

    lines.push(INSTRUCTIONS.to_string());
    lines.join("\n")
}
