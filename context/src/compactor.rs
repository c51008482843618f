//! Tiered context compaction.
//!
//! The conversation history in [`AnnotationContext`] is the only copy of the
//! transcript. Every tier edits that history (and [`CompactionState`]) in
//! place, and request messages are rebuilt from it after each step, so the
//! reduced transcript carries over to later scenes and to snapshots.
//!
//! Tiers, applied oldest content first and least lossy first:
//!
//! | Tier | Action | Runs when |
//! |------|--------|-----------|
//! | 0.5  | summarize the oldest complete chunk of the current thread | usage ≥ soft |
//! | 0.5b | summarize the first half of a long thread with no chunk yet | usage ≥ soft |
//! | 1    | summarize the oldest completed thread into the cumulative summary | ≥ 2 threads queued |
//! | 3    | strip `<thinking>` spans from older assistant turns | emergency only |
//! | 4    | truncate long older assistant turns | emergency only |

use std::sync::{Arc, OnceLock};

use annotator_providers::{AgentBackend, ChatRequest};
use annotator_types::{GlossaryEntry, Message, Role, Scene};
use regex::Regex;

use crate::annotation::{AnnotationContext, PromptFrame, in_chunk};
use crate::glossary::Glossary;
use crate::prompts::{CUMULATIVE_SUMMARY_PROMPT, MERGE_REQUEST};
use crate::state::{CompactionState, PendingChunk};
use crate::stats::{CompactionStats, Tier};
use crate::summarizer::{SUMMARY_TEMPERATURE, ThreadSummarizer};
use crate::token_counter::TokenCounter;

const MAX_ITERATIONS: usize = 20;
/// Thinking spans are kept in this many most recent history turns.
const THINKING_PRESERVE_RECENT: usize = 4;
/// Responses are never truncated in this many most recent history turns.
const TRUNCATE_PRESERVE_RECENT: usize = 8;
const TRUNCATE_MAX_CHARS: usize = 500;
pub const TRUNCATION_SUFFIX: &str = "... [truncated]";
/// Partial-chunk fallback needs at least this many scenes in the thread.
const PARTIAL_CHUNK_MIN_SCENES: u32 = 6;
const PARTIAL_CHUNK_MIN_HALF: u32 = 3;
const MERGE_MAX_TOKENS: u32 = 512;

fn thinking_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<thinking>.*?</thinking>").expect("valid thinking block regex")
    })
}

/// Thresholds as fractions of `budget`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactorConfig {
    pub budget: u64,
    /// Below this, `compact` does nothing.
    pub soft_ratio: f64,
    /// Above this, compaction is due.
    pub thread_compact_ratio: f64,
    /// Above this at call start, the lossy tiers unlock.
    pub emergency_ratio: f64,
    /// Compaction stops once usage is at or below this.
    pub target_ratio: f64,
    pub scenes_per_chunk: u32,
    pub preserve_recent_chunks: u32,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            budget: 98_304,
            soft_ratio: 0.60,
            thread_compact_ratio: 0.80,
            emergency_ratio: 0.90,
            target_ratio: 0.70,
            scenes_per_chunk: 7,
            preserve_recent_chunks: 2,
        }
    }
}

impl CompactorConfig {
    fn threshold(&self, ratio: f64) -> u64 {
        (self.budget as f64 * ratio) as u64
    }

    #[must_use]
    pub fn soft_threshold(&self) -> u64 {
        self.threshold(self.soft_ratio)
    }

    #[must_use]
    pub fn thread_compact_threshold(&self) -> u64 {
        self.threshold(self.thread_compact_ratio)
    }

    #[must_use]
    pub fn emergency_threshold(&self) -> u64 {
        self.threshold(self.emergency_ratio)
    }

    #[must_use]
    pub fn target(&self) -> u64 {
        self.threshold(self.target_ratio)
    }
}

/// Outcome of one [`ContextCompactor::compact`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub initial_tokens: u64,
    pub final_tokens: u64,
    pub chunks_summarized: u32,
    pub threads_summarized: u32,
    pub summaries_merged: u32,
    pub turns_trimmed: u32,
    pub responses_truncated: u32,
    /// Most lossy tier applied, `None` when nothing changed.
    pub highest_tier: Option<Tier>,
    pub target_reached: bool,
}

impl CompactionResult {
    fn reached(&mut self, tier: Tier) {
        self.highest_tier = Some(self.highest_tier.map_or(tier, |t| t.max(tier)));
    }
}

/// What the request needs besides history and state: the scene being
/// annotated, its glossary entries, and the glossary for summaries.
pub struct CompactionInput<'a> {
    pub scene: Option<&'a Scene>,
    pub relevant_entries: &'a [GlossaryEntry],
    pub glossary: &'a dyn Glossary,
}

pub struct ContextCompactor {
    config: CompactorConfig,
    counter: TokenCounter,
    summarizer: ThreadSummarizer,
    /// Agent used to fold thread summaries into the cumulative summary.
    merger: Option<Arc<dyn AgentBackend>>,
    stats: CompactionStats,
}

impl ContextCompactor {
    #[must_use]
    pub fn new(
        config: CompactorConfig,
        counter: TokenCounter,
        summarizer: ThreadSummarizer,
        merger: Option<Arc<dyn AgentBackend>>,
    ) -> Self {
        Self {
            config,
            counter,
            summarizer,
            merger,
            stats: CompactionStats::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut CompactionStats {
        &mut self.stats
    }

    /// Due at a thread boundary.
    #[must_use]
    pub fn should_compact_thread(&self, messages: &[Message]) -> bool {
        self.counter.count_messages(messages) > self.config.thread_compact_threshold()
    }

    #[must_use]
    pub fn should_emergency_compact(&self, messages: &[Message]) -> bool {
        let tokens = self.counter.count_messages(messages);
        let threshold = self.config.emergency_threshold();
        let emergency = tokens > threshold;
        if emergency {
            tracing::warn!(tokens, threshold, "Emergency compaction triggered");
        }
        emergency
    }

    /// Due before an agent call.
    #[must_use]
    pub fn should_compact(&self, messages: &[Message]) -> bool {
        self.should_compact_thread(messages)
    }

    /// `(tokens, percent of budget)`.
    #[must_use]
    pub fn current_usage(&self, messages: &[Message]) -> (u64, f64) {
        let tokens = self.counter.count_messages(messages);
        (tokens, self.percent(tokens))
    }

    fn percent(&self, tokens: u64) -> f64 {
        if self.config.budget == 0 {
            0.0
        } else {
            tokens as f64 / self.config.budget as f64 * 100.0
        }
    }

    fn measure(
        &self,
        context: &AnnotationContext,
        state: &CompactionState,
        input: &CompactionInput<'_>,
    ) -> u64 {
        let frame = PromptFrame::from_state(state, input.scene, input.relevant_entries);
        self.counter.count_messages(&context.build_messages(&frame))
    }

    /// Shrink `context` until the rebuilt request is at or below target, or
    /// no tier can make progress. Returns the rebuilt request messages.
    ///
    /// Never fails: non-convergence is reported through
    /// [`CompactionResult::target_reached`].
    pub async fn compact(
        &mut self,
        context: &mut AnnotationContext,
        state: &mut CompactionState,
        input: &CompactionInput<'_>,
    ) -> (Vec<Message>, CompactionResult) {
        let initial_tokens = self.measure(context, state, input);
        let mut result = CompactionResult {
            initial_tokens,
            final_tokens: initial_tokens,
            ..CompactionResult::default()
        };

        if initial_tokens < self.config.soft_threshold() {
            tracing::debug!(
                tokens = initial_tokens,
                percent = self.percent(initial_tokens),
                "Below soft threshold, skipping compaction"
            );
            result.target_reached = true;
            let frame = PromptFrame::from_state(state, input.scene, input.relevant_entries);
            return (context.build_messages(&frame), result);
        }

        let is_emergency = initial_tokens > self.config.emergency_threshold();
        let target = self.config.target();
        let mut current = initial_tokens;
        let mut previous = initial_tokens + 1;

        for _ in 0..MAX_ITERATIONS {
            if current <= target {
                break;
            }
            if current >= previous {
                tracing::warn!(tokens = current, "Compaction stalled without progress");
                break;
            }
            previous = current;

            if self.compact_chunk(context, state, input.glossary).await
                || self.compact_partial_chunk(context, state, input.glossary).await
            {
                result.chunks_summarized += 1;
                result.reached(Tier::Chunk);
                current = self.measure(context, state, input);
                if current < self.config.soft_threshold() {
                    break;
                }
                continue;
            }

            if state.completed_thread_ids.len() > 1 {
                self.evict_oldest_thread(context, state, input.glossary)
                    .await;
                result.threads_summarized += 1;
                result.summaries_merged += 1;
                result.reached(Tier::Thread);
                current = self.measure(context, state, input);
                if current < self.config.soft_threshold() {
                    break;
                }
                continue;
            }

            if !is_emergency {
                break;
            }

            let trimmed = trim_thinking(context.history_mut(), THINKING_PRESERVE_RECENT);
            if trimmed > 0 {
                tracing::info!(count = trimmed, "Tier 3: trimmed thinking blocks");
                result.turns_trimmed += trimmed;
                result.reached(Tier::ThinkingTrim);
                current = self.measure(context, state, input);
                continue;
            }

            let truncated = truncate_responses(
                context.history_mut(),
                TRUNCATE_PRESERVE_RECENT,
                TRUNCATE_MAX_CHARS,
            );
            if truncated > 0 {
                tracing::info!(count = truncated, "Tier 4: truncated old responses");
                result.responses_truncated += truncated;
                result.reached(Tier::Truncate);
                current = self.measure(context, state, input);
                continue;
            }

            tracing::warn!(tokens = current, target, "Compaction exhausted");
            break;
        }

        result.final_tokens = current;
        result.target_reached = current <= target;
        if let Some(tier) = result.highest_tier {
            self.stats
                .record_compaction(tier, initial_tokens, current);
        }
        let initial_percent = self.percent(initial_tokens);
        let final_percent = self.percent(current);
        tracing::info!(
            initial = initial_tokens,
            final_tokens = current,
            initial_percent,
            final_percent,
            tier = result.highest_tier.map_or(0.0, Tier::as_f32),
            target_reached = result.target_reached,
            "Compaction finished"
        );

        let frame = PromptFrame::from_state(state, input.scene, input.relevant_entries);
        (context.build_messages(&frame), result)
    }

    /// Tier 0.5: summarize the oldest complete chunk, keeping up to
    /// `preserve_recent_chunks` newest chunks verbatim when possible.
    async fn compact_chunk(
        &self,
        context: &mut AnnotationContext,
        state: &mut CompactionState,
        glossary: &dyn Glossary,
    ) -> bool {
        let Some(thread_id) = state.current_thread_id else {
            return false;
        };
        let spc = self.config.scenes_per_chunk;
        // Partial chunks carry negative indices and do not use up a complete chunk.
        let summarized_complete = state
            .summarized_chunk_indices
            .iter()
            .filter(|index| **index >= 0)
            .count() as i64;
        for preserve_n in (0..=self.config.preserve_recent_chunks).rev() {
            let completed = i64::from(state.get_completed_chunk_count(spc));
            let summarizable = completed - i64::from(preserve_n) - summarized_complete;
            if summarizable <= 0 {
                continue;
            }
            let Some(chunk) = state.get_unsummarized_chunks(spc).first().copied() else {
                continue;
            };
            tracing::info!(
                %thread_id,
                chunk_index = chunk.index,
                first_scene = chunk.first_scene,
                last_scene = chunk.last_scene,
                preserve_recent = preserve_n,
                "Tier 0.5: summarizing chunk"
            );
            self.summarize_chunk_turns(context, state, glossary, chunk)
                .await;
            return true;
        }
        false
    }

    /// Tier 0.5b: a long thread with no chunk summarized yet gets its first
    /// half summarized as a synthetic chunk with a negative index.
    async fn compact_partial_chunk(
        &self,
        context: &mut AnnotationContext,
        state: &mut CompactionState,
        glossary: &dyn Glossary,
    ) -> bool {
        let Some(thread_id) = state.current_thread_id else {
            return false;
        };
        if state.current_scene_index < PARTIAL_CHUNK_MIN_SCENES
            || !state.summarized_chunk_indices.is_empty()
        {
            return false;
        }
        let half = state.current_scene_index / 2;
        if half < PARTIAL_CHUNK_MIN_HALF {
            return false;
        }
        let chunk = PendingChunk {
            index: -1 - state.summarized_chunk_indices.len() as i64,
            first_scene: 0,
            last_scene: half - 1,
        };
        if !context
            .history()
            .iter()
            .any(|m| in_chunk(m, thread_id, chunk.first_scene, chunk.last_scene))
        {
            return false;
        }
        tracing::info!(
            %thread_id,
            last_scene = chunk.last_scene,
            "Tier 0.5b: forcing partial chunk"
        );
        self.summarize_chunk_turns(context, state, glossary, chunk)
            .await;
        true
    }

    async fn summarize_chunk_turns(
        &self,
        context: &mut AnnotationContext,
        state: &mut CompactionState,
        glossary: &dyn Glossary,
        chunk: PendingChunk,
    ) {
        let Some(thread_id) = state.current_thread_id else {
            return;
        };
        let excerpt: Vec<Message> = context
            .history()
            .iter()
            .filter(|m| in_chunk(m, thread_id, chunk.first_scene, chunk.last_scene))
            .cloned()
            .collect();
        let position = state.chunk_summaries.len() as u32;
        let summary = self
            .summarizer
            .summarize_chunk(glossary, thread_id, chunk, position, &excerpt)
            .await;
        state.record_chunk(summary);
        let removed = context.remove_chunk_turns(thread_id, chunk.first_scene, chunk.last_scene);
        tracing::debug!(
            %thread_id,
            chunk_index = chunk.index,
            removed,
            "Removed chunk turns"
        );
    }

    /// Tier 1: pop the oldest completed thread, fold its summary into the
    /// cumulative summary and drop its turns.
    async fn evict_oldest_thread(
        &self,
        context: &mut AnnotationContext,
        state: &mut CompactionState,
        glossary: &dyn Glossary,
    ) {
        let Some(thread_id) = state.pop_oldest_completed() else {
            return;
        };
        tracing::info!(
            %thread_id,
            remaining = state.completed_thread_ids.len(),
            "Tier 1: summarizing thread into cumulative summary"
        );
        let excerpt: Vec<Message> = context
            .history()
            .iter()
            .filter(|m| m.thread_id() == Some(thread_id))
            .cloned()
            .collect();
        let summary = self
            .summarizer
            .summarize_thread(glossary, thread_id, &excerpt)
            .await
            .into_thread_summary(0);
        let item = format!("Thread {}: {}", summary.thread_id, summary.summary_text);
        state.cumulative_summary = self
            .merge_into_cumulative(&state.cumulative_summary, &item)
            .await;
        let removed = context.remove_thread_turns(thread_id);
        tracing::debug!(%thread_id, removed, "Removed thread turns");
    }

    /// Agent-assisted merge; on any failure the new item is appended, so the
    /// cumulative summary never loses information.
    async fn merge_into_cumulative(&self, cumulative: &str, item: &str) -> String {
        if let Some(backend) = &self.merger {
            let prompt = CUMULATIVE_SUMMARY_PROMPT
                .replace("{cumulative}", if cumulative.is_empty() { "(none)" } else { cumulative })
                .replace("{summaries}", item);
            let request = ChatRequest::new(
                vec![Message::system(prompt), Message::user(MERGE_REQUEST)],
                MERGE_MAX_TOKENS,
                SUMMARY_TEMPERATURE,
            );
            match backend.chat(&request).await {
                Ok(reply) => {
                    let merged = reply.message.content().trim();
                    if !merged.is_empty() {
                        return merged.to_string();
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Agent merge failed, concatenating"),
            }
        }
        if cumulative.is_empty() {
            item.to_string()
        } else {
            format!("{cumulative}\n\n{item}")
        }
    }
}

/// Tier 3. Returns the number of turns changed.
fn trim_thinking(history: &mut [Message], preserve_recent: usize) -> u32 {
    let cutoff = history.len().saturating_sub(preserve_recent);
    let mut trimmed = 0;
    for msg in &mut history[..cutoff] {
        if msg.role() != Role::Assistant || !msg.content().to_lowercase().contains("<thinking>") {
            continue;
        }
        let stripped = thinking_pattern()
            .replace_all(msg.content(), "")
            .trim()
            .to_string();
        if stripped != msg.content() {
            msg.set_content(stripped);
            trimmed += 1;
        }
    }
    trimmed
}

/// Tier 4. Already-truncated turns are skipped so a second pass is a no-op.
fn truncate_responses(history: &mut [Message], preserve_recent: usize, max_chars: usize) -> u32 {
    let cutoff = history.len().saturating_sub(preserve_recent);
    let mut truncated = 0;
    for msg in &mut history[..cutoff] {
        if msg.role() != Role::Assistant || msg.content().ends_with(TRUNCATION_SUFFIX) {
            continue;
        }
        if msg.content().chars().count() > max_chars {
            let head: String = msg.content().chars().take(max_chars).collect();
            msg.set_content(format!("{head}{TRUNCATION_SUFFIX}"));
            truncated += 1;
        }
    }
    truncated
}
