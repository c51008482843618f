//! Eviction bookkeeping carried across scenes and snapshots.

use annotator_types::{EntryId, ThreadId};
use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Digest of a completed thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    /// Order in which the thread was processed.
    pub position: u32,
    pub summary_text: String,
    #[serde(default)]
    pub entries_created: Vec<EntryId>,
    #[serde(default)]
    pub entries_updated: Vec<EntryId>,
}

/// Digest of a run of scenes inside the in-progress thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub thread_id: ThreadId,
    pub position: u32,
    pub summary_text: String,
    #[serde(default)]
    pub entries_created: Vec<EntryId>,
    #[serde(default)]
    pub entries_updated: Vec<EntryId>,
    /// Negative for a forced partial chunk.
    pub chunk_index: i64,
    pub first_scene_index: u32,
    pub last_scene_index: u32,
}

/// A complete chunk not yet summarized: `(index, first_scene, last_scene)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChunk {
    pub index: i64,
    pub first_scene: u32,
    pub last_scene: u32,
}

/// Invariants:
/// - `completed_thread_ids` is a FIFO queue and never holds the in-progress thread.
/// - `summarized_chunk_indices` only grows within a thread and never repeats.
/// - `chunk_summaries` belong to the in-progress thread only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionState {
    #[serde(default)]
    pub(crate) cumulative_summary: String,
    #[serde(default)]
    pub(crate) thread_summaries: Vec<ThreadSummary>,
    #[serde(default)]
    pub(crate) chunk_summaries: Vec<ChunkSummary>,
    #[serde(default)]
    pub(crate) completed_thread_ids: Vec<ThreadId>,
    #[serde(default)]
    pub(crate) current_thread_id: Option<ThreadId>,
    #[serde(default)]
    pub(crate) current_scene_index: u32,
    #[serde(default)]
    pub(crate) summarized_chunk_indices: Vec<i64>,
}

impl CompactionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the cursor to `thread_id` and clear per-thread chunk bookkeeping.
    pub fn start_new_thread(&mut self, thread_id: ThreadId) {
        self.completed_thread_ids.retain(|id| *id != thread_id);
        self.current_thread_id = Some(thread_id);
        self.current_scene_index = 0;
        self.chunk_summaries.clear();
        self.summarized_chunk_indices.clear();
    }

    /// Queue the in-progress thread for eviction. The cursor is left in place
    /// until the next [`start_new_thread`](Self::start_new_thread).
    pub fn finish_current_thread(&mut self) {
        if let Some(id) = self.current_thread_id
            && !self.completed_thread_ids.contains(&id)
        {
            self.completed_thread_ids.push(id);
        }
    }

    pub fn advance_scene(&mut self) {
        self.current_scene_index += 1;
    }

    #[must_use]
    pub fn get_completed_chunk_count(&self, scenes_per_chunk: u32) -> u32 {
        self.current_scene_index
            .checked_div(scenes_per_chunk)
            .unwrap_or(0)
    }

    /// Complete chunks not yet summarized, oldest first.
    #[must_use]
    pub fn get_unsummarized_chunks(&self, scenes_per_chunk: u32) -> Vec<PendingChunk> {
        (0..self.get_completed_chunk_count(scenes_per_chunk))
            .filter(|i| !self.summarized_chunk_indices.contains(&i64::from(*i)))
            .map(|i| PendingChunk {
                index: i64::from(i),
                first_scene: i * scenes_per_chunk,
                last_scene: i * scenes_per_chunk + scenes_per_chunk - 1,
            })
            .collect()
    }

    pub(crate) fn record_chunk(&mut self, summary: ChunkSummary) {
        if !self.summarized_chunk_indices.contains(&summary.chunk_index) {
            self.summarized_chunk_indices.push(summary.chunk_index);
        }
        self.chunk_summaries.push(summary);
    }

    pub(crate) fn pop_oldest_completed(&mut self) -> Option<ThreadId> {
        if self.completed_thread_ids.is_empty() {
            None
        } else {
            Some(self.completed_thread_ids.remove(0))
        }
    }

    pub fn push_thread_summary(&mut self, summary: ThreadSummary) {
        self.thread_summaries.push(summary);
    }

    #[must_use]
    pub fn cumulative_summary(&self) -> &str {
        &self.cumulative_summary
    }

    #[must_use]
    pub fn thread_summaries(&self) -> &[ThreadSummary] {
        &self.thread_summaries
    }

    #[must_use]
    pub fn chunk_summaries(&self) -> &[ChunkSummary] {
        &self.chunk_summaries
    }

    #[must_use]
    pub fn completed_thread_ids(&self) -> &[ThreadId] {
        &self.completed_thread_ids
    }

    #[must_use]
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.current_thread_id
    }

    #[must_use]
    pub fn current_scene_index(&self) -> u32 {
        self.current_scene_index
    }

    #[must_use]
    pub fn summarized_chunk_indices(&self) -> &[i64] {
        &self.summarized_chunk_indices
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ContextError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ContextError> {
        Ok(serde_json::from_value(value)?)
    }
}
