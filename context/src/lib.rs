//! Bounded-memory annotation context with tiered compaction and resumable
//! SQLite checkpoints.
//!
//! # Architecture
//!
//! ```text
//! ContextCompactor
//! ├── counter: TokenCounter (remote tokenizer, sticky heuristic fallback)
//! ├── summarizer: ThreadSummarizer (agent digest, heuristic fallback)
//! └── stats: CompactionStats
//!
//! AnnotationContext   (system prompt + tagged history, the one transcript)
//! CompactionState     (cumulative summary, chunk bookkeeping, eviction queue)
//!
//! annotator.db
//! ├── GlossaryStore   (entries, tags, FTS5, revision log)
//! ├── SnapshotStore   (context + state + entry values, one transaction)
//! └── ProgressTracker (run and thread counters)
//! ```

mod annotation;
mod compactor;
mod error;
mod glossary;
mod progress;
mod prompts;
mod schema;
mod snapshot_store;
mod sqlite_util;
mod state;
mod stats;
mod summarizer;
mod summon;
mod token_counter;

#[cfg(test)]
mod testing;

pub use annotation::{AnnotationContext, PromptFrame};
pub use compactor::{
    CompactionInput, CompactionResult, CompactorConfig, ContextCompactor, TRUNCATION_SUFFIX,
};
pub use error::{ContextError, StorageError};
pub use glossary::{
    EntryUpdate, Glossary, GlossaryStore, NewEntry, Revision, ThreadField, normalize_term,
};
pub use progress::{ProgressTracker, RunState, RunUpdate, ThreadState, ThreadStatus, ThreadUpdate};
pub use prompts::ANNOTATOR_SYSTEM_PROMPT;
pub use schema::{SCHEMA_VERSION, connect, schema_version};
pub use snapshot_store::{
    NewSnapshot, Snapshot, SnapshotContext, SnapshotEntry, SnapshotStore, SnapshotType,
};
pub use state::{ChunkSummary, CompactionState, PendingChunk, ThreadSummary};
pub use stats::{CompactionStats, Tier};
pub use summarizer::{DEFAULT_SUMMARY_MAX_TOKENS, SummaryResult, ThreadSummarizer};
pub use summon::{EntryDrift, SummonSession};
pub use token_counter::{DEFAULT_CHARS_PER_TOKEN, MESSAGE_OVERHEAD, TOOL_CALL_OVERHEAD, TokenCounter};
