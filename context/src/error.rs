use annotator_types::{EntryId, SnapshotId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("term `{term}` already exists as entry {existing_id}")]
    DuplicateTerm { term: String, existing_id: EntryId },
    #[error("glossary entry {0} not found")]
    EntryNotFound(EntryId),
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),
    #[error("glossary is read-only while snapshot {snapshot_id} is summoned")]
    ReadOnly { snapshot_id: SnapshotId },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid snapshot type `{0}`")]
    InvalidSnapshotType(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("tool turns require a tool_call_id")]
    MissingToolCallId,
    #[error("system turns cannot be recorded in conversation history")]
    SystemTurn,
    #[error("failed to deserialize: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// `.db("op")` on rusqlite results, in the manner of `anyhow::Context`.
pub(crate) trait DbContext<T> {
    fn db(self, op: &'static str) -> Result<T, StorageError>;
}

impl<T> DbContext<T> for Result<T, rusqlite::Error> {
    fn db(self, op: &'static str) -> Result<T, StorageError> {
        self.map_err(|source| StorageError::Database { op, source })
    }
}
