//! Point-in-time checkpoints of context, compaction state and glossary values.
//!
//! A snapshot is three row groups written in one transaction: the header,
//! the serialized context and state, and one row per glossary entry holding
//! its definition and status *by value*. Restoring is the exact inverse of
//! [`SnapshotStore::create`], so a resumed run continues as if it never
//! stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use annotator_types::{EntryId, EntryStatus, Message, PostId, SnapshotId, ThreadId};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::annotation::AnnotationContext;
use crate::error::{DbContext, StorageError};
use crate::glossary::Glossary;
use crate::schema;
use crate::sqlite_util::utc_now;
use crate::state::{CompactionState, ThreadSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Checkpoint,
    CuratorFork,
    Manual,
}

impl SnapshotType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SnapshotType::Checkpoint => "checkpoint",
            SnapshotType::CuratorFork => "curator_fork",
            SnapshotType::Manual => "manual",
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SnapshotType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoint" => Ok(SnapshotType::Checkpoint),
            "curator_fork" => Ok(SnapshotType::CuratorFork),
            "manual" => Ok(SnapshotType::Manual),
            other => Err(StorageError::InvalidSnapshotType(other.to_string())),
        }
    }
}

/// Snapshot header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub snapshot_type: SnapshotType,
    pub created_at: String,
    pub last_post_id: PostId,
    pub last_thread_id: ThreadId,
    pub thread_position: u32,
    pub entry_count: u64,
    pub token_count: Option<u64>,
    pub metadata: Option<serde_json::Value>,
}

/// Header fields supplied by the caller of [`SnapshotStore::create`].
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub snapshot_type: SnapshotType,
    pub last_post_id: PostId,
    pub last_thread_id: ThreadId,
    pub thread_position: u32,
    pub token_count: Option<u64>,
    pub metadata: Option<serde_json::Value>,
}

impl NewSnapshot {
    #[must_use]
    pub fn new(
        snapshot_type: SnapshotType,
        last_post_id: PostId,
        last_thread_id: ThreadId,
        thread_position: u32,
    ) -> Self {
        Self {
            snapshot_type,
            last_post_id,
            last_thread_id,
            thread_position,
            token_count: None,
            metadata: None,
        }
    }
}

/// Serialized context row of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotContext {
    pub snapshot_id: SnapshotId,
    pub system_prompt: String,
    pub cumulative_summary: Option<String>,
    pub thread_summaries: Vec<ThreadSummary>,
    pub conversation_history: Vec<Message>,
    pub current_thread_id: Option<ThreadId>,
    pub completed_thread_ids: Vec<ThreadId>,
    /// Full state; `None` on rows written before it was stored.
    pub compaction_state: Option<CompactionState>,
}

/// One glossary entry's value when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub snapshot_id: SnapshotId,
    pub entry_id: EntryId,
    pub definition_at_snapshot: String,
    pub status_at_snapshot: EntryStatus,
}

const SNAPSHOT_COLUMNS: &str = "id, snapshot_type, created_at, last_post_id, last_thread_id, \
     thread_position, entry_count, token_count, metadata_json";

pub struct SnapshotStore {
    db: Connection,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: schema::connect(path.as_ref())?,
        })
    }

    /// Capture header, context, state and every glossary entry atomically.
    pub fn create(
        &mut self,
        header: &NewSnapshot,
        context: &AnnotationContext,
        state: &CompactionState,
        glossary: &dyn Glossary,
    ) -> Result<SnapshotId, StorageError> {
        let entries = glossary.all_entries()?;
        let metadata_json = header
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let thread_summaries_json = serde_json::to_string(state.thread_summaries())?;
        let history_json = serde_json::to_string(context.history())?;
        let completed_json = serde_json::to_string(state.completed_thread_ids())?;
        let state_json = serde_json::to_string(state)?;
        let cumulative = Some(state.cumulative_summary()).filter(|s| !s.is_empty());

        let tx = self.db.transaction().db("start snapshot transaction")?;
        tx.execute(
            "INSERT INTO snapshot (
                snapshot_type, created_at, last_post_id, last_thread_id,
                thread_position, entry_count, token_count, metadata_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                header.snapshot_type.as_str(),
                utc_now(),
                header.last_post_id.value(),
                header.last_thread_id.value(),
                header.thread_position,
                entries.len() as i64,
                header.token_count.map(|t| t as i64),
                metadata_json,
            ],
        )
        .db("insert snapshot")?;
        let id = SnapshotId::new(tx.last_insert_rowid());

        tx.execute(
            "INSERT INTO snapshot_context (
                snapshot_id, system_prompt, cumulative_summary, thread_summaries_json,
                conversation_history_json, current_thread_id, completed_thread_ids_json,
                compaction_state_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.value(),
                context.system_prompt(),
                cumulative,
                thread_summaries_json,
                history_json,
                state.current_thread_id().map(ThreadId::value),
                completed_json,
                state_json,
            ],
        )
        .db("insert snapshot context")?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO snapshot_entry (
                        snapshot_id, entry_id, definition_at_snapshot, status_at_snapshot
                    ) VALUES (?1, ?2, ?3, ?4)",
                )
                .db("prepare snapshot entry insert")?;
            for entry in &entries {
                stmt.execute(params![
                    id.value(),
                    entry.id.value(),
                    entry.definition,
                    entry.status.as_str(),
                ])
                .db("insert snapshot entry")?;
            }
        }

        tx.commit().db("commit snapshot")?;
        tracing::info!(
            %id,
            snapshot_type = %header.snapshot_type,
            last_post_id = %header.last_post_id,
            entries = entries.len(),
            turns = context.history().len(),
            "Created snapshot"
        );
        Ok(id)
    }

    pub fn get(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        let row = self
            .db
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshot WHERE id = ?1"),
                params![id.value()],
                SnapshotRow::from_row,
            )
            .optional()
            .db("get snapshot")?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    pub fn get_context(&self, id: SnapshotId) -> Result<Option<SnapshotContext>, StorageError> {
        let row = self
            .db
            .query_row(
                "SELECT system_prompt, cumulative_summary, thread_summaries_json,
                        conversation_history_json, current_thread_id,
                        completed_thread_ids_json, compaction_state_json
                 FROM snapshot_context WHERE snapshot_id = ?1",
                params![id.value()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .db("get snapshot context")?;
        let Some((prompt, cumulative, summaries, history, current, completed, state)) = row
        else {
            return Ok(None);
        };
        Ok(Some(SnapshotContext {
            snapshot_id: id,
            system_prompt: prompt,
            cumulative_summary: cumulative,
            thread_summaries: serde_json::from_str(&summaries)?,
            conversation_history: serde_json::from_str(&history)?,
            current_thread_id: current.map(ThreadId::new),
            completed_thread_ids: serde_json::from_str(completed.as_deref().unwrap_or("[]"))?,
            compaction_state: state.as_deref().map(serde_json::from_str).transpose()?,
        }))
    }

    /// Captured entry values, ordered by entry id.
    pub fn get_entries(&self, id: SnapshotId) -> Result<Vec<SnapshotEntry>, StorageError> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT entry_id, definition_at_snapshot, status_at_snapshot
                 FROM snapshot_entry WHERE snapshot_id = ?1 ORDER BY entry_id",
            )
            .db("prepare snapshot entries")?;
        let rows = stmt
            .query_map(params![id.value()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .db("query snapshot entries")?
            .collect::<Result<Vec<_>, _>>()
            .db("read snapshot entries")?;
        rows.into_iter()
            .map(|(entry_id, definition, status)| {
                Ok(SnapshotEntry {
                    snapshot_id: id,
                    entry_id: EntryId::new(entry_id),
                    definition_at_snapshot: definition,
                    status_at_snapshot: status
                        .parse::<EntryStatus>()
                        .map_err(|e| StorageError::Corrupt(e.to_string()))?,
                })
            })
            .collect()
    }

    /// Newest first, optionally filtered by type.
    pub fn list_recent(
        &self,
        limit: usize,
        snapshot_type: Option<SnapshotType>,
    ) -> Result<Vec<Snapshot>, StorageError> {
        match snapshot_type {
            Some(kind) => self.query_snapshots(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshot WHERE snapshot_type = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ),
                params![kind.as_str(), limit as i64],
            ),
            None => self.query_snapshots(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshot
                     ORDER BY created_at DESC, id DESC LIMIT ?1"
                ),
                params![limit as i64],
            ),
        }
    }

    /// Snapshots whose last processed thread is `thread_id`, newest first.
    pub fn list_by_thread(&self, thread_id: ThreadId) -> Result<Vec<Snapshot>, StorageError> {
        self.query_snapshots(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshot WHERE last_thread_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ),
            params![thread_id.value()],
        )
    }

    pub fn latest(
        &self,
        snapshot_type: Option<SnapshotType>,
    ) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.list_recent(1, snapshot_type)?.into_iter().next())
    }

    /// Rebuild the context and compaction state captured by `create`.
    pub fn restore_context(
        &self,
        id: SnapshotId,
    ) -> Result<(AnnotationContext, CompactionState), StorageError> {
        let stored = self
            .get_context(id)?
            .ok_or(StorageError::SnapshotNotFound(id))?;
        let context =
            AnnotationContext::from_parts(stored.system_prompt, stored.conversation_history);
        let state = match stored.compaction_state {
            Some(state) => state,
            None => {
                tracing::debug!(%id, "Snapshot has no full compaction state, using columns");
                CompactionState {
                    cumulative_summary: stored.cumulative_summary.unwrap_or_default(),
                    thread_summaries: stored.thread_summaries,
                    completed_thread_ids: stored.completed_thread_ids,
                    current_thread_id: stored.current_thread_id,
                    ..CompactionState::default()
                }
            }
        };
        tracing::info!(
            %id,
            turns = context.history().len(),
            completed_threads = state.completed_thread_ids().len(),
            "Restored context from snapshot"
        );
        Ok((context, state))
    }

    /// Captured entries keyed by id, for point-in-time lookups.
    pub fn restore_entries_view(
        &self,
        id: SnapshotId,
    ) -> Result<BTreeMap<EntryId, SnapshotEntry>, StorageError> {
        Ok(self
            .get_entries(id)?
            .into_iter()
            .map(|e| (e.entry_id, e))
            .collect())
    }

    /// Delete a snapshot with its context and entry rows. Returns `false`
    /// when it did not exist.
    pub fn delete(&mut self, id: SnapshotId) -> Result<bool, StorageError> {
        let deleted = self
            .db
            .execute("DELETE FROM snapshot WHERE id = ?1", params![id.value()])
            .db("delete snapshot")?;
        if deleted > 0 {
            tracing::info!(%id, "Deleted snapshot");
        }
        Ok(deleted > 0)
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM snapshot", [], |row| row.get(0))
            .db("count snapshots")?;
        Ok(n as u64)
    }

    pub fn count_by_type(&self) -> Result<BTreeMap<SnapshotType, u64>, StorageError> {
        let mut stmt = self
            .db
            .prepare("SELECT snapshot_type, COUNT(*) FROM snapshot GROUP BY snapshot_type")
            .db("prepare snapshot type counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .db("count snapshots by type")?
            .collect::<Result<Vec<_>, _>>()
            .db("read snapshot type counts")?;
        rows.into_iter()
            .map(|(kind, n)| Ok((kind.parse()?, n as u64)))
            .collect()
    }

    fn query_snapshots(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Snapshot>, StorageError> {
        let mut stmt = self.db.prepare(sql).db("prepare snapshot query")?;
        let rows = stmt
            .query_map(params, SnapshotRow::from_row)
            .db("query snapshots")?
            .collect::<Result<Vec<_>, _>>()
            .db("read snapshots")?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }
}

struct SnapshotRow {
    id: i64,
    snapshot_type: String,
    created_at: String,
    last_post_id: i64,
    last_thread_id: i64,
    thread_position: u32,
    entry_count: i64,
    token_count: Option<i64>,
    metadata_json: Option<String>,
}

impl SnapshotRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            snapshot_type: row.get(1)?,
            created_at: row.get(2)?,
            last_post_id: row.get(3)?,
            last_thread_id: row.get(4)?,
            thread_position: row.get(5)?,
            entry_count: row.get(6)?,
            token_count: row.get(7)?,
            metadata_json: row.get(8)?,
        })
    }

    fn into_snapshot(self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot {
            id: SnapshotId::new(self.id),
            snapshot_type: self.snapshot_type.parse()?,
            created_at: self.created_at,
            last_post_id: PostId::new(self.last_post_id),
            last_thread_id: ThreadId::new(self.last_thread_id),
            thread_position: self.thread_position,
            entry_count: self.entry_count as u64,
            token_count: self.token_count.map(|t| t as u64),
            metadata: self
                .metadata_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use annotator_types::{
        EntryStatus, Message, PostId, Role, SnapshotId, ThreadId, ToolCall, TurnTags,
    };
    use rusqlite::params;
    use serde_json::json;

    use super::{NewSnapshot, SnapshotStore, SnapshotType};
    use crate::annotation::AnnotationContext;
    use crate::error::StorageError;
    use crate::glossary::{EntryUpdate, GlossaryStore, NewEntry};
    use crate::state::{ChunkSummary, CompactionState, ThreadSummary};

    struct Fixture {
        _dir: tempfile::TempDir,
        snapshots: SnapshotStore,
        glossary: GlossaryStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotator.db");
        let glossary = GlossaryStore::open(&path).unwrap();
        let snapshots = SnapshotStore::open(&path).unwrap();
        Fixture {
            _dir: dir,
            snapshots,
            glossary,
        }
    }

    fn add_entry(glossary: &mut GlossaryStore, term: &str) -> annotator_types::EntryId {
        glossary
            .create(&NewEntry {
                term: term.into(),
                definition: format!("{term} as first seen."),
                tags: vec!["place".into()],
                status: EntryStatus::Tentative,
                post_id: PostId::new(10),
                thread_id: ThreadId::new(1),
            })
            .unwrap()
    }

    fn populated() -> (AnnotationContext, CompactionState) {
        let mut ctx = AnnotationContext::new("You annotate.");
        let tags = TurnTags::new(ThreadId::new(2), 8);
        ctx.record_turn(Role::User, "scene eight", None, tags).unwrap();
        ctx.record_message(
            Message::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "glossary_search".into(),
                    arguments: r#"{"query":"wyrm"}"#.into(),
                }],
            ),
            tags,
        )
        .unwrap();
        ctx.record_turn(Role::Tool, "[]", Some("call_1"), tags).unwrap();
        ctx.record_turn(Role::User, "untagged note", None, TurnTags::default())
            .unwrap();

        let mut state = CompactionState::new();
        state.cumulative_summary = "Thread 1 happened.".into();
        state.push_thread_summary(ThreadSummary {
            thread_id: ThreadId::new(1),
            position: 0,
            summary_text: "Thread one.".into(),
            entries_created: vec![annotator_types::EntryId::new(1)],
            entries_updated: vec![],
        });
        state.completed_thread_ids = vec![ThreadId::new(1)];
        state.start_new_thread(ThreadId::new(2));
        for _ in 0..9 {
            state.advance_scene();
        }
        state.record_chunk(ChunkSummary {
            thread_id: ThreadId::new(2),
            position: 0,
            summary_text: "Scenes 0-6.".into(),
            entries_created: vec![],
            entries_updated: vec![],
            chunk_index: 0,
            first_scene_index: 0,
            last_scene_index: 6,
        });
        (ctx, state)
    }

    fn checkpoint(post: i64, thread: i64) -> NewSnapshot {
        NewSnapshot::new(
            SnapshotType::Checkpoint,
            PostId::new(post),
            ThreadId::new(thread),
            0,
        )
    }

    #[test]
    fn snapshot_type_strings() {
        for kind in [
            SnapshotType::Checkpoint,
            SnapshotType::CuratorFork,
            SnapshotType::Manual,
        ] {
            assert_eq!(kind.as_str().parse::<SnapshotType>().unwrap(), kind);
        }
        assert!(matches!(
            "fork".parse::<SnapshotType>(),
            Err(StorageError::InvalidSnapshotType(_))
        ));
    }

    #[test]
    fn restore_is_exact_inverse_of_create() {
        let mut f = fixture();
        add_entry(&mut f.glossary, "Wyrm");
        let (ctx, state) = populated();

        let mut header = checkpoint(250, 2);
        header.thread_position = 1;
        header.token_count = Some(4321);
        header.metadata = Some(json!({"reason": "interval"}));
        let id = f
            .snapshots
            .create(&header, &ctx, &state, &f.glossary)
            .unwrap();

        let (restored_ctx, restored_state) = f.snapshots.restore_context(id).unwrap();
        assert_eq!(restored_ctx, ctx);
        assert_eq!(restored_state, state);
        assert_eq!(restored_state.current_scene_index(), 9);
        assert_eq!(restored_state.summarized_chunk_indices(), &[0]);

        let snapshot = f.snapshots.get(id).unwrap().unwrap();
        assert_eq!(snapshot.snapshot_type, SnapshotType::Checkpoint);
        assert_eq!(snapshot.last_post_id, PostId::new(250));
        assert_eq!(snapshot.thread_position, 1);
        assert_eq!(snapshot.entry_count, 1);
        assert_eq!(snapshot.token_count, Some(4321));
        assert_eq!(snapshot.metadata, Some(json!({"reason": "interval"})));

        let stored = f.snapshots.get_context(id).unwrap().unwrap();
        assert_eq!(stored.cumulative_summary.as_deref(), Some("Thread 1 happened."));
        assert_eq!(stored.current_thread_id, Some(ThreadId::new(2)));
        assert_eq!(stored.completed_thread_ids, vec![ThreadId::new(1)]);
    }

    #[test]
    fn legacy_rows_restore_from_columns() {
        let mut f = fixture();
        let (ctx, state) = populated();
        let id = f
            .snapshots
            .create(&checkpoint(1, 2), &ctx, &state, &f.glossary)
            .unwrap();
        f.snapshots
            .db
            .execute(
                "UPDATE snapshot_context SET compaction_state_json = NULL WHERE snapshot_id = ?1",
                params![id.value()],
            )
            .unwrap();

        let (_, restored) = f.snapshots.restore_context(id).unwrap();
        assert_eq!(restored.cumulative_summary(), "Thread 1 happened.");
        assert_eq!(restored.thread_summaries(), state.thread_summaries());
        assert_eq!(restored.completed_thread_ids(), &[ThreadId::new(1)]);
        assert_eq!(restored.current_thread_id(), Some(ThreadId::new(2)));
        assert!(restored.chunk_summaries().is_empty());
    }

    #[test]
    fn entries_are_captured_by_value() {
        let mut f = fixture();
        let kept = add_entry(&mut f.glossary, "Wyrm");
        let doomed = add_entry(&mut f.glossary, "Old Road");
        let (ctx, state) = populated();
        let id = f
            .snapshots
            .create(&checkpoint(10, 1), &ctx, &state, &f.glossary)
            .unwrap();

        let mut update = EntryUpdate::at(PostId::new(11), ThreadId::new(1));
        update.definition = Some("Rewritten.".into());
        update.status = Some(EntryStatus::Confirmed);
        assert!(f.glossary.update(kept, &update).unwrap());
        f.glossary.delete(doomed, "merged", None).unwrap();

        let view = f.snapshots.restore_entries_view(id).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[&kept].definition_at_snapshot, "Wyrm as first seen.");
        assert_eq!(view[&kept].status_at_snapshot, EntryStatus::Tentative);
        assert_eq!(view[&doomed].definition_at_snapshot, "Old Road as first seen.");
    }

    #[test]
    fn delete_cascades() {
        let mut f = fixture();
        add_entry(&mut f.glossary, "Wyrm");
        let (ctx, state) = populated();
        let id = f
            .snapshots
            .create(&checkpoint(10, 1), &ctx, &state, &f.glossary)
            .unwrap();

        assert!(f.snapshots.delete(id).unwrap());
        assert!(f.snapshots.get(id).unwrap().is_none());
        assert!(f.snapshots.get_context(id).unwrap().is_none());
        assert!(f.snapshots.get_entries(id).unwrap().is_empty());
        assert!(!f.snapshots.delete(id).unwrap());
        assert!(matches!(
            f.snapshots.restore_context(id),
            Err(StorageError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn listing_is_newest_first_and_filterable() {
        let mut f = fixture();
        let ctx = AnnotationContext::new("sys");
        let state = CompactionState::new();
        let first = f
            .snapshots
            .create(&checkpoint(1, 1), &ctx, &state, &f.glossary)
            .unwrap();
        let mut manual = checkpoint(2, 1);
        manual.snapshot_type = SnapshotType::Manual;
        let second = f.snapshots.create(&manual, &ctx, &state, &f.glossary).unwrap();
        let third = f
            .snapshots
            .create(&checkpoint(3, 2), &ctx, &state, &f.glossary)
            .unwrap();

        let ids: Vec<SnapshotId> = f
            .snapshots
            .list_recent(10, None)
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![third, second, first]);

        let checkpoints = f
            .snapshots
            .list_recent(10, Some(SnapshotType::Checkpoint))
            .unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(f.snapshots.list_recent(1, None).unwrap()[0].id, third);
        assert_eq!(
            f.snapshots
                .latest(Some(SnapshotType::Checkpoint))
                .unwrap()
                .unwrap()
                .id,
            third
        );

        let by_thread = f.snapshots.list_by_thread(ThreadId::new(1)).unwrap();
        assert_eq!(by_thread.len(), 2);

        assert_eq!(f.snapshots.count().unwrap(), 3);
        let counts = f.snapshots.count_by_type().unwrap();
        assert_eq!(counts[&SnapshotType::Checkpoint], 2);
        assert_eq!(counts[&SnapshotType::Manual], 1);
        assert!(!counts.contains_key(&SnapshotType::CuratorFork));
    }

    #[test]
    fn failed_create_leaves_nothing_behind() {
        let mut f = fixture();
        add_entry(&mut f.glossary, "Wyrm");
        f.snapshots
            .db
            .execute_batch(
                "CREATE TRIGGER reject_entries BEFORE INSERT ON snapshot_entry
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let (ctx, state) = populated();
        let err = f
            .snapshots
            .create(&checkpoint(10, 1), &ctx, &state, &f.glossary)
            .unwrap_err();
        assert!(matches!(err, StorageError::Database { .. }));
        assert_eq!(f.snapshots.count().unwrap(), 0);
        let contexts: i64 = f
            .snapshots
            .db
            .query_row("SELECT COUNT(*) FROM snapshot_context", [], |row| row.get(0))
            .unwrap();
        assert_eq!(contexts, 0);
    }
}
