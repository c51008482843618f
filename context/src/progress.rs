//! Run and per-thread progress counters.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use annotator_types::{PostId, SnapshotId, ThreadId};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;

use crate::error::{DbContext, StorageError};
use crate::schema;
use crate::sqlite_util::utc_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Pending,
    InProgress,
    Completed,
}

impl ThreadStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Pending => "pending",
            ThreadStatus::InProgress => "in_progress",
            ThreadStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ThreadStatus::Pending),
            "in_progress" => Ok(ThreadStatus::InProgress),
            "completed" => Ok(ThreadStatus::Completed),
            other => Err(StorageError::Corrupt(format!("unknown thread status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub last_post_id: Option<PostId>,
    pub last_thread_id: Option<ThreadId>,
    pub current_snapshot_id: Option<SnapshotId>,
    pub run_started_at: Option<String>,
    pub run_updated_at: Option<String>,
    pub total_posts_processed: u64,
    pub total_entries_created: u64,
    pub total_entries_updated: u64,
}

/// Cursor moves and counter deltas for [`ProgressTracker::update`].
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub last_post_id: Option<PostId>,
    pub last_thread_id: Option<ThreadId>,
    pub current_snapshot_id: Option<SnapshotId>,
    pub posts_processed_delta: u64,
    pub entries_created_delta: u64,
    pub entries_updated_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadState {
    pub thread_id: ThreadId,
    pub status: ThreadStatus,
    pub summary: Option<String>,
    pub posts_processed: u64,
    pub entries_created: u64,
    pub entries_updated: u64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadUpdate {
    pub status: Option<ThreadStatus>,
    pub summary: Option<String>,
    pub posts_processed_delta: u64,
    pub entries_created_delta: u64,
    pub entries_updated_delta: u64,
}

impl ThreadUpdate {
    #[must_use]
    pub fn status(status: ThreadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

const THREAD_COLUMNS: &str = "thread_id, status, summary, posts_processed, entries_created, \
     entries_updated, started_at, completed_at";

pub struct ProgressTracker {
    db: Connection,
}

impl ProgressTracker {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: schema::connect(path.as_ref())?,
        })
    }

    pub fn get_state(&self) -> Result<RunState, StorageError> {
        self.db
            .query_row(
                "SELECT last_post_id, last_thread_id, current_snapshot_id, run_started_at,
                        run_updated_at, total_posts_processed, total_entries_created,
                        total_entries_updated
                 FROM run_state WHERE id = 1",
                [],
                |row| {
                    Ok(RunState {
                        last_post_id: row.get::<_, Option<i64>>(0)?.map(PostId::new),
                        last_thread_id: row.get::<_, Option<i64>>(1)?.map(ThreadId::new),
                        current_snapshot_id: row.get::<_, Option<i64>>(2)?.map(SnapshotId::new),
                        run_started_at: row.get(3)?,
                        run_updated_at: row.get(4)?,
                        total_posts_processed: row.get::<_, i64>(5)? as u64,
                        total_entries_created: row.get::<_, i64>(6)? as u64,
                        total_entries_updated: row.get::<_, i64>(7)? as u64,
                    })
                },
            )
            .db("read run state")
    }

    pub fn start_run(&mut self) -> Result<(), StorageError> {
        let now = utc_now();
        self.db
            .execute(
                "UPDATE run_state SET run_started_at = ?1, run_updated_at = ?1 WHERE id = 1",
                params![now],
            )
            .db("start run")?;
        Ok(())
    }

    /// Move cursors that are `Some` and add the deltas to the totals.
    pub fn update(&mut self, update: &RunUpdate) -> Result<(), StorageError> {
        let mut sets = vec!["run_updated_at = ?"];
        let mut values = vec![Value::Text(utc_now())];
        if let Some(post) = update.last_post_id {
            sets.push("last_post_id = ?");
            values.push(Value::Integer(post.value()));
        }
        if let Some(thread) = update.last_thread_id {
            sets.push("last_thread_id = ?");
            values.push(Value::Integer(thread.value()));
        }
        if let Some(snapshot) = update.current_snapshot_id {
            sets.push("current_snapshot_id = ?");
            values.push(Value::Integer(snapshot.value()));
        }
        for (column, delta) in [
            ("total_posts_processed = total_posts_processed + ?", update.posts_processed_delta),
            ("total_entries_created = total_entries_created + ?", update.entries_created_delta),
            ("total_entries_updated = total_entries_updated + ?", update.entries_updated_delta),
        ] {
            if delta != 0 {
                sets.push(column);
                values.push(Value::Integer(delta as i64));
            }
        }
        self.db
            .execute(
                &format!("UPDATE run_state SET {} WHERE id = 1", sets.join(", ")),
                params_from_iter(values),
            )
            .db("update run state")?;
        Ok(())
    }

    pub fn get_thread_state(&self, thread_id: ThreadId) -> Result<Option<ThreadState>, StorageError> {
        let row = self
            .db
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM thread_state WHERE thread_id = ?1"),
                params![thread_id.value()],
                ThreadRow::from_row,
            )
            .optional()
            .db("read thread state")?;
        row.map(ThreadRow::into_state).transpose()
    }

    /// Insert or update a thread's row. `started_at` is stamped on the first
    /// move to in-progress, `completed_at` on every move to completed.
    pub fn update_thread_state(
        &mut self,
        thread_id: ThreadId,
        update: &ThreadUpdate,
    ) -> Result<(), StorageError> {
        let now = utc_now();
        let Some(existing) = self.get_thread_state(thread_id)? else {
            let status = update.status.unwrap_or(ThreadStatus::Pending);
            let started = (status == ThreadStatus::InProgress).then(|| now.clone());
            let completed = (status == ThreadStatus::Completed).then_some(now);
            self.db
                .execute(
                    "INSERT INTO thread_state (
                        thread_id, status, summary, posts_processed, entries_created,
                        entries_updated, started_at, completed_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        thread_id.value(),
                        status.as_str(),
                        update.summary,
                        update.posts_processed_delta as i64,
                        update.entries_created_delta as i64,
                        update.entries_updated_delta as i64,
                        started,
                        completed,
                    ],
                )
                .db("insert thread state")?;
            return Ok(());
        };

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
            if status == ThreadStatus::InProgress && existing.started_at.is_none() {
                sets.push("started_at = ?");
                values.push(Value::Text(now.clone()));
            } else if status == ThreadStatus::Completed {
                sets.push("completed_at = ?");
                values.push(Value::Text(now.clone()));
            }
        }
        if let Some(summary) = &update.summary {
            sets.push("summary = ?");
            values.push(Value::Text(summary.clone()));
        }
        for (column, delta) in [
            ("posts_processed = posts_processed + ?", update.posts_processed_delta),
            ("entries_created = entries_created + ?", update.entries_created_delta),
            ("entries_updated = entries_updated + ?", update.entries_updated_delta),
        ] {
            if delta != 0 {
                sets.push(column);
                values.push(Value::Integer(delta as i64));
            }
        }
        if sets.is_empty() {
            return Ok(());
        }
        values.push(Value::Integer(thread_id.value()));
        self.db
            .execute(
                &format!("UPDATE thread_state SET {} WHERE thread_id = ?", sets.join(", ")),
                params_from_iter(values),
            )
            .db("update thread state")?;
        Ok(())
    }

    /// Completed threads in completion order.
    pub fn get_completed_threads(&self) -> Result<Vec<ThreadState>, StorageError> {
        let mut stmt = self
            .db
            .prepare(&format!(
                "SELECT {THREAD_COLUMNS} FROM thread_state
                 WHERE status = 'completed' ORDER BY completed_at, thread_id"
            ))
            .db("prepare completed threads")?;
        let rows = stmt
            .query_map([], ThreadRow::from_row)
            .db("query completed threads")?
            .collect::<Result<Vec<_>, _>>()
            .db("read completed threads")?;
        rows.into_iter().map(ThreadRow::into_state).collect()
    }
}

struct ThreadRow {
    thread_id: i64,
    status: String,
    summary: Option<String>,
    posts_processed: i64,
    entries_created: i64,
    entries_updated: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl ThreadRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            thread_id: row.get(0)?,
            status: row.get(1)?,
            summary: row.get(2)?,
            posts_processed: row.get(3)?,
            entries_created: row.get(4)?,
            entries_updated: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_state(self) -> Result<ThreadState, StorageError> {
        Ok(ThreadState {
            thread_id: ThreadId::new(self.thread_id),
            status: self.status.parse()?,
            summary: self.summary,
            posts_processed: self.posts_processed as u64,
            entries_created: self.entries_created as u64,
            entries_updated: self.entries_updated as u64,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use annotator_types::{PostId, SnapshotId, ThreadId};

    use super::{ProgressTracker, RunUpdate, ThreadStatus, ThreadUpdate};

    fn tracker() -> (tempfile::TempDir, ProgressTracker) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProgressTracker::open(dir.path().join("annotator.db")).unwrap();
        (dir, tracker)
    }

    #[test]
    fn fresh_run_state_is_empty() {
        let (_dir, tracker) = tracker();
        let state = tracker.get_state().unwrap();
        assert_eq!(state.last_post_id, None);
        assert_eq!(state.total_posts_processed, 0);
        assert!(state.run_started_at.is_none());
    }

    #[test]
    fn update_moves_cursors_and_adds_deltas() {
        let (_dir, mut tracker) = tracker();
        tracker.start_run().unwrap();
        tracker
            .update(&RunUpdate {
                last_post_id: Some(PostId::new(12)),
                last_thread_id: Some(ThreadId::new(3)),
                posts_processed_delta: 4,
                entries_created_delta: 2,
                ..RunUpdate::default()
            })
            .unwrap();
        tracker
            .update(&RunUpdate {
                current_snapshot_id: Some(SnapshotId::new(9)),
                posts_processed_delta: 3,
                ..RunUpdate::default()
            })
            .unwrap();

        let state = tracker.get_state().unwrap();
        assert_eq!(state.last_post_id, Some(PostId::new(12)));
        assert_eq!(state.last_thread_id, Some(ThreadId::new(3)));
        assert_eq!(state.current_snapshot_id, Some(SnapshotId::new(9)));
        assert_eq!(state.total_posts_processed, 7);
        assert_eq!(state.total_entries_created, 2);
        assert_eq!(state.total_entries_updated, 0);
        assert!(state.run_started_at.is_some());
    }

    #[test]
    fn thread_lifecycle_stamps_times() {
        let (_dir, mut tracker) = tracker();
        let thread = ThreadId::new(5);
        assert!(tracker.get_thread_state(thread).unwrap().is_none());

        tracker
            .update_thread_state(thread, &ThreadUpdate::status(ThreadStatus::InProgress))
            .unwrap();
        let started = tracker.get_thread_state(thread).unwrap().unwrap();
        assert_eq!(started.status, ThreadStatus::InProgress);
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());

        tracker
            .update_thread_state(
                thread,
                &ThreadUpdate {
                    posts_processed_delta: 6,
                    ..ThreadUpdate::default()
                },
            )
            .unwrap();
        tracker
            .update_thread_state(
                thread,
                &ThreadUpdate {
                    status: Some(ThreadStatus::Completed),
                    summary: Some("Done.".into()),
                    ..ThreadUpdate::default()
                },
            )
            .unwrap();

        let done = tracker.get_thread_state(thread).unwrap().unwrap();
        assert_eq!(done.status, ThreadStatus::Completed);
        assert_eq!(done.posts_processed, 6);
        assert_eq!(done.summary.as_deref(), Some("Done."));
        assert_eq!(done.started_at, started.started_at);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn completed_threads_listed() {
        let (_dir, mut tracker) = tracker();
        for id in [1, 2, 3] {
            tracker
                .update_thread_state(ThreadId::new(id), &ThreadUpdate::status(ThreadStatus::InProgress))
                .unwrap();
        }
        for id in [2, 1] {
            tracker
                .update_thread_state(ThreadId::new(id), &ThreadUpdate::status(ThreadStatus::Completed))
                .unwrap();
        }
        let completed: Vec<ThreadId> = tracker
            .get_completed_threads()
            .unwrap()
            .into_iter()
            .map(|t| t.thread_id)
            .collect();
        assert_eq!(completed.len(), 2);
        assert!(completed.contains(&ThreadId::new(1)));
        assert!(completed.contains(&ThreadId::new(2)));
    }
}
