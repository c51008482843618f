//! Read-only exploration of a past snapshot.
//!
//! While a session is open the live glossary refuses writes, and exploratory
//! turns go to the session's own copy of the restored context, never to the
//! run's context.

use std::collections::BTreeMap;

use annotator_types::{EntryId, EntryStatus, Role, SnapshotId, TurnTags};

use crate::annotation::AnnotationContext;
use crate::error::{ContextError, StorageError};
use crate::glossary::{Glossary, GlossaryStore};
use crate::snapshot_store::{Snapshot, SnapshotEntry, SnapshotStore};
use crate::state::CompactionState;

/// How a captured entry differs from the live glossary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDrift {
    Changed {
        entry_id: EntryId,
        term: String,
        definition_then: String,
        definition_now: String,
        status_then: EntryStatus,
        status_now: EntryStatus,
    },
    Deleted {
        entry_id: EntryId,
    },
}

#[derive(Debug)]
pub struct SummonSession {
    snapshot: Snapshot,
    context: AnnotationContext,
    state: CompactionState,
    entries: BTreeMap<EntryId, SnapshotEntry>,
    restored_turns: usize,
}

impl SummonSession {
    /// Restore `snapshot_id` and lock `glossary` read-only. Fails with
    /// [`StorageError::ReadOnly`] while another session holds the lock.
    pub fn begin(
        snapshots: &SnapshotStore,
        glossary: &mut GlossaryStore,
        snapshot_id: SnapshotId,
    ) -> Result<Self, StorageError> {
        if let Some(active) = glossary.read_only_snapshot() {
            return Err(StorageError::ReadOnly {
                snapshot_id: active,
            });
        }
        let snapshot = snapshots
            .get(snapshot_id)?
            .ok_or(StorageError::SnapshotNotFound(snapshot_id))?;
        let (context, state) = snapshots.restore_context(snapshot_id)?;
        let entries = snapshots.restore_entries_view(snapshot_id)?;
        glossary.lock_read_only(snapshot_id)?;

        tracing::info!(
            %snapshot_id,
            entries = entries.len(),
            turns = context.history().len(),
            "Summoned snapshot"
        );
        let restored_turns = context.history().len();
        Ok(Self {
            snapshot,
            context,
            state,
            entries,
            restored_turns,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn context(&self) -> &AnnotationContext {
        &self.context
    }

    #[must_use]
    pub fn state(&self) -> &CompactionState {
        &self.state
    }

    #[must_use]
    pub fn entries(&self) -> &BTreeMap<EntryId, SnapshotEntry> {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> Option<&SnapshotEntry> {
        self.entries.get(&id)
    }

    /// Append an exploratory turn to the session's context.
    pub fn record(&mut self, role: Role, content: impl Into<String>) -> Result<(), ContextError> {
        self.context
            .record_turn(role, content, None, TurnTags::default())
    }

    #[must_use]
    pub fn turns_recorded(&self) -> usize {
        self.context.history().len() - self.restored_turns
    }

    /// Captured entries whose live value differs, or that no longer exist.
    pub fn diff_against_live(&self, live: &dyn Glossary) -> Result<Vec<EntryDrift>, StorageError> {
        let mut drift = Vec::new();
        for (id, captured) in &self.entries {
            match live.get(*id)? {
                None => drift.push(EntryDrift::Deleted { entry_id: *id }),
                Some(now)
                    if now.definition != captured.definition_at_snapshot
                        || now.status != captured.status_at_snapshot =>
                {
                    drift.push(EntryDrift::Changed {
                        entry_id: *id,
                        term: now.term,
                        definition_then: captured.definition_at_snapshot.clone(),
                        definition_now: now.definition,
                        status_then: captured.status_at_snapshot,
                        status_now: now.status,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(drift)
    }

    /// Unlock the glossary. Returns the number of exploratory turns.
    pub fn end(self, glossary: &mut GlossaryStore) -> usize {
        let turns = self.turns_recorded();
        glossary.unlock();
        tracing::info!(snapshot_id = %self.snapshot.id, turns, "Dismissed summon");
        turns
    }
}

#[cfg(test)]
mod tests {
    use annotator_types::{EntryStatus, PostId, Role, ThreadId, TurnTags};

    use super::{EntryDrift, SummonSession};
    use crate::annotation::AnnotationContext;
    use crate::error::StorageError;
    use crate::glossary::{EntryUpdate, GlossaryStore, NewEntry};
    use crate::snapshot_store::{NewSnapshot, SnapshotStore, SnapshotType};
    use crate::state::CompactionState;

    fn setup() -> (tempfile::TempDir, SnapshotStore, GlossaryStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotator.db");
        let glossary = GlossaryStore::open(&path).unwrap();
        let snapshots = SnapshotStore::open(&path).unwrap();
        (dir, snapshots, glossary)
    }

    fn new_entry(term: &str) -> NewEntry {
        NewEntry {
            term: term.into(),
            definition: format!("{term} then."),
            tags: vec![],
            status: EntryStatus::Tentative,
            post_id: PostId::new(1),
            thread_id: ThreadId::new(1),
        }
    }

    #[test]
    fn session_locks_glossary_and_isolates_turns() {
        let (_dir, mut snapshots, mut glossary) = setup();
        let mut ctx = AnnotationContext::new("sys");
        ctx.record_turn(Role::User, "scene", None, TurnTags::new(ThreadId::new(1), 0))
            .unwrap();
        let header = NewSnapshot::new(SnapshotType::CuratorFork, PostId::new(5), ThreadId::new(1), 0);
        let id = snapshots
            .create(&header, &ctx, &CompactionState::new(), &glossary)
            .unwrap();

        let mut session = SummonSession::begin(&snapshots, &mut glossary, id).unwrap();
        assert!(matches!(
            glossary.create(&new_entry("Wyrm")),
            Err(StorageError::ReadOnly { .. })
        ));
        assert!(matches!(
            SummonSession::begin(&snapshots, &mut glossary, id),
            Err(StorageError::ReadOnly { .. })
        ));

        session.record(Role::User, "What did we know then?").unwrap();
        session.record(Role::Assistant, "Very little.").unwrap();
        assert_eq!(session.turns_recorded(), 2);
        assert_eq!(session.context().history().len(), 3);
        assert_eq!(ctx.history().len(), 1);

        assert_eq!(session.end(&mut glossary), 2);
        assert!(glossary.create(&new_entry("Wyrm")).is_ok());
    }

    #[test]
    fn missing_snapshot_does_not_lock() {
        let (_dir, snapshots, mut glossary) = setup();
        let err = SummonSession::begin(&snapshots, &mut glossary, annotator_types::SnapshotId::new(42))
            .unwrap_err();
        assert!(matches!(err, StorageError::SnapshotNotFound(_)));
        assert!(glossary.read_only_snapshot().is_none());
    }

    #[test]
    fn diff_reports_changed_and_deleted_entries() {
        let (_dir, mut snapshots, mut glossary) = setup();
        let changed = glossary.create(&new_entry("Wyrm")).unwrap();
        let same = glossary.create(&new_entry("Cave")).unwrap();
        let gone = glossary.create(&new_entry("Road")).unwrap();
        let header = NewSnapshot::new(SnapshotType::Manual, PostId::new(5), ThreadId::new(1), 0);
        let id = snapshots
            .create(
                &header,
                &AnnotationContext::new("sys"),
                &CompactionState::new(),
                &glossary,
            )
            .unwrap();

        let mut update = EntryUpdate::at(PostId::new(6), ThreadId::new(1));
        update.definition = Some("Wyrm now.".into());
        glossary.update(changed, &update).unwrap();
        glossary.delete(gone, "duplicate", None).unwrap();

        let session = SummonSession::begin(&snapshots, &mut glossary, id).unwrap();
        assert_eq!(session.entry(same).unwrap().definition_at_snapshot, "Cave then.");
        let drift = session.diff_against_live(&glossary).unwrap();
        assert_eq!(drift.len(), 2);
        assert!(drift.contains(&EntryDrift::Deleted { entry_id: gone }));
        assert!(drift.iter().any(|d| matches!(
            d,
            EntryDrift::Changed { entry_id, definition_now, .. }
                if *entry_id == changed && definition_now == "Wyrm now."
        )));
        session.end(&mut glossary);
    }
}
