//! Snapshot capture, restore and summoning over one database file

use annotator_context::{
    AnnotationContext, CompactionState, EntryDrift, EntryUpdate, Glossary, GlossaryStore,
    NewSnapshot, SnapshotStore, SnapshotType, StorageError, SummonSession,
};
use annotator_types::{EntryStatus, PostId, Role, ThreadId, TurnTags};

use crate::common::create_entry;

fn annotated_context() -> (AnnotationContext, CompactionState) {
    let mut ctx = AnnotationContext::new("sys");
    let mut state = CompactionState::new();
    state.start_new_thread(ThreadId::new(1));
    for scene in 0..3 {
        let tags = TurnTags::new(ThreadId::new(1), scene);
        ctx.record_turn(Role::User, format!("scene {scene}"), None, tags)
            .unwrap();
        ctx.record_turn(Role::Assistant, "ok", None, tags).unwrap();
        state.advance_scene();
    }
    (ctx, state)
}

#[test]
fn checkpoint_restores_identical_context_and_captured_entries() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("annotator.db");
    let mut glossary = GlossaryStore::open(&db).unwrap();
    let mut snapshots = SnapshotStore::open(&db).unwrap();
    let gate = create_entry(&mut glossary, "Shard Gate", "A portal of glass.", 3, 1);
    let wyrm = create_entry(&mut glossary, "Wyrm", "A serpent.", 4, 1);

    let (ctx, state) = annotated_context();
    let id = snapshots
        .create(
            &NewSnapshot::new(SnapshotType::Checkpoint, PostId::new(9), ThreadId::new(1), 3),
            &ctx,
            &state,
            &glossary,
        )
        .unwrap();

    let mut update = EntryUpdate::at(PostId::new(10), ThreadId::new(1));
    update.definition = Some("A portal of obsidian.".to_string());
    update.status = Some(EntryStatus::Confirmed);
    assert!(glossary.update(gate, &update).unwrap());
    assert!(glossary.delete(wyrm, "merged", Some(PostId::new(10))).unwrap());

    let (restored_ctx, restored_state) = snapshots.restore_context(id).unwrap();
    assert_eq!(restored_ctx, ctx);
    assert_eq!(restored_state, state);
    assert_eq!(restored_state.current_scene_index(), 3);

    let view = snapshots.restore_entries_view(id).unwrap();
    assert_eq!(view[&gate].definition_at_snapshot, "A portal of glass.");
    assert_eq!(view[&gate].status_at_snapshot, EntryStatus::Tentative);
    assert_eq!(view[&wyrm].definition_at_snapshot, "A serpent.");

    let latest = snapshots.latest(Some(SnapshotType::Checkpoint)).unwrap().unwrap();
    assert_eq!(latest.id, id);
    assert_eq!(latest.entry_count, 2);
}

#[test]
fn summon_locks_glossary_and_reports_drift() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("annotator.db");
    let mut glossary = GlossaryStore::open(&db).unwrap();
    let mut snapshots = SnapshotStore::open(&db).unwrap();
    let gate = create_entry(&mut glossary, "Shard Gate", "A portal of glass.", 3, 1);
    let wyrm = create_entry(&mut glossary, "Wyrm", "A serpent.", 4, 1);

    let (ctx, state) = annotated_context();
    let id = snapshots
        .create(
            &NewSnapshot::new(SnapshotType::CuratorFork, PostId::new(9), ThreadId::new(1), 3),
            &ctx,
            &state,
            &glossary,
        )
        .unwrap();

    let mut update = EntryUpdate::at(PostId::new(10), ThreadId::new(1));
    update.definition = Some("A portal of obsidian.".to_string());
    glossary.update(gate, &update).unwrap();
    glossary.delete(wyrm, "merged", None).unwrap();

    let mut session = SummonSession::begin(&snapshots, &mut glossary, id).unwrap();
    assert_eq!(session.context().history().len(), 6);
    session.record(Role::User, "What was the Shard Gate?").unwrap();
    assert_eq!(session.turns_recorded(), 1);

    let err = glossary
        .update(gate, &EntryUpdate::at(PostId::new(11), ThreadId::new(1)))
        .unwrap_err();
    assert!(matches!(err, StorageError::ReadOnly { snapshot_id } if snapshot_id == id));
    assert!(matches!(
        SummonSession::begin(&snapshots, &mut glossary, id),
        Err(StorageError::ReadOnly { .. })
    ));

    let drift = session.diff_against_live(&glossary).unwrap();
    assert_eq!(drift.len(), 2);
    assert!(drift.iter().any(|d| matches!(
        d,
        EntryDrift::Changed { entry_id, definition_now, .. }
            if *entry_id == gate && definition_now == "A portal of obsidian."
    )));
    assert!(drift.contains(&EntryDrift::Deleted { entry_id: wyrm }));

    session.end(&mut glossary);
    assert_eq!(glossary.read_only_snapshot(), None);
    create_entry(&mut glossary, "Old Road", "A highway.", 12, 2);
    assert_eq!(glossary.count().unwrap(), 2);
}
