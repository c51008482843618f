//! Versioned schema for `annotator.db`.
//!
//! Every store opens its own connection through [`connect`], which applies
//! any migration not yet recorded in `schema_version`. Each migration runs
//! in its own transaction.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{DbContext, StorageError};
use crate::sqlite_util::{open_secure_db, utc_now};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r"
        CREATE TABLE glossary_entry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            term TEXT NOT NULL,
            term_normalized TEXT NOT NULL,
            definition TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'tentative'
                CHECK (status IN ('confirmed', 'tentative')),
            first_seen_post_id INTEGER NOT NULL,
            first_seen_thread_id INTEGER NOT NULL,
            last_updated_post_id INTEGER NOT NULL,
            last_updated_thread_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(term_normalized)
        );
        CREATE INDEX idx_glossary_status ON glossary_entry(status);
        CREATE INDEX idx_glossary_first_thread ON glossary_entry(first_seen_thread_id);
        CREATE INDEX idx_glossary_last_thread ON glossary_entry(last_updated_thread_id);

        CREATE TABLE glossary_tag (
            entry_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (entry_id, tag),
            FOREIGN KEY (entry_id) REFERENCES glossary_entry(id) ON DELETE CASCADE
        );
        CREATE INDEX idx_tag ON glossary_tag(tag);

        -- No FK on entry_id: deletions are logged after the row is gone.
        CREATE TABLE revision (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER NOT NULL,
            snapshot_id INTEGER,
            field_name TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT NOT NULL,
            changed_at TEXT NOT NULL,
            source_post_id INTEGER
        );
        CREATE INDEX idx_revision_entry ON revision(entry_id, changed_at);

        CREATE TABLE snapshot (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_type TEXT NOT NULL
                CHECK (snapshot_type IN ('checkpoint', 'curator_fork', 'manual')),
            created_at TEXT NOT NULL,
            last_post_id INTEGER NOT NULL,
            last_thread_id INTEGER NOT NULL,
            thread_position INTEGER NOT NULL,
            entry_count INTEGER NOT NULL,
            token_count INTEGER,
            metadata_json TEXT
        );
        CREATE INDEX idx_snapshot_created ON snapshot(created_at);
        CREATE INDEX idx_snapshot_thread ON snapshot(last_thread_id);
        CREATE INDEX idx_snapshot_type ON snapshot(snapshot_type);

        CREATE TABLE snapshot_context (
            snapshot_id INTEGER PRIMARY KEY,
            system_prompt TEXT NOT NULL,
            cumulative_summary TEXT,
            thread_summaries_json TEXT NOT NULL,
            conversation_history_json TEXT NOT NULL,
            current_thread_id INTEGER,
            completed_thread_ids_json TEXT NOT NULL DEFAULT '[]',
            compaction_state_json TEXT,
            FOREIGN KEY (snapshot_id) REFERENCES snapshot(id) ON DELETE CASCADE
        );

        -- Values are copied, so entry_id must survive deletion of the live entry.
        CREATE TABLE snapshot_entry (
            snapshot_id INTEGER NOT NULL,
            entry_id INTEGER NOT NULL,
            definition_at_snapshot TEXT NOT NULL,
            status_at_snapshot TEXT NOT NULL,
            PRIMARY KEY (snapshot_id, entry_id),
            FOREIGN KEY (snapshot_id) REFERENCES snapshot(id) ON DELETE CASCADE
        );
        CREATE INDEX idx_snapshot_entry_entry ON snapshot_entry(entry_id);

        CREATE TABLE run_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_post_id INTEGER,
            last_thread_id INTEGER,
            current_snapshot_id INTEGER,
            run_started_at TEXT,
            run_updated_at TEXT,
            total_posts_processed INTEGER NOT NULL DEFAULT 0,
            total_entries_created INTEGER NOT NULL DEFAULT 0,
            total_entries_updated INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO run_state (id) VALUES (1);

        CREATE TABLE thread_state (
            thread_id INTEGER PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'completed')),
            summary TEXT,
            posts_processed INTEGER NOT NULL DEFAULT 0,
            entries_created INTEGER NOT NULL DEFAULT 0,
            entries_updated INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT
        );
        CREATE INDEX idx_thread_status ON thread_state(status);
        ",
    },
    Migration {
        version: 2,
        name: "add_fts5",
        sql: r"
        CREATE VIRTUAL TABLE glossary_fts USING fts5(
            term,
            definition,
            content='glossary_entry',
            content_rowid='id'
        );
        CREATE TRIGGER glossary_fts_insert AFTER INSERT ON glossary_entry BEGIN
            INSERT INTO glossary_fts(rowid, term, definition)
            VALUES (NEW.id, NEW.term, NEW.definition);
        END;
        CREATE TRIGGER glossary_fts_update AFTER UPDATE ON glossary_entry BEGIN
            INSERT INTO glossary_fts(glossary_fts, rowid, term, definition)
            VALUES ('delete', OLD.id, OLD.term, OLD.definition);
            INSERT INTO glossary_fts(rowid, term, definition)
            VALUES (NEW.id, NEW.term, NEW.definition);
        END;
        CREATE TRIGGER glossary_fts_delete AFTER DELETE ON glossary_entry BEGIN
            INSERT INTO glossary_fts(glossary_fts, rowid, term, definition)
            VALUES ('delete', OLD.id, OLD.term, OLD.definition);
        END;
        ",
    },
    Migration {
        version: 3,
        name: "add_revision_snapshot_index",
        sql: "CREATE INDEX idx_revision_snapshot ON revision(snapshot_id);",
    },
];

/// Latest schema version this build knows about.
pub const SCHEMA_VERSION: u32 = 3;

/// Open `annotator.db` with WAL and foreign keys, migrated to [`SCHEMA_VERSION`].
pub fn connect(path: &Path) -> Result<Connection, StorageError> {
    let mut db = open_secure_db(path)?;
    db.busy_timeout(std::time::Duration::from_secs(5))
        .db("set busy timeout")?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .db("set pragmas")?;
    run_migrations(&mut db)?;
    Ok(db)
}

pub fn schema_version(db: &Connection) -> Result<u32, StorageError> {
    let exists: Option<i64> = db
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .db("read schema version")?;
    if exists.is_none() {
        return Ok(0);
    }
    let version: Option<u32> = db
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .db("read schema version")?;
    Ok(version.unwrap_or(0))
}

fn run_migrations(db: &mut Connection) -> Result<(), StorageError> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .db("create schema_version")?;

    let current = schema_version(db)?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let wrap = |source| StorageError::Migration {
            version: migration.version,
            name: migration.name,
            source,
        };
        let tx = db.transaction().map_err(wrap)?;
        tx.execute_batch(migration.sql).map_err(wrap)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, utc_now()],
        )
        .map_err(wrap)?;
        tx.commit().map_err(wrap)?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied schema migration"
        );
    }
    Ok(())
}
