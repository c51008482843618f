//! SQLite-backed glossary with FTS5 search and a per-field revision log.
//!
//! The compaction core only reads the glossary, through the [`Glossary`]
//! trait. Writes go through [`GlossaryStore`] directly and are refused while
//! a snapshot is summoned for read-only exploration.

use std::path::Path;

use annotator_types::{EntryId, EntryStatus, GlossaryEntry, PostId, SnapshotId, ThreadId};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use unicode_normalization::UnicodeNormalization;

use crate::error::{DbContext, StorageError};
use crate::schema;
use crate::sqlite_util::utc_now;

/// Deduplication key: trimmed, lowercased, Unicode NFD.
#[must_use]
pub fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase().nfd().collect()
}

/// Which thread column [`Glossary::get_by_thread`] matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadField {
    FirstSeen,
    LastUpdated,
}

impl ThreadField {
    const fn column(self) -> &'static str {
        match self {
            ThreadField::FirstSeen => "first_seen_thread_id",
            ThreadField::LastUpdated => "last_updated_thread_id",
        }
    }
}

/// Read surface of the glossary.
pub trait Glossary {
    /// Full-text search over term and definition, best match first. Every
    /// tag in `tags` must be present on a returned entry.
    fn search(
        &self,
        query: &str,
        tags: &[String],
        status: Option<EntryStatus>,
        limit: usize,
    ) -> Result<Vec<GlossaryEntry>, StorageError>;

    fn get(&self, id: EntryId) -> Result<Option<GlossaryEntry>, StorageError>;

    fn get_by_thread(
        &self,
        thread_id: ThreadId,
        field: ThreadField,
    ) -> Result<Vec<GlossaryEntry>, StorageError>;

    fn count(&self) -> Result<u64, StorageError>;

    /// Every entry, ordered by normalized term.
    fn all_entries(&self) -> Result<Vec<GlossaryEntry>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub term: String,
    pub definition: String,
    pub tags: Vec<String>,
    pub status: EntryStatus,
    pub post_id: PostId,
    pub thread_id: ThreadId,
}

/// Partial update. `None` fields are left untouched; `tags` replaces the set.
#[derive(Debug, Clone)]
pub struct EntryUpdate {
    pub term: Option<String>,
    pub definition: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<EntryStatus>,
    pub post_id: PostId,
    pub thread_id: ThreadId,
}

impl EntryUpdate {
    #[must_use]
    pub fn at(post_id: PostId, thread_id: ThreadId) -> Self {
        Self {
            term: None,
            definition: None,
            tags: None,
            status: None,
            post_id,
            thread_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: i64,
    pub entry_id: EntryId,
    pub snapshot_id: Option<SnapshotId>,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub changed_at: String,
    pub source_post_id: Option<PostId>,
}

const ENTRY_COLUMNS: &str = "e.id, e.term, e.term_normalized, e.definition, e.status,
    e.first_seen_post_id, e.first_seen_thread_id,
    e.last_updated_post_id, e.last_updated_thread_id,
    e.created_at, e.updated_at";

pub struct GlossaryStore {
    db: Connection,
    read_only: Option<SnapshotId>,
}

impl GlossaryStore {
    /// Open or create the glossary in `annotator.db` at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: schema::connect(path.as_ref())?,
            read_only: None,
        })
    }

    /// Refuse all writes until [`unlock`](Self::unlock). Fails if already locked.
    pub fn lock_read_only(&mut self, snapshot_id: SnapshotId) -> Result<(), StorageError> {
        if let Some(active) = self.read_only {
            return Err(StorageError::ReadOnly {
                snapshot_id: active,
            });
        }
        tracing::info!(%snapshot_id, "Glossary locked read-only");
        self.read_only = Some(snapshot_id);
        Ok(())
    }

    pub fn unlock(&mut self) {
        if let Some(snapshot_id) = self.read_only.take() {
            tracing::info!(%snapshot_id, "Glossary unlocked");
        }
    }

    #[must_use]
    pub fn read_only_snapshot(&self) -> Option<SnapshotId> {
        self.read_only
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        match self.read_only {
            Some(snapshot_id) => Err(StorageError::ReadOnly { snapshot_id }),
            None => Ok(()),
        }
    }

    /// Insert a new entry with its tags. Rejects a duplicate normalized term.
    pub fn create(&mut self, entry: &NewEntry) -> Result<EntryId, StorageError> {
        self.ensure_writable()?;
        let normalized = normalize_term(&entry.term);
        if let Some(existing_id) = self.find_by_normalized(&normalized)? {
            return Err(StorageError::DuplicateTerm {
                term: entry.term.clone(),
                existing_id,
            });
        }

        let now = utc_now();
        let tx = self.db.transaction().db("start glossary transaction")?;
        tx.execute(
            "INSERT INTO glossary_entry (
                term, term_normalized, definition, status,
                first_seen_post_id, first_seen_thread_id,
                last_updated_post_id, last_updated_thread_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5, ?6, ?7, ?7)",
            params![
                entry.term,
                normalized,
                entry.definition,
                entry.status.as_str(),
                entry.post_id.value(),
                entry.thread_id.value(),
                now,
            ],
        )
        .db("insert glossary entry")?;
        let id = EntryId::new(tx.last_insert_rowid());

        for tag in &entry.tags {
            tx.execute(
                "INSERT OR IGNORE INTO glossary_tag (entry_id, tag) VALUES (?1, ?2)",
                params![id.value(), tag],
            )
            .db("insert glossary tag")?;
        }

        let tags_json = serde_json::to_string(&entry.tags)?;
        for (field, value) in [
            ("term", entry.term.as_str()),
            ("definition", entry.definition.as_str()),
            ("tags", tags_json.as_str()),
            ("status", entry.status.as_str()),
        ] {
            log_revision(&tx, id, field, None, value, Some(entry.post_id), &now)?;
        }

        tx.commit().db("commit glossary entry")?;
        tracing::debug!(%id, term = %entry.term, "Created glossary entry");
        Ok(id)
    }

    /// Apply a partial update. Returns `false` when the entry does not exist.
    pub fn update(&mut self, id: EntryId, update: &EntryUpdate) -> Result<bool, StorageError> {
        self.ensure_writable()?;
        let Some(existing) = self.get(id)? else {
            return Ok(false);
        };

        if let Some(term) = &update.term {
            let normalized = normalize_term(term);
            if let Some(other) = self.find_by_normalized(&normalized)?
                && other != id
            {
                return Err(StorageError::DuplicateTerm {
                    term: term.clone(),
                    existing_id: other,
                });
            }
        }

        let now = utc_now();
        let mut sets = vec![
            "last_updated_post_id = ?",
            "last_updated_thread_id = ?",
            "updated_at = ?",
        ];
        let mut values = vec![
            Value::Integer(update.post_id.value()),
            Value::Integer(update.thread_id.value()),
            Value::Text(now.clone()),
        ];
        let mut changes: Vec<(&'static str, String, String)> = Vec::new();

        if let Some(term) = &update.term {
            sets.push("term = ?");
            sets.push("term_normalized = ?");
            values.push(Value::Text(term.clone()));
            values.push(Value::Text(normalize_term(term)));
            changes.push(("term", existing.term.clone(), term.clone()));
        }
        if let Some(definition) = &update.definition {
            sets.push("definition = ?");
            values.push(Value::Text(definition.clone()));
            changes.push(("definition", existing.definition.clone(), definition.clone()));
        }
        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
            changes.push((
                "status",
                existing.status.as_str().to_string(),
                status.as_str().to_string(),
            ));
        }
        if let Some(tags) = &update.tags {
            changes.push((
                "tags",
                serde_json::to_string(&existing.tags)?,
                serde_json::to_string(tags)?,
            ));
        }
        values.push(Value::Integer(id.value()));

        let tx = self.db.transaction().db("start glossary transaction")?;
        tx.execute(
            &format!("UPDATE glossary_entry SET {} WHERE id = ?", sets.join(", ")),
            params_from_iter(values),
        )
        .db("update glossary entry")?;

        if let Some(tags) = &update.tags {
            tx.execute(
                "DELETE FROM glossary_tag WHERE entry_id = ?1",
                params![id.value()],
            )
            .db("clear glossary tags")?;
            for tag in tags {
                tx.execute(
                    "INSERT OR IGNORE INTO glossary_tag (entry_id, tag) VALUES (?1, ?2)",
                    params![id.value(), tag],
                )
                .db("insert glossary tag")?;
            }
        }

        for (field, old, new) in changes.iter().filter(|(_, old, new)| old != new) {
            log_revision(&tx, id, field, Some(old.as_str()), new, Some(update.post_id), &now)?;
        }

        tx.commit().db("commit glossary update")?;
        tracing::debug!(%id, "Updated glossary entry");
        Ok(true)
    }

    /// Delete an entry and log `reason`. Returns `false` when it does not exist.
    pub fn delete(
        &mut self,
        id: EntryId,
        reason: &str,
        source_post_id: Option<PostId>,
    ) -> Result<bool, StorageError> {
        self.ensure_writable()?;
        let now = utc_now();
        let tx = self.db.transaction().db("start glossary transaction")?;
        let removed = tx
            .execute("DELETE FROM glossary_entry WHERE id = ?1", params![id.value()])
            .db("delete glossary entry")?;
        if removed > 0 {
            log_revision(&tx, id, "deleted", None, reason, source_post_id, &now)?;
        }
        tx.commit().db("commit glossary delete")?;
        Ok(removed > 0)
    }

    /// Change log for `id`, newest first.
    pub fn history(&self, id: EntryId, limit: usize) -> Result<Vec<Revision>, StorageError> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT id, entry_id, snapshot_id, field_name, old_value, new_value,
                        changed_at, source_post_id
                 FROM revision
                 WHERE entry_id = ?1
                 ORDER BY changed_at DESC, id DESC
                 LIMIT ?2",
            )
            .db("prepare revision history")?;
        let rows = stmt
            .query_map(params![id.value(), limit as i64], |row| {
                Ok(Revision {
                    id: row.get(0)?,
                    entry_id: EntryId::new(row.get(1)?),
                    snapshot_id: row.get::<_, Option<i64>>(2)?.map(SnapshotId::new),
                    field_name: row.get(3)?,
                    old_value: row.get(4)?,
                    new_value: row.get(5)?,
                    changed_at: row.get(6)?,
                    source_post_id: row.get::<_, Option<i64>>(7)?.map(PostId::new),
                })
            })
            .db("query revision history")?;
        rows.collect::<Result<Vec<_>, _>>()
            .db("read revision history")
    }

    fn find_by_normalized(&self, normalized: &str) -> Result<Option<EntryId>, StorageError> {
        self.db
            .query_row(
                "SELECT id FROM glossary_entry WHERE term_normalized = ?1",
                params![normalized],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .db("look up normalized term")
            .map(|id| id.map(EntryId::new))
    }

    fn tags_for(&self, id: EntryId) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .db
            .prepare_cached("SELECT tag FROM glossary_tag WHERE entry_id = ?1 ORDER BY tag")
            .db("prepare tag lookup")?;
        let tags = stmt
            .query_map(params![id.value()], |row| row.get::<_, String>(0))
            .db("query tags")?
            .collect::<Result<Vec<_>, _>>()
            .db("read tags");
        tags
    }

    fn query_entries(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<GlossaryEntry>, StorageError> {
        let mut stmt = self.db.prepare(sql).db("prepare glossary query")?;
        let rows = stmt
            .query_map(params_from_iter(values), EntryRow::from_row)
            .db("query glossary")?
            .collect::<Result<Vec<_>, _>>()
            .db("read glossary rows")?;
        rows.into_iter().map(|row| self.hydrate(row)).collect()
    }

    fn hydrate(&self, row: EntryRow) -> Result<GlossaryEntry, StorageError> {
        let id = EntryId::new(row.id);
        let status = row
            .status
            .parse::<EntryStatus>()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(GlossaryEntry {
            id,
            term: row.term,
            term_normalized: row.term_normalized,
            definition: row.definition,
            status,
            tags: self.tags_for(id)?,
            first_seen_post_id: PostId::new(row.first_seen_post_id),
            first_seen_thread_id: ThreadId::new(row.first_seen_thread_id),
            last_updated_post_id: PostId::new(row.last_updated_post_id),
            last_updated_thread_id: ThreadId::new(row.last_updated_thread_id),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl Glossary for GlossaryStore {
    fn search(
        &self,
        query: &str,
        tags: &[String],
        status: Option<EntryStatus>,
        limit: usize,
    ) -> Result<Vec<GlossaryEntry>, StorageError> {
        let Some(fts_query) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS}
             FROM glossary_fts f
             JOIN glossary_entry e ON f.rowid = e.id
             WHERE glossary_fts MATCH ?"
        );
        let mut values = vec![Value::Text(fts_query)];

        if let Some(status) = status {
            sql.push_str(" AND e.status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        let mut tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        tags.sort_unstable();
        tags.dedup();
        if !tags.is_empty() {
            let placeholders = vec!["?"; tags.len()].join(",");
            sql.push_str(&format!(
                " AND e.id IN (
                    SELECT entry_id FROM glossary_tag
                    WHERE tag IN ({placeholders})
                    GROUP BY entry_id
                    HAVING COUNT(DISTINCT tag) = ?
                )"
            ));
            values.extend(tags.iter().map(|t| Value::Text((*t).to_string())));
            values.push(Value::Integer(tags.len() as i64));
        }
        sql.push_str(" ORDER BY bm25(glossary_fts) LIMIT ?");
        values.push(Value::Integer(limit as i64));

        self.query_entries(&sql, values)
    }

    fn get(&self, id: EntryId) -> Result<Option<GlossaryEntry>, StorageError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM glossary_entry e WHERE e.id = ?");
        Ok(self
            .query_entries(&sql, vec![Value::Integer(id.value())])?
            .into_iter()
            .next())
    }

    fn get_by_thread(
        &self,
        thread_id: ThreadId,
        field: ThreadField,
    ) -> Result<Vec<GlossaryEntry>, StorageError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM glossary_entry e
             WHERE e.{} = ?
             ORDER BY e.term_normalized",
            field.column()
        );
        self.query_entries(&sql, vec![Value::Integer(thread_id.value())])
    }

    fn count(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM glossary_entry", [], |row| row.get(0))
            .db("count glossary entries")?;
        Ok(n as u64)
    }

    fn all_entries(&self) -> Result<Vec<GlossaryEntry>, StorageError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM glossary_entry e ORDER BY e.term_normalized");
        self.query_entries(&sql, Vec::new())
    }
}

struct EntryRow {
    id: i64,
    term: String,
    term_normalized: String,
    definition: String,
    status: String,
    first_seen_post_id: i64,
    first_seen_thread_id: i64,
    last_updated_post_id: i64,
    last_updated_thread_id: i64,
    created_at: String,
    updated_at: String,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            term: row.get(1)?,
            term_normalized: row.get(2)?,
            definition: row.get(3)?,
            status: row.get(4)?,
            first_seen_post_id: row.get(5)?,
            first_seen_thread_id: row.get(6)?,
            last_updated_post_id: row.get(7)?,
            last_updated_thread_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

/// Quote each whitespace-separated token so user text can never be parsed
/// as FTS5 syntax. Tokens are implicitly AND-ed.
fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn log_revision(
    tx: &rusqlite::Transaction<'_>,
    entry_id: EntryId,
    field_name: &str,
    old_value: Option<&str>,
    new_value: &str,
    source_post_id: Option<PostId>,
    changed_at: &str,
) -> Result<(), StorageError> {
    tx.execute(
        "INSERT INTO revision (
            entry_id, snapshot_id, field_name, old_value, new_value, changed_at, source_post_id
        ) VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry_id.value(),
            field_name,
            old_value,
            new_value,
            changed_at,
            source_post_id.map(PostId::value),
        ],
    )
    .db("insert revision")?;
    Ok(())
}
