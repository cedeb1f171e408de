//! SQLite storage implementation

use crate::storage::schema::initialize_schema;
use crate::storage::{
    NewPost, PostFilter, PostRecord, StorageError, StorageResult, TargetKind, TargetRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::io::Write;
use std::path::Path;

/// SQLite storage backend
///
/// Deduplication relies on the UNIQUE constraint on `posts.dedup_key`
/// together with `INSERT OR IGNORE`, so concurrent cycles racing on the
/// same key can never produce duplicate rows.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) the database at the given path
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    // ===== Target Management =====

    /// Creates a new target and returns the stored record
    pub fn add_target(
        &mut self,
        kind: TargetKind,
        value: &str,
        poll_interval_seconds: u64,
    ) -> StorageResult<TargetRecord> {
        let now = rfc3339_now();
        self.conn.execute(
            "INSERT INTO targets (kind, value, poll_interval_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![kind.to_db_string(), value, poll_interval_seconds, now],
        )?;
        let id = self.conn.last_insert_rowid();

        Ok(TargetRecord {
            id,
            kind,
            value: value.to_string(),
            poll_interval_seconds,
            last_fetched_key: None,
            last_fetched_at: None,
            created_at: now,
        })
    }

    /// Gets a target by ID
    pub fn get_target(&self, target_id: i64) -> StorageResult<Option<TargetRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, value, poll_interval_seconds, last_fetched_key, last_fetched_at, created_at
             FROM targets WHERE id = ?1",
        )?;

        let target = stmt
            .query_row(params![target_id], target_from_row)
            .optional()?;

        Ok(target)
    }

    /// Lists all targets in creation order
    pub fn list_targets(&self) -> StorageResult<Vec<TargetRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, value, poll_interval_seconds, last_fetched_key, last_fetched_at, created_at
             FROM targets ORDER BY id ASC",
        )?;

        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(targets)
    }

    /// Deletes a target; returns whether a row was removed
    ///
    /// Posts already harvested for the target are kept (orphaned target ids
    /// are acceptable; the timeline query filters them out).
    pub fn delete_target(&mut self, target_id: i64) -> StorageResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM targets WHERE id = ?1", params![target_id])?;
        Ok(changed > 0)
    }

    /// Records the newest dedup key and fetch time after a successful cycle
    pub fn update_target_fetch_state(
        &mut self,
        target_id: i64,
        last_fetched_key: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE targets SET last_fetched_key = COALESCE(?1, last_fetched_key), last_fetched_at = ?2
             WHERE id = ?3",
            params![last_fetched_key, rfc3339(fetched_at), target_id],
        )?;

        if changed == 0 {
            return Err(StorageError::TargetNotFound(target_id));
        }
        Ok(())
    }

    // ===== Post Management =====

    /// Inserts a batch of posts, skipping rows whose dedup key already exists
    ///
    /// Returns the number of rows actually inserted. Duplicates are silent
    /// no-ops; they never surface as errors.
    pub fn insert_posts(&mut self, posts: &[NewPost]) -> StorageResult<usize> {
        let fetched_at = rfc3339_now();
        let tx = self.conn.transaction()?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO posts
                 (dedup_key, target_id, content, created_at, fetched_at, source_instance)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for post in posts {
                inserted += stmt.execute(params![
                    post.dedup_key,
                    post.target_id,
                    post.content,
                    post.created_at.map(rfc3339),
                    fetched_at,
                    post.source_instance,
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Timeline read: filtered, newest first, nulls last, bounded
    pub fn query(&self, filter: &PostFilter) -> StorageResult<Vec<PostRecord>> {
        let mut sql = String::from(
            "SELECT id, dedup_key, target_id, content, created_at, fetched_at, source_instance
             FROM posts",
        );
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(target_id) = filter.target_id {
            conditions.push("target_id = ?");
            params.push(target_id.into());
        }
        if let Some(contains) = &filter.contains {
            conditions.push("content LIKE ? ESCAPE '\\'");
            params.push(format!("%{}%", escape_like(contains)).into());
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        sql.push_str(" ORDER BY (created_at IS NULL) ASC, created_at DESC, id DESC LIMIT ?");
        params.push((filter.effective_limit() as i64).into());

        let mut stmt = self.conn.prepare(&sql)?;
        let posts = stmt
            .query_map(params_from_iter(params), post_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(posts)
    }

    /// Streams every post as one JSON object per line, in insertion order
    ///
    /// Rows are written as they are read from the cursor; the result set is
    /// never materialized.
    pub fn export_jsonl(&self, out: &mut dyn Write) -> StorageResult<u64> {
        let mut stmt = self.conn.prepare(
            "SELECT id, dedup_key, target_id, content, created_at, fetched_at, source_instance
             FROM posts ORDER BY id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut written = 0u64;

        while let Some(row) = rows.next()? {
            let post = post_from_row(row)?;
            serde_json::to_writer(&mut *out, &post)?;
            out.write_all(b"\n")?;
            written += 1;
        }

        out.flush()?;
        Ok(written)
    }

    /// Keeps only the newest `max_per_target` posts per target
    ///
    /// Returns the number of rows deleted.
    pub fn prune_posts(&mut self, max_per_target: u32) -> StorageResult<usize> {
        let target_ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT DISTINCT target_id FROM posts")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut deleted = 0;
        for target_id in target_ids {
            deleted += self.conn.execute(
                "DELETE FROM posts WHERE target_id = ?1 AND id NOT IN (
                    SELECT id FROM posts WHERE target_id = ?1
                    ORDER BY (created_at IS NULL) ASC, created_at DESC, id DESC
                    LIMIT ?2
                 )",
                params![target_id, max_per_target],
            )?;
        }

        Ok(deleted)
    }

    /// Total number of stored posts
    pub fn count_posts(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn rfc3339_now() -> String {
    rfc3339(Utc::now())
}

/// Escapes LIKE wildcards in user-supplied search text
fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<TargetRecord> {
    Ok(TargetRecord {
        id: row.get(0)?,
        kind: TargetKind::from_db_string(&row.get::<_, String>(1)?).unwrap_or(TargetKind::User),
        value: row.get(2)?,
        poll_interval_seconds: row.get(3)?,
        last_fetched_key: row.get(4)?,
        last_fetched_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostRecord> {
    Ok(PostRecord {
        id: row.get(0)?,
        dedup_key: row.get(1)?,
        target_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        fetched_at: row.get(5)?,
        source_instance: row.get(6)?,
    })
}
