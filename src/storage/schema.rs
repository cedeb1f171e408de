//! Database schema definitions
//!
//! All SQL schema for the Mirror-Harvest database. Post deduplication is
//! enforced here, by the UNIQUE constraint on `dedup_key`, not by any
//! application-level pre-check.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Polling subjects (user handles and hashtags)
CREATE TABLE IF NOT EXISTS targets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    poll_interval_seconds INTEGER NOT NULL,
    last_fetched_key TEXT,
    last_fetched_at TEXT,
    created_at TEXT NOT NULL
);

-- Harvested posts, deduplicated on dedup_key
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dedup_key TEXT NOT NULL UNIQUE,
    target_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT,
    fetched_at TEXT NOT NULL,
    source_instance TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_posts_target ON posts(target_id);
CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created_at);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
