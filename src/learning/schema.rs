//! SQLite schema for the learning stores.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the learning-store schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_lexicon (
            category TEXT NOT NULL,
            field TEXT NOT NULL,
            normalized_value TEXT NOT NULL,
            seen_count INTEGER NOT NULL DEFAULT 1,
            confidence REAL NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            PRIMARY KEY (category, field, normalized_value)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS field_anchors (
            category TEXT NOT NULL,
            field TEXT NOT NULL,
            phrase TEXT NOT NULL,
            seen_count INTEGER NOT NULL DEFAULT 1,
            last_seen TEXT NOT NULL,
            PRIMARY KEY (category, field, phrase)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS url_memory (
            category TEXT NOT NULL,
            field TEXT NOT NULL,
            url TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            PRIMARY KEY (category, field, url)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS domain_field_yield (
            category TEXT NOT NULL,
            domain TEXT NOT NULL,
            field TEXT NOT NULL,
            seen_count INTEGER NOT NULL DEFAULT 0,
            used_count INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            PRIMARY KEY (category, domain, field)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_url_memory_field
         ON url_memory(category, field)",
        [],
    )?;

    Ok(())
}

/// Whether the schema has been initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='component_lexicon'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}
