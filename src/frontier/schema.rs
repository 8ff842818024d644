//! SQLite schema for the frontier store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the frontier schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

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
        "CREATE TABLE IF NOT EXISTS frontier_urls (
            url TEXT PRIMARY KEY,
            last_status INTEGER,
            fetch_count INTEGER NOT NULL DEFAULT 0,
            bytes INTEGER NOT NULL DEFAULT 0,
            cooldown_until TEXT,
            cooldown_reason TEXT,
            consecutive_403 INTEGER NOT NULL DEFAULT 0,
            path_dead_score REAL NOT NULL DEFAULT 0,
            fields_yielded TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS frontier_paths (
            host TEXT NOT NULL,
            parent_path TEXT NOT NULL,
            notfound_streak INTEGER NOT NULL DEFAULT 0,
            dead INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (host, parent_path)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS frontier_queries (
            product_id TEXT NOT NULL,
            query_hash TEXT NOT NULL,
            provider TEXT NOT NULL,
            last_run_at TEXT NOT NULL,
            PRIMARY KEY (product_id, query_hash, provider)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS frontier_yield (
            url TEXT NOT NULL,
            field_key TEXT NOT NULL,
            value_hash TEXT NOT NULL,
            confidence REAL NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (url, field_key, value_hash)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_frontier_urls_cooldown
         ON frontier_urls(cooldown_until)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_frontier_yield_field
         ON frontier_yield(field_key)",
        [],
    )?;

    Ok(())
}

/// Whether the schema has been initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='frontier_urls'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}
