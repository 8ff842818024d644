//! SQLite schema for review state and component identities.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the review-state schema.
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
        "CREATE TABLE IF NOT EXISTS key_review_state (
            category TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            field_key TEXT NOT NULL,
            subject TEXT NOT NULL,
            property_key TEXT NOT NULL DEFAULT '',
            selected_value TEXT,
            selected_candidate_id TEXT,
            ai_confirm_shared_status TEXT NOT NULL DEFAULT 'pending',
            user_accept_shared_status TEXT,
            enum_policy TEXT,
            needs_review INTEGER NOT NULL DEFAULT 0,
            manual INTEGER NOT NULL DEFAULT 0,
            overridden INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (category, target_kind, field_key, subject, property_key)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_identities (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            display_name TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '[]',
            links TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS identity_values (
            identity_id TEXT NOT NULL,
            property_key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (identity_id, property_key),
            FOREIGN KEY (identity_id) REFERENCES component_identities(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_review_state_field
         ON key_review_state(category, field_key)",
        [],
    )?;

    Ok(())
}

/// Whether the schema has been initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='key_review_state'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}
