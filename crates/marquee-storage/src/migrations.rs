//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use marquee_core::error::MarqueeError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), MarqueeError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| MarqueeError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| MarqueeError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: index_entries");
    }

    Ok(())
}

/// Version 1: one table holds both collections, keyed by (collection, entry key).
///
/// `seq` records first-insertion order and survives overwrites so that ties
/// in similarity stay stable across restarts.
fn apply_v1(conn: &Connection) -> Result<(), MarqueeError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS index_entries (
            collection  TEXT NOT NULL CHECK (collection IN ('text', 'visual')),
            entry_key   TEXT NOT NULL,
            record_id   TEXT NOT NULL,
            seq         INTEGER NOT NULL,
            dimensions  INTEGER NOT NULL,
            vector      BLOB NOT NULL,
            metadata    TEXT NOT NULL,
            document    TEXT NOT NULL DEFAULT '',
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (collection, entry_key)
        );

        CREATE INDEX IF NOT EXISTS idx_index_entries_seq
            ON index_entries (collection, seq);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'index_entries');
        ",
    )
    .map_err(|e| MarqueeError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
