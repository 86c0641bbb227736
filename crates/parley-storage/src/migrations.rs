//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use parley_core::error::ParleyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ParleyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ParleyError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ParleyError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: kv_entries");
    }

    Ok(())
}

/// Version 1: namespaced key-value cache.
fn apply_v1(conn: &Connection) -> Result<(), ParleyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_entries (
            namespace   TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'kv_entries');
        ",
    )
    .map_err(|e| ParleyError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
