//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            target_name TEXT NOT NULL,
            job_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            job_logs_json TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_executions_target ON executions(target_name);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

        CREATE TABLE IF NOT EXISTS measurements (
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL UNIQUE,
            task_name TEXT NOT NULL,
            stored_at INTEGER NOT NULL,
            task_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_measurements_task ON measurements(task_name);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}
