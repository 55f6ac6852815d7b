use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. `executions` carries no foreign key: the scheduler deletes a
/// task's history itself when the task is removed.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id               TEXT    NOT NULL PRIMARY KEY,
            name             TEXT    NOT NULL,
            command          TEXT    NOT NULL,
            cron_expression  TEXT,              -- NULL unless cron-scheduled
            interval_seconds INTEGER,           -- NULL unless interval-scheduled
            timeout_seconds  INTEGER NOT NULL,
            max_retries      INTEGER NOT NULL DEFAULT 0,
            enabled          INTEGER NOT NULL DEFAULT 1,
            last_run_at      TEXT,
            next_run_at      TEXT,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS executions (
            id            TEXT    NOT NULL PRIMARY KEY,
            task_id       TEXT    NOT NULL,
            task_name     TEXT    NOT NULL,
            command       TEXT    NOT NULL,
            status        TEXT    NOT NULL,
            attempts      INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT    NOT NULL,
            started_at    TEXT,
            ended_at      TEXT,
            exit_code     INTEGER,
            stdout        TEXT    NOT NULL DEFAULT '',
            stderr        TEXT    NOT NULL DEFAULT '',
            error_message TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_executions_created ON executions (created_at);
        ",
    )?;
    Ok(())
}
