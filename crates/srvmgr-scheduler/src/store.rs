//! SQLite persistence for tasks and execution history.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, instrument};

use srvmgr_core::time::{format_ts, parse_ts};
use srvmgr_core::{ExecutionId, TaskId};

use crate::error::{Result, SchedulerError};
use crate::types::{
    Completion, Execution, ExecutionFilter, ExecutionQuery, ExecutionStatus, Schedule, Task,
};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, name, command, cron_expression, interval_seconds, timeout_seconds,
     max_retries, enabled, last_run_at, next_run_at, created_at, updated_at";

pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    /// Wrap a connection that has been through `db::init_db`.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, name = %task.name))]
    pub fn create(&self, task: &Task) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"),
            rusqlite::params![
                task.id.as_str(),
                task.name,
                task.command,
                task.schedule.cron_expression(),
                task.schedule.interval_seconds().map(|s| s as i64),
                task.timeout_seconds as i64,
                task.max_retries as i64,
                task.enabled,
                task.last_run_at.as_ref().map(format_ts),
                task.next_run_at.as_ref().map(format_ts),
                format_ts(&task.created_at),
                format_ts(&task.updated_at),
            ],
        )?;
        debug!("task inserted");
        Ok(())
    }

    /// Overwrite every mutable column of an existing task.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub fn update(&self, task: &Task) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE tasks SET name=?2, command=?3, cron_expression=?4, interval_seconds=?5,
                 timeout_seconds=?6, max_retries=?7, enabled=?8, last_run_at=?9,
                 next_run_at=?10, updated_at=?11
             WHERE id=?1",
            rusqlite::params![
                task.id.as_str(),
                task.name,
                task.command,
                task.schedule.cron_expression(),
                task.schedule.interval_seconds().map(|s| s as i64),
                task.timeout_seconds as i64,
                task.max_retries as i64,
                task.enabled,
                task.last_run_at.as_ref().map(format_ts),
                task.next_run_at.as_ref().map(format_ts),
                format_ts(&task.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound {
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    /// Persist the scheduler-owned timestamps only. A missing row is not an
    /// error: the task may have been removed while it was running.
    pub fn set_run_times(
        &self,
        id: &TaskId,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE tasks SET last_run_at=?2, next_run_at=?3 WHERE id=?1",
            rusqlite::params![
                id.as_str(),
                last_run_at.as_ref().map(format_ts),
                next_run_at.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let db = self.db.lock().unwrap();
        let task = db
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id.as_str()],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// All tasks ordered by creation time.
    pub fn list(&self) -> Result<Vec<Task>> {
        self.select("")
    }

    pub fn list_enabled(&self) -> Result<Vec<Task>> {
        self.select("WHERE enabled = 1")
    }

    fn select(&self, clause: &str) -> Result<Vec<Task>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks {clause} ORDER BY created_at"))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Returns `false` when the row did not exist.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn delete(&self, id: &TaskId) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM tasks WHERE id = ?1", [id.as_str()])?;
        Ok(n > 0)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let cron: Option<String> = row.get(3)?;
    let interval: Option<i64> = row.get(4)?;
    let schedule = match (cron, interval) {
        (Some(expression), _) => Schedule::Cron { expression },
        (None, Some(seconds)) => Schedule::Interval {
            seconds: seconds.max(1) as u64,
        },
        (None, None) => Schedule::Manual,
    };
    Ok(Task {
        id: TaskId(row.get(0)?),
        name: row.get(1)?,
        command: row.get(2)?,
        schedule,
        timeout_seconds: row.get::<_, i64>(5)?.max(1) as u64,
        max_retries: row.get::<_, i64>(6)?.max(0) as u32,
        enabled: row.get(7)?,
        last_run_at: opt_ts_column(row, 8)?,
        next_run_at: opt_ts_column(row, 9)?,
        created_at: ts_column(row, 10)?,
        updated_at: ts_column(row, 11)?,
    })
}

fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Outcome of [`ExecutionStore::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Created,
    /// The task already has a pending or running record.
    AlreadyActive,
    /// The task row no longer exists.
    TaskMissing,
}

/// Execution history as the scheduler needs it.
///
/// Implementations must tolerate concurrent calls from parallel workers and
/// from other processes sharing the same storage. `complete` must finalize a
/// record at most once.
pub trait ExecutionStore: Send + Sync {
    /// Insert a record as-is, without any admission check.
    fn create(&self, execution: &Execution) -> Result<()>;

    /// Insert a fresh pending record if its task still exists and has no
    /// pending or running record. The check and the insert are one atomic
    /// step for every process using the store.
    fn admit(&self, execution: &Execution) -> Result<Admission>;

    /// Tasks with a pending or running record, whichever process owns it.
    fn active_task_ids(&self) -> Result<Vec<TaskId>>;

    /// `pending` → `running`. Returns `false` if the record is gone or no
    /// longer pending.
    fn mark_running(&self, id: &ExecutionId, started_at: DateTime<Utc>) -> Result<bool>;

    /// Write the final outcome. Returns `false` if the record is gone or was
    /// already finalized.
    fn complete(&self, id: &ExecutionId, completion: &Completion) -> Result<bool>;

    fn get(&self, id: &ExecutionId) -> Result<Option<Execution>>;

    fn list(&self, query: &ExecutionQuery) -> Result<Vec<Execution>>;

    /// Delete matching records and return how many went.
    fn delete(&self, filter: &ExecutionFilter) -> Result<usize>;

    /// Finalize every non-terminal record as a failure with `message`.
    fn fail_incomplete(&self, message: &str, at: DateTime<Utc>) -> Result<usize>;
}

const EXECUTION_COLUMNS: &str = "id, task_id, task_name, command, status, attempts, created_at,
     started_at, ended_at, exit_code, stdout, stderr, error_message";

pub struct SqliteExecutionStore {
    db: Mutex<Connection>,
}

impl SqliteExecutionStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }
}

/// SQL fragment plus its positional parameters.
struct WhereClause {
    sql: String,
    params: Vec<String>,
}

impl WhereClause {
    fn build(
        task_id: Option<&TaskId>,
        task_name: Option<&str>,
        search: Option<&str>,
        older_than: Option<&DateTime<Utc>>,
        finished_only: bool,
    ) -> Self {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(id) = task_id {
            params.push(id.to_string());
            conditions.push(format!("task_id = ?{}", params.len()));
        }
        if let Some(name) = task_name {
            params.push(name.to_string());
            conditions.push(format!("task_name = ?{}", params.len()));
        }
        if let Some(text) = search.map(str::trim).filter(|s| !s.is_empty()) {
            params.push(format!("%{}%", escape_like(text)));
            let n = params.len();
            conditions.push(format!(
                "(task_name LIKE ?{n} ESCAPE '\\' OR command LIKE ?{n} ESCAPE '\\' \
                  OR stdout LIKE ?{n} ESCAPE '\\' OR stderr LIKE ?{n} ESCAPE '\\')"
            ));
        }
        if let Some(cutoff) = older_than {
            params.push(format_ts(cutoff));
            conditions.push(format!("created_at < ?{}", params.len()));
        }
        if finished_only {
            conditions.push("status IN ('success', 'failure')".to_string());
        }

        let sql = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        Self { sql, params }
    }
}

/// LIKE is case-insensitive for ASCII in SQLite; only the wildcards need escaping.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn insert_execution(conn: &Connection, execution: &Execution) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO executions ({EXECUTION_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
        ),
        rusqlite::params![
            execution.id.as_str(),
            execution.task_id.as_str(),
            execution.task_name,
            execution.command,
            execution.status.as_str(),
            execution.attempts as i64,
            format_ts(&execution.created_at),
            execution.started_at.as_ref().map(format_ts),
            execution.ended_at.as_ref().map(format_ts),
            execution.exit_code,
            execution.stdout,
            execution.stderr,
            execution.error_message,
        ],
    )?;
    Ok(())
}

impl ExecutionStore for SqliteExecutionStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, task_id = %execution.task_id))]
    fn create(&self, execution: &Execution) -> Result<()> {
        let db = self.db.lock().unwrap();
        insert_execution(&db, execution)
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id, task_id = %execution.task_id))]
    fn admit(&self, execution: &Execution) -> Result<Admission> {
        let mut db = self.db.lock().unwrap();
        // IMMEDIATE takes the write lock up front, so no other connection can
        // slip a record in between the checks and the insert.
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task_id = execution.task_id.as_str();

        let task_exists: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM tasks WHERE id = ?1)",
            [task_id],
            |row| row.get(0),
        )?;
        if !task_exists {
            debug!("task row gone, execution refused");
            return Ok(Admission::TaskMissing);
        }
        let active: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM executions
                            WHERE task_id = ?1 AND status IN ('pending', 'running'))",
            [task_id],
            |row| row.get(0),
        )?;
        if active {
            debug!("task already has an unfinished execution, execution refused");
            return Ok(Admission::AlreadyActive);
        }

        insert_execution(&tx, execution)?;
        tx.commit()?;
        Ok(Admission::Created)
    }

    fn active_task_ids(&self) -> Result<Vec<TaskId>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT DISTINCT task_id FROM executions WHERE status IN ('pending', 'running')",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0).map(TaskId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn mark_running(&self, id: &ExecutionId, started_at: DateTime<Utc>) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE executions SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![id.as_str(), format_ts(&started_at)],
        )?;
        Ok(n > 0)
    }

    #[instrument(skip(self, completion), fields(execution_id = %id, status = %completion.status))]
    fn complete(&self, id: &ExecutionId, completion: &Completion) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE executions
             SET status = ?2, attempts = ?3, ended_at = ?4, exit_code = ?5,
                 stdout = ?6, stderr = ?7, error_message = ?8,
                 started_at = COALESCE(started_at, ?4)
             WHERE id = ?1 AND status IN ('pending', 'running')",
            rusqlite::params![
                id.as_str(),
                completion.status.as_str(),
                completion.attempts as i64,
                format_ts(&completion.ended_at),
                completion.exit_code,
                completion.stdout,
                completion.stderr,
                completion.error_message,
            ],
        )?;
        Ok(n > 0)
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        let db = self.db.lock().unwrap();
        let execution = db
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                [id.as_str()],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    fn list(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        let clause = WhereClause::build(
            query.task_id.as_ref(),
            None,
            query.search.as_deref(),
            None,
            false,
        );
        let order = query.order.sql();
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions {} ORDER BY {} {order}, id {order} LIMIT {}",
            clause.sql,
            query.sort.column(),
            query.limit
        );

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(clause.params.iter()), row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    fn delete(&self, filter: &ExecutionFilter) -> Result<usize> {
        let clause = WhereClause::build(
            filter.task_id.as_ref(),
            filter.task_name.as_deref(),
            filter.search.as_deref(),
            filter.older_than.as_ref(),
            filter.finished_only,
        );
        let db = self.db.lock().unwrap();
        let n = db.execute(
            &format!("DELETE FROM executions {}", clause.sql),
            rusqlite::params_from_iter(clause.params.iter()),
        )?;
        debug!(deleted = n, "executions deleted");
        Ok(n)
    }

    fn fail_incomplete(&self, message: &str, at: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE executions
             SET status = 'failure', ended_at = ?2, error_message = ?1
             WHERE status IN ('pending', 'running')",
            rusqlite::params![message, format_ts(&at)],
        )?;
        Ok(n)
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(4)?;
    let status: ExecutionStatus = status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into())
    })?;
    Ok(Execution {
        id: ExecutionId(row.get(0)?),
        task_id: TaskId(row.get(1)?),
        task_name: row.get(2)?,
        command: row.get(3)?,
        status,
        attempts: row.get::<_, i64>(5)?.max(0) as u32,
        created_at: ts_column(row, 6)?,
        started_at: opt_ts_column(row, 7)?,
        ended_at: opt_ts_column(row, 8)?,
        exit_code: row.get(9)?,
        stdout: row.get(10)?,
        stderr: row.get(11)?,
        error_message: row.get(12)?,
    })
}
