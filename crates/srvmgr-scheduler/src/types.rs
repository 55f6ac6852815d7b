use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use srvmgr_core::config::MAX_TASK_TIMEOUT_SECS;
use srvmgr_core::{ExecutionId, TaskId};
use srvmgr_executor::{ExecStatus, ExecutionResult};

use crate::error::{Result, SchedulerError};
use crate::schedule::parse_schedule;

/// Upper bound on `max_retries`.
pub const MAX_RETRIES: u32 = 10;

/// Default number of history rows returned by a query.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Validated trigger of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Never fires on its own; runs only through `execute_now`.
    Manual,

    /// Six-field cron expression (sec min hour dom month dow), evaluated in
    /// the scheduler's timezone.
    Cron { expression: String },

    /// Every N seconds.
    Interval { seconds: u64 },
}

impl Schedule {
    pub fn is_manual(&self) -> bool {
        matches!(self, Schedule::Manual)
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Schedule::Cron { expression } => Some(expression),
            _ => None,
        }
    }

    pub fn interval_seconds(&self) -> Option<u64> {
        match self {
            Schedule::Interval { seconds } => Some(*seconds),
            _ => None,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Manual => write!(f, "manual"),
            Schedule::Cron { expression } => write!(f, "cron '{expression}'"),
            Schedule::Interval { seconds } => write!(f, "every {seconds}s"),
        }
    }
}

/// Scheduling fields as a caller submits them: at most one may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
}

impl ScheduleSpec {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron_expression: Some(expression.into()),
            interval_seconds: None,
        }
    }

    pub fn every(seconds: i64) -> Self {
        Self {
            cron_expression: None,
            interval_seconds: Some(seconds),
        }
    }
}

impl From<&Schedule> for ScheduleSpec {
    fn from(schedule: &Schedule) -> Self {
        Self {
            cron_expression: schedule.cron_expression().map(String::from),
            interval_seconds: schedule.interval_seconds().map(|s| s as i64),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A persisted shell task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Script text passed to `<shell> -c`.
    pub command: String,
    pub schedule: Schedule,
    pub timeout_seconds: u64,
    /// Extra attempts after a failed run.
    pub max_retries: u32,
    pub enabled: bool,
    /// Start of the most recent execution.
    pub last_run_at: Option<DateTime<Utc>>,
    /// `None` while disabled or manual-only.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub command: String,
    #[serde(default, flatten)]
    pub schedule: ScheduleSpec,
    /// `None` uses the configured default.
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl NewTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>, schedule: ScheduleSpec) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            schedule,
            timeout_seconds: None,
            max_retries: 0,
            enabled: true,
        }
    }
}

/// Partial update; `None` keeps the current value. A present `schedule`
/// replaces both scheduling fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub command: Option<String>,
    pub schedule: Option<ScheduleSpec>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub enabled: Option<bool>,
}

/// Fields of a task after trimming and bounds checks.
#[derive(Debug, Clone)]
pub(crate) struct ValidTask {
    pub name: String,
    pub command: String,
    pub schedule: Schedule,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

pub(crate) fn validate_task(
    name: &str,
    command: &str,
    schedule: &ScheduleSpec,
    timeout_seconds: u64,
    max_retries: u32,
) -> Result<ValidTask> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SchedulerError::Validation("task name is required".into()));
    }
    if command.trim().is_empty() {
        return Err(SchedulerError::Validation("command is required".into()));
    }
    if !(1..=MAX_TASK_TIMEOUT_SECS).contains(&timeout_seconds) {
        return Err(SchedulerError::Validation(format!(
            "timeout_seconds must be within 1..={MAX_TASK_TIMEOUT_SECS}, got {timeout_seconds}"
        )));
    }
    if max_retries > MAX_RETRIES {
        return Err(SchedulerError::Validation(format!(
            "max_retries must be at most {MAX_RETRIES}, got {max_retries}"
        )));
    }
    Ok(ValidTask {
        name: name.to_string(),
        command: command.to_string(),
        schedule: parse_schedule(schedule)?,
        timeout_seconds,
        max_retries,
    })
}

// ---------------------------------------------------------------------------
// Runtime status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRuntimeStatus {
    Disabled,
    EnabledStopped,
    EnabledRunning,
}

impl TaskRuntimeStatus {
    /// A disabled task may still be running from a manual trigger; it is
    /// reported as disabled.
    pub fn of(enabled: bool, running: bool) -> Self {
        match (enabled, running) {
            (false, _) => TaskRuntimeStatus::Disabled,
            (true, false) => TaskRuntimeStatus::EnabledStopped,
            (true, true) => TaskRuntimeStatus::EnabledRunning,
        }
    }
}

impl std::fmt::Display for TaskRuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskRuntimeStatus::Disabled => "disabled",
            TaskRuntimeStatus::EnabledStopped => "enabled_stopped",
            TaskRuntimeStatus::EnabledRunning => "enabled_running",
        };
        write!(f, "{s}")
    }
}

/// A task together with its live state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub running: bool,
    pub runtime_status: TaskRuntimeStatus,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Dispatched, waiting for a worker slot.
    Pending,
    Running,
    Success,
    Failure,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failure" => Ok(ExecutionStatus::Failure),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

impl From<ExecStatus> for ExecutionStatus {
    fn from(status: ExecStatus) -> Self {
        match status {
            ExecStatus::Success => ExecutionStatus::Success,
            ExecStatus::Failure => ExecutionStatus::Failure,
        }
    }
}

/// One run of a task (all of its attempts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    /// Task name at dispatch time.
    pub task_name: String,
    /// Command text at dispatch time.
    pub command: String,
    pub status: ExecutionStatus,
    /// Attempts made so far; the stored outcome is the last one's.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
}

impl Execution {
    /// A fresh `pending` record for `task`.
    pub fn pending(task: &Task, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            command: task.command.clone(),
            status: ExecutionStatus::Pending,
            attempts: 0,
            created_at,
            started_at: None,
            ended_at: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Final outcome written by `ExecutionStore::complete`.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub ended_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
}

impl Completion {
    pub fn from_result(result: ExecutionResult, attempts: u32) -> Self {
        Self {
            status: result.status.into(),
            attempts,
            ended_at: result.ended_at,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            error_message: result.error_message,
        }
    }

    /// Failure that happened outside the command itself.
    pub fn infrastructure_failure(message: impl Into<String>, ended_at: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            attempts: 0,
            ended_at,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error_message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// History queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    StartedAt,
    TaskName,
    Status,
}

impl SortKey {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at",
            SortKey::StartedAt => "started_at",
            SortKey::TaskName => "task_name COLLATE NOCASE",
            SortKey::Status => "status",
        }
    }
}

impl std::str::FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(SortKey::CreatedAt),
            "started_at" => Ok(SortKey::StartedAt),
            "task_name" => Ok(SortKey::TaskName),
            "status" => Ok(SortKey::Status),
            other => Err(format!("unknown sort key: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// History lookup. Free text matches task name, command, stdout and stderr
/// case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub task_id: Option<TaskId>,
    pub search: Option<String>,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            task_id: None,
            search: None,
            sort: SortKey::default(),
            order: SortOrder::default(),
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ExecutionQuery {
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }
}

/// Selects records to delete. Every set field must match; an empty filter
/// matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub task_id: Option<TaskId>,
    pub task_name: Option<String>,
    pub search: Option<String>,
    /// Created strictly before this instant.
    pub older_than: Option<DateTime<Utc>>,
    /// Leave `pending`/`running` records alone.
    #[serde(default)]
    pub finished_only: bool,
}

impl ExecutionFilter {
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task_id.is_none()
            && self.task_name.is_none()
            && self.search.is_none()
            && self.older_than.is_none()
            && !self.finished_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_status_mapping() {
        assert_eq!(TaskRuntimeStatus::of(false, true), TaskRuntimeStatus::Disabled);
        assert_eq!(TaskRuntimeStatus::of(true, false), TaskRuntimeStatus::EnabledStopped);
        assert_eq!(TaskRuntimeStatus::of(true, true), TaskRuntimeStatus::EnabledRunning);
        assert_eq!(TaskRuntimeStatus::EnabledRunning.to_string(), "enabled_running");
    }

    #[test]
    fn task_bounds_are_enforced() {
        let spec = ScheduleSpec::manual();
        assert!(validate_task("t", "true", &spec, 300, 0).is_ok());
        assert!(matches!(validate_task(" ", "true", &spec, 300, 0), Err(SchedulerError::Validation(_))));
        assert!(matches!(validate_task("t", "  ", &spec, 300, 0), Err(SchedulerError::Validation(_))));
        assert!(matches!(validate_task("t", "true", &spec, 0, 0), Err(SchedulerError::Validation(_))));
        assert!(matches!(validate_task("t", "true", &spec, 3601, 0), Err(SchedulerError::Validation(_))));
        assert!(matches!(validate_task("t", "true", &spec, 60, 11), Err(SchedulerError::Validation(_))));
    }

    #[test]
    fn new_task_deserializes_flat_schedule_fields() {
        let task: NewTask = serde_json::from_str(
            r#"{"name":"backup","command":"tar czf /tmp/x.tgz .","interval_seconds":60}"#,
        )
        .unwrap();
        assert_eq!(task.schedule, ScheduleSpec::every(60));
        assert!(task.enabled);
        assert_eq!(task.timeout_seconds, None);
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
