//! `srvmgr-scheduler`: shell task scheduling with SQLite-backed history.
//!
//! # Overview
//!
//! Tasks live in the `tasks` table and, once loaded, in the in-memory
//! registry of [`engine::Scheduler`]. The scheduler ticks every second,
//! dispatches due tasks to a bounded worker pool and records each run in the
//! `executions` table through the [`store::ExecutionStore`] trait.
//!
//! At most one execution per task is ever in flight. A fire that comes due
//! while the previous run is still going is dropped (coalesced), and
//! `execute_now` on a running task fails with
//! [`SchedulerError::AlreadyRunning`].
//!
//! Other processes may edit the task table directly; a running scheduler
//! folds their changes in through [`engine::Scheduler::sync_tasks`].
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                                |
//! |------------|----------------------------------------------------------|
//! | `Manual`   | Never fires on its own                                   |
//! | `Interval` | Every N seconds, phase kept across missed fires          |
//! | `Cron`     | Six-field cron expression in the configured timezone     |

pub mod db;
pub mod engine;
pub mod error;
pub mod retention;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{Scheduler, SchedulerOptions, INTERRUPTED_MESSAGE};
pub use error::{Result, SchedulerError};
pub use retention::RetentionPolicy;
pub use store::{Admission, ExecutionStore, SqliteExecutionStore, TaskStore};
pub use types::{
    Execution, ExecutionFilter, ExecutionQuery, ExecutionStatus, NewTask, Schedule, ScheduleSpec,
    SortKey, SortOrder, Task, TaskRuntimeStatus, TaskUpdate, TaskView,
};
