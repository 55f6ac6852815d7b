use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Conflicting schedule fields, unparsable cron or non-positive interval.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A task field is out of bounds (empty name, timeout, retries).
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// An execution of this task is already in flight.
    #[error("Task {task_id} is already running")]
    AlreadyRunning { task_id: String },

    /// A thread panicked while holding the task registry. The in-memory
    /// schedule can no longer be trusted.
    #[error("Task registry is poisoned")]
    RegistryPoisoned,
}

impl SchedulerError {
    /// Stable short code for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SchedulerError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SchedulerError::RegistryPoisoned => "REGISTRY_POISONED",
        }
    }

    /// Caller mistakes, as opposed to failures of the scheduler itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidSchedule(_) | SchedulerError::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
