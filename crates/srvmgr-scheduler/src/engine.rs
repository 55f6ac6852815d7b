use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use srvmgr_core::config::{SchedulerConfig, DEFAULT_TASK_TIMEOUT_SECS};
use srvmgr_core::time;
use srvmgr_core::{ExecutionId, TaskId};
use srvmgr_executor::CommandExecutor;

use crate::{
    error::{Result, SchedulerError},
    schedule::{compute_next_run, next_after, validate_schedule},
    store::{Admission, ExecutionStore, TaskStore},
    types::{
        validate_task, Completion, Execution, ExecutionFilter, ExecutionQuery, NewTask,
        ScheduleSpec, Task, TaskRuntimeStatus, TaskUpdate, TaskView,
    },
};

/// Recorded on executions that were pending or running when the process died.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Tunables for [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Timezone for cron evaluation.
    pub timezone: Tz,
    /// Size of the worker pool shared by all tasks.
    pub max_workers: usize,
    /// Pause between a failed attempt and its retry.
    pub retry_delay: Duration,
    /// Used when a new task does not specify a timeout.
    pub default_timeout_secs: u64,
    /// Cadence of [`Scheduler::run`].
    pub tick_interval: Duration,
    /// How often `run` re-reads the task table to pick up changes made by
    /// other processes. `None` never re-reads.
    pub sync_interval: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            max_workers: 4,
            retry_delay: Duration::ZERO,
            default_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            tick_interval: Duration::from_secs(1),
            sync_interval: None,
        }
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig, default_timeout_secs: u64) -> srvmgr_core::Result<Self> {
        Ok(Self {
            timezone: config.tz()?,
            max_workers: config.max_workers.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            default_timeout_secs,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            sync_interval: (config.sync_interval_secs > 0)
                .then(|| Duration::from_secs(config.sync_interval_secs)),
        })
    }
}

/// In-memory schedule. Guarded by a single mutex: every mutation of
/// `next_run_at`/`enabled` and every in-flight check-and-set happens under it.
#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, Task>,
    in_flight: HashSet<TaskId>,
}

struct Inner {
    tasks: TaskStore,
    executions: Arc<dyn ExecutionStore>,
    executor: CommandExecutor,
    registry: Mutex<Registry>,
    workers: Arc<Semaphore>,
    idle: Notify,
    options: SchedulerOptions,
}

/// Owns the set of active tasks and dispatches their executions.
///
/// Cheap to clone; every clone drives the same registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Clears a task's in-flight flag when the execution path ends, however it ends.
struct InFlightGuard {
    inner: Arc<Inner>,
    task_id: TaskId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.in_flight.remove(&self.task_id);
        if registry.in_flight.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Scheduler {
    pub fn new(
        tasks: TaskStore,
        executions: Arc<dyn ExecutionStore>,
        executor: CommandExecutor,
        options: SchedulerOptions,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(options.max_workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                tasks,
                executions,
                executor,
                registry: Mutex::new(Registry::default()),
                workers,
                idle: Notify::new(),
                options,
            }),
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.inner
            .registry
            .lock()
            .map_err(|_| SchedulerError::RegistryPoisoned)
    }

    fn tz(&self) -> Tz {
        self.inner.options.timezone
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    // --- startup -----------------------------------------------------------

    /// Recover from a previous run, then register every stored task.
    pub fn load(&self) -> Result<usize> {
        self.recover_interrupted();
        self.load_tasks()
    }

    /// Fail executions left pending/running by a previous process.
    ///
    /// Only the daemon may call this: a second process sharing the database
    /// would fail runs that are in fact still going.
    pub fn recover_interrupted(&self) -> usize {
        match self
            .inner
            .executions
            .fail_incomplete(INTERRUPTED_MESSAGE, time::now())
        {
            Ok(n) => {
                if n > 0 {
                    warn!(count = n, "executions interrupted by restart marked failed");
                }
                n
            }
            Err(e) => {
                error!("failed to mark interrupted executions: {e}");
                0
            }
        }
    }

    /// Register every stored task and write back the fire times computed
    /// for them.
    ///
    /// Fire times that passed while nothing was running are not replayed;
    /// each enabled task gets its next future slot. Tasks whose stored
    /// schedule no longer validates are skipped with a warning.
    pub fn load_tasks(&self) -> Result<usize> {
        self.load_stored(true)
    }

    /// Register every stored task without writing anything back.
    ///
    /// For short-lived processes working next to a running daemon: the
    /// daemon owns `next_run_at`, and rewriting it from here would move
    /// fires the daemon has already scheduled.
    pub fn attach_tasks(&self) -> Result<usize> {
        self.load_stored(false)
    }

    fn load_stored(&self, persist: bool) -> Result<usize> {
        let now = time::now();
        let mut loaded = 0;
        for mut task in self.inner.tasks.list()? {
            if !task.enabled {
                task.next_run_at = None;
            } else if task.next_run_at.is_some_and(|next| next <= now) {
                task.next_run_at = compute_next_run(&task.schedule, now, self.tz());
            }
            match self.install(task, persist) {
                Ok(_) => loaded += 1,
                Err(e) if e.is_validation() => {
                    warn!("skipping stored task with invalid schedule: {e}")
                }
                Err(e) => return Err(e),
            }
        }
        info!(count = loaded, persist, "tasks loaded");
        Ok(loaded)
    }

    /// Reconcile the registry with the task table.
    ///
    /// Picks up tasks created, edited, toggled or removed by another process.
    /// A stored task whose `updated_at` matches the registered copy is left
    /// alone, and an edit that keeps the schedule and enabled flag keeps the
    /// registered fire times. Returns the number of tasks added, changed or
    /// dropped.
    pub fn sync_tasks(&self) -> Result<usize> {
        let stored = self.inner.tasks.list()?;
        let mut changed = 0;
        let mut to_register = Vec::new();
        {
            let mut registry = self.registry()?;
            let known: HashSet<&TaskId> = stored.iter().map(|t| &t.id).collect();
            let before = registry.tasks.len();
            registry.tasks.retain(|id, _| known.contains(id));
            changed += before - registry.tasks.len();

            for task in &stored {
                match registry.tasks.get_mut(&task.id) {
                    Some(current) if current.updated_at == task.updated_at => {}
                    Some(current)
                        if current.schedule == task.schedule && current.enabled == task.enabled =>
                    {
                        *current = Task {
                            last_run_at: current.last_run_at,
                            next_run_at: current.next_run_at,
                            ..task.clone()
                        };
                        changed += 1;
                    }
                    _ => to_register.push(task.clone()),
                }
            }
        }

        for task in to_register {
            let task_id = task.id.clone();
            match self.register(task) {
                Ok(_) => changed += 1,
                Err(e) if e.is_validation() => {
                    warn!(task_id = %task_id, "skipping stored task with invalid schedule: {e}")
                }
                Err(e) => return Err(e),
            }
        }
        if changed > 0 {
            info!(changed, "task registry synchronized with database");
        }
        Ok(changed)
    }

    // --- registry management ----------------------------------------------

    /// Put `task` under scheduler control.
    ///
    /// The schedule is re-validated. An enabled task without a future
    /// `next_run_at` gets one computed from now. Replaces any previous
    /// registration of the same id while keeping its in-flight state.
    pub fn register(&self, task: Task) -> Result<Task> {
        self.install(task, true)
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, name = %task.name))]
    fn install(&self, mut task: Task, persist: bool) -> Result<Task> {
        validate_schedule(&task.schedule)?;
        let now = time::now();
        task.next_run_at = if task.enabled {
            task.next_run_at
                .filter(|next| *next > now)
                .or_else(|| compute_next_run(&task.schedule, now, self.tz()))
        } else {
            None
        };

        self.registry()?.tasks.insert(task.id.clone(), task.clone());
        if persist {
            self.persist_run_times(&task);
        }
        debug!(schedule = %task.schedule, next_run_at = ?task.next_run_at, "task registered");
        Ok(task)
    }

    /// Stop scheduling a task. No-op if it is not registered; a running
    /// execution is left to finish.
    pub fn unregister(&self, task_id: &TaskId) -> Result<()> {
        if self.registry()?.tasks.remove(task_id).is_some() {
            debug!(task_id = %task_id, "task unregistered");
        }
        Ok(())
    }

    /// Validate, persist and register a new task.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        let valid = validate_task(
            &input.name,
            &input.command,
            &input.schedule,
            input.timeout_seconds.unwrap_or(self.inner.options.default_timeout_secs),
            input.max_retries,
        )?;
        let now = time::now();
        let task = Task {
            id: TaskId::new(),
            name: valid.name,
            command: valid.command,
            next_run_at: if input.enabled {
                compute_next_run(&valid.schedule, now, self.tz())
            } else {
                None
            },
            schedule: valid.schedule,
            timeout_seconds: valid.timeout_seconds,
            max_retries: valid.max_retries,
            enabled: input.enabled,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };

        self.inner.tasks.create(&task)?;
        let task = self.register(task)?;
        info!(task_id = %task.id, schedule = %task.schedule, "task created");
        Ok(task)
    }

    /// Apply a partial update. A changed schedule or a re-enable recomputes
    /// `next_run_at` from now.
    #[instrument(skip(self, update), fields(task_id = %task_id))]
    pub fn update_task(&self, task_id: &TaskId, update: TaskUpdate) -> Result<Task> {
        let current = self.get_task(task_id)?;
        let spec = update
            .schedule
            .clone()
            .unwrap_or_else(|| ScheduleSpec::from(&current.schedule));
        let valid = validate_task(
            update.name.as_deref().unwrap_or(&current.name),
            update.command.as_deref().unwrap_or(&current.command),
            &spec,
            update.timeout_seconds.unwrap_or(current.timeout_seconds),
            update.max_retries.unwrap_or(current.max_retries),
        )?;

        let enabled = update.enabled.unwrap_or(current.enabled);
        let reschedule = valid.schedule != current.schedule || (enabled && !current.enabled);
        let now = time::now();
        let next_run_at = match (enabled, reschedule) {
            (false, _) => None,
            (true, true) => compute_next_run(&valid.schedule, now, self.tz()),
            (true, false) => current.next_run_at,
        };

        let task = Task {
            name: valid.name,
            command: valid.command,
            schedule: valid.schedule,
            timeout_seconds: valid.timeout_seconds,
            max_retries: valid.max_retries,
            enabled,
            next_run_at,
            updated_at: now,
            ..current
        };
        self.inner.tasks.update(&task)?;
        let task = self.register(task)?;
        info!(schedule = %task.schedule, enabled, "task updated");
        Ok(task)
    }

    /// Unregister a task, delete the task row, then its execution history.
    ///
    /// The row goes first: once it is gone no process can admit a new
    /// execution of the task, so the history delete leaves nothing behind.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn remove_task(&self, task_id: &TaskId) -> Result<()> {
        let was_registered = self.registry()?.tasks.remove(task_id).is_some();
        let existed = self.inner.tasks.delete(task_id)?;
        let history = self
            .inner
            .executions
            .delete(&ExecutionFilter::for_task(task_id.clone()))?;
        if !existed && !was_registered {
            return Err(SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            });
        }
        info!(executions_deleted = history, "task removed");
        Ok(())
    }

    /// Flip `enabled` and return the new value.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn toggle(&self, task_id: &TaskId) -> Result<bool> {
        let now = time::now();
        let task = {
            let mut registry = self.registry()?;
            let task = registry
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    id: task_id.to_string(),
                })?;
            task.enabled = !task.enabled;
            task.next_run_at = if task.enabled {
                compute_next_run(&task.schedule, now, self.inner.options.timezone)
            } else {
                None
            };
            task.updated_at = now;
            task.clone()
        };
        self.inner.tasks.update(&task)?;
        info!(enabled = task.enabled, next_run_at = ?task.next_run_at, "task toggled");
        Ok(task.enabled)
    }

    // --- queries -----------------------------------------------------------

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        if let Some(task) = self.registry()?.tasks.get(task_id) {
            return Ok(task.clone());
        }
        self.inner
            .tasks
            .get(task_id)?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    /// Registered tasks ordered by name.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.registry()?.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(tasks)
    }

    /// Every registered task with its runtime status.
    pub fn task_views(&self) -> Result<Vec<TaskView>> {
        let running = self.running_task_ids()?;
        Ok(self
            .list_tasks()?
            .into_iter()
            .map(|task| {
                let is_running = running.contains(&task.id);
                TaskView {
                    runtime_status: TaskRuntimeStatus::of(task.enabled, is_running),
                    running: is_running,
                    task,
                }
            })
            .collect())
    }

    /// Whether the task has a run in flight here or in another process.
    pub fn is_running(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self.running_task_ids()?.contains(task_id))
    }

    /// Tasks with a run in flight, in this process or in any other process
    /// sharing the database.
    pub fn running_task_ids(&self) -> Result<Vec<TaskId>> {
        let mut running: HashSet<TaskId> = self.registry()?.in_flight.iter().cloned().collect();
        running.extend(self.inner.executions.active_task_ids()?);
        Ok(running.into_iter().collect())
    }

    pub fn history(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        self.inner.executions.list(query)
    }

    pub fn execution(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        self.inner.executions.get(id)
    }

    /// Delete matching history. An empty filter clears everything.
    pub fn clear_history(&self, filter: &ExecutionFilter) -> Result<usize> {
        let n = self.inner.executions.delete(filter)?;
        info!(deleted = n, "execution history cleared");
        Ok(n)
    }

    // --- dispatch ----------------------------------------------------------

    /// Run a task immediately, regardless of its schedule or enabled flag.
    ///
    /// Fails with `AlreadyRunning` if an execution of the task is in flight,
    /// here or in another process sharing the database.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn execute_now(&self, task_id: &TaskId) -> Result<ExecutionId> {
        let (task, guard) = {
            let mut registry = self.registry()?;
            let task = registry
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    id: task_id.to_string(),
                })?;
            if !registry.in_flight.insert(task_id.clone()) {
                return Err(SchedulerError::AlreadyRunning {
                    task_id: task_id.to_string(),
                });
            }
            (task, self.guard(task_id))
        };

        let id = self.dispatch(task, guard)?;
        info!(execution_id = %id, "manual execution dispatched");
        Ok(id)
    }

    /// Fire every enabled task that is due now.
    pub fn tick(&self) -> Result<Vec<ExecutionId>> {
        self.tick_at(time::now())
    }

    /// Fire every enabled task whose `next_run_at` is at or before `now`.
    ///
    /// A due task that is still running is coalesced: its fire is dropped
    /// and it moves to the next future slot. Errors are returned only when
    /// the registry itself is unusable.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let mut due = Vec::new();
        let mut rescheduled = Vec::new();
        {
            let mut registry = self.registry()?;
            let Registry { tasks, in_flight } = &mut *registry;
            for task in tasks.values_mut() {
                let Some(next) = task.next_run_at else {
                    continue;
                };
                if !task.enabled || next > now {
                    continue;
                }

                task.next_run_at = next_after(&task.schedule, next, now, self.tz());
                if in_flight.insert(task.id.clone()) {
                    due.push(task.clone());
                } else {
                    info!(
                        task_id = %task.id,
                        next_run_at = ?task.next_run_at,
                        "previous run still in flight, fire coalesced"
                    );
                }
                rescheduled.push(task.clone());
            }
        }

        for task in &rescheduled {
            self.persist_run_times(task);
        }

        let mut dispatched = Vec::with_capacity(due.len());
        for task in due {
            let guard = self.guard(&task.id);
            let task_id = task.id.clone();
            match self.dispatch(task, guard) {
                Ok(id) => dispatched.push(id),
                Err(SchedulerError::AlreadyRunning { .. }) => {
                    info!(task_id = %task_id, "running in another process, fire coalesced")
                }
                Err(SchedulerError::TaskNotFound { .. }) => {
                    info!(task_id = %task_id, "task removed by another process, fire dropped")
                }
                Err(e) => error!(task_id = %task_id, "failed to dispatch scheduled run: {e}"),
            }
        }
        Ok(dispatched)
    }

    fn guard(&self, task_id: &TaskId) -> InFlightGuard {
        InFlightGuard {
            inner: Arc::clone(&self.inner),
            task_id: task_id.clone(),
        }
    }

    /// Admit the pending record and hand the run to a worker. The in-flight
    /// flag is already set and is released by `guard`.
    ///
    /// Admission is what keeps a task single-instance across processes: a
    /// record is only created while the task row exists and no other pending
    /// or running record does.
    fn dispatch(&self, task: Task, guard: InFlightGuard) -> Result<ExecutionId> {
        let execution = Execution::pending(&task, time::now());
        match self.inner.executions.admit(&execution)? {
            Admission::Created => {}
            Admission::AlreadyActive => {
                return Err(SchedulerError::AlreadyRunning {
                    task_id: task.id.to_string(),
                })
            }
            Admission::TaskMissing => {
                self.unregister(&task.id)?;
                return Err(SchedulerError::TaskNotFound {
                    id: task.id.to_string(),
                });
            }
        }
        let id = execution.id.clone();

        let scheduler = self.clone();
        let execution_id = id.clone();
        tokio::spawn(async move {
            scheduler.run_execution(task, execution_id, guard).await;
        });
        Ok(id)
    }

    /// Worker body: wait for a pool slot, run with retries, record the outcome.
    #[instrument(skip(self, task, _guard), fields(task_id = %task.id, execution_id = %execution_id))]
    async fn run_execution(&self, task: Task, execution_id: ExecutionId, _guard: InFlightGuard) {
        let executions = &self.inner.executions;
        let _permit = match Arc::clone(&self.inner.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let completion = Completion::infrastructure_failure("worker pool closed", time::now());
                if let Err(e) = executions.complete(&execution_id, &completion) {
                    error!("failed to record execution: {e}");
                }
                return;
            }
        };

        let started_at = time::now();
        match executions.mark_running(&execution_id, started_at) {
            Ok(true) => {}
            Ok(false) => {
                info!("execution record removed before start, run skipped");
                return;
            }
            Err(e) => error!("failed to mark execution running: {e}"),
        }
        self.note_started(&task.id, started_at);
        info!(name = %task.name, "execution started");

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let result = self
                .inner
                .executor
                .run(&task.command, task.timeout_seconds)
                .await;
            if result.is_success() || attempts > task.max_retries {
                break result;
            }
            warn!(
                attempt = attempts,
                max_retries = task.max_retries,
                exit_code = ?result.exit_code,
                "attempt failed, retrying"
            );
            if !self.inner.options.retry_delay.is_zero() {
                tokio::time::sleep(self.inner.options.retry_delay).await;
            }
        };

        let completion = Completion::from_result(result, attempts);
        let status = completion.status;
        match executions.complete(&execution_id, &completion) {
            Ok(true) => info!(%status, attempts, exit_code = ?completion.exit_code, "execution finished"),
            Ok(false) => warn!(%status, "execution record already finalized or deleted"),
            Err(e) => error!(%status, "failed to record execution outcome: {e}"),
        }
    }

    /// Record the start of a run on the task.
    ///
    /// For interval tasks the next fire is pushed to at least one interval
    /// after this start, so a run delayed by a busy pool cannot be followed
    /// by another one sooner than the interval.
    fn note_started(&self, task_id: &TaskId, started_at: DateTime<Utc>) {
        let snapshot = {
            let mut registry = self
                .inner
                .registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(task) = registry.tasks.get_mut(task_id) else {
                return;
            };
            task.last_run_at = Some(started_at);
            if let (true, Some(seconds), Some(next)) =
                (task.enabled, task.schedule.interval_seconds(), task.next_run_at)
            {
                let earliest = started_at + chrono::Duration::seconds(seconds as i64);
                if next < earliest {
                    task.next_run_at = Some(earliest);
                }
            }
            task.clone()
        };
        self.persist_run_times(&snapshot);
    }

    fn persist_run_times(&self, task: &Task) {
        if let Err(e) = self
            .inner
            .tasks
            .set_run_times(&task.id, task.last_run_at, task.next_run_at)
        {
            error!(task_id = %task.id, "failed to persist run times: {e}");
        }
    }

    // --- loop --------------------------------------------------------------

    /// Drive `tick` until `shutdown` flips to `true`.
    ///
    /// Returns an error only if the registry becomes unusable; per-task
    /// failures are recorded and never stop the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            tick_ms = self.inner.options.tick_interval.as_millis() as u64,
            workers = self.inner.options.max_workers,
            timezone = %self.tz(),
            "scheduler started"
        );
        let mut interval = tokio::time::interval(self.inner.options.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let sync_every = self.inner.options.sync_interval;
        let mut sync = tokio::time::interval(sync_every.unwrap_or(Duration::from_secs(3600)));
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sync.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("scheduler tick failed, stopping: {e}");
                        return Err(e);
                    }
                }
                _ = sync.tick(), if sync_every.is_some() => {
                    if let Err(e) = self.sync_tasks() {
                        warn!("task sync failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Wait until no execution is in flight, up to `timeout`. Returns
    /// `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = {
                let registry = self
                    .inner
                    .registry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                registry.in_flight.len()
            };
            if remaining == 0 {
                return true;
            }
            debug!(remaining, "waiting for in-flight executions");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(remaining, "in-flight executions still running at shutdown deadline");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::store::SqliteExecutionStore;
    use crate::types::{ExecutionStatus, Schedule};
    use rusqlite::Connection;
    use srvmgr_executor::ExecOptions;

    /// Scheduler on a fresh database file. Both stores share the file, the
    /// way every process does in production.
    fn scheduler() -> (Scheduler, tempfile::TempDir) {
        scheduler_with(SchedulerOptions::default())
    }

    fn scheduler_with(options: SchedulerOptions) -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let s = file_scheduler_with(&dir.path().join("srvmgr.db"), options);
        (s, dir)
    }

    #[tokio::test]
    async fn create_computes_first_fire() {
        let (s, _db) = scheduler();
        let before = time::now();
        let task = s
            .create_task(NewTask::new("tick", "true", ScheduleSpec::every(60)))
            .unwrap();
        let next = task.next_run_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(60));

        let manual = s.create_task(NewTask::new("m", "true", ScheduleSpec::manual())).unwrap();
        assert_eq!(manual.next_run_at, None);
    }

    fn file_scheduler(path: &std::path::Path) -> Scheduler {
        file_scheduler_with(path, SchedulerOptions::default())
    }

    fn file_scheduler_with(path: &std::path::Path, options: SchedulerOptions) -> Scheduler {
        let open = || {
            let conn = Connection::open(path).unwrap();
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
                .unwrap();
            init_db(&conn).unwrap();
            conn
        };
        Scheduler::new(
            TaskStore::new(open()),
            Arc::new(SqliteExecutionStore::new(open())),
            CommandExecutor::new(ExecOptions {
                kill_grace: Duration::from_millis(200),
                ..ExecOptions::default()
            }),
            options,
        )
    }

    fn registered(s: &Scheduler, id: &TaskId) -> Option<Task> {
        s.inner.registry.lock().unwrap().tasks.get(id).cloned()
    }

    #[tokio::test]
    async fn sync_picks_up_changes_from_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srvmgr.db");
        let daemon = file_scheduler(&path);
        let cli = file_scheduler(&path);

        let task = cli
            .create_task(NewTask::new("backup", "true", ScheduleSpec::every(3600)))
            .unwrap();
        assert_eq!(daemon.sync_tasks().unwrap(), 1);
        let first = registered(&daemon, &task.id).unwrap();
        assert_eq!(daemon.sync_tasks().unwrap(), 0);

        // Same schedule: definition changes, fire time stays.
        cli.update_task(
            &task.id,
            TaskUpdate {
                command: Some("echo changed".into()),
                ..TaskUpdate::default()
            },
        )
        .unwrap();
        assert_eq!(daemon.sync_tasks().unwrap(), 1);
        let edited = registered(&daemon, &task.id).unwrap();
        assert_eq!(edited.command, "echo changed");
        assert_eq!(edited.next_run_at, first.next_run_at);

        assert!(!cli.toggle(&task.id).unwrap());
        daemon.sync_tasks().unwrap();
        assert_eq!(registered(&daemon, &task.id).unwrap().next_run_at, None);

        cli.remove_task(&task.id).unwrap();
        assert_eq!(daemon.sync_tasks().unwrap(), 1);
        assert!(registered(&daemon, &task.id).is_none());
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected_and_not_stored() {
        let (s, _db) = scheduler();
        let err = s
            .create_task(NewTask::new("bad", "true", ScheduleSpec::cron("* * * * *")))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
        assert!(s.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggle_clears_and_recomputes_next_run() {
        let (s, _db) = scheduler();
        let task = s
            .create_task(NewTask::new("t", "true", ScheduleSpec::cron("0 0 * * * *")))
            .unwrap();

        assert!(!s.toggle(&task.id).unwrap());
        let disabled = s.get_task(&task.id).unwrap();
        assert_eq!(disabled.next_run_at, None);
        assert_eq!(disabled.schedule, Schedule::Cron { expression: "0 0 * * * *".into() });

        assert!(s.toggle(&task.id).unwrap());
        assert!(s.get_task(&task.id).unwrap().next_run_at.unwrap() > time::now());
    }

    #[tokio::test]
    async fn disabled_or_manual_tasks_never_fire() {
        let (s, _db) = scheduler();
        let disabled = s
            .create_task(NewTask {
                enabled: false,
                ..NewTask::new("off", "true", ScheduleSpec::every(1))
            })
            .unwrap();
        s.create_task(NewTask::new("manual", "true", ScheduleSpec::manual())).unwrap();

        let far_future = time::now() + chrono::Duration::days(1);
        assert!(s.tick_at(far_future).unwrap().is_empty());

        // Still manually executable.
        s.execute_now(&disabled.id).unwrap();
        assert!(s.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn due_task_fires_once_and_advances() {
        let (s, _db) = scheduler();
        let task = s
            .create_task(NewTask::new("t", "echo hi", ScheduleSpec::every(30)))
            .unwrap();
        let due = task.next_run_at.unwrap();

        let fired = s.tick_at(due).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(
            s.get_task(&task.id).unwrap().next_run_at,
            Some(due + chrono::Duration::seconds(30))
        );
        // Same instant again: nothing is due any more.
        assert!(s.tick_at(due).unwrap().is_empty());

        assert!(s.wait_idle(Duration::from_secs(5)).await);
        let execution = s.execution(&fired[0]).unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.stdout.trim(), "hi");
        assert_eq!(execution.command, "echo hi");
    }

    #[tokio::test]
    async fn overlapping_fire_is_coalesced() {
        let (s, _db) = scheduler();
        let task = s
            .create_task(NewTask::new("slow", "sleep 1", ScheduleSpec::every(1)))
            .unwrap();
        let due = task.next_run_at.unwrap();

        assert_eq!(s.tick_at(due).unwrap().len(), 1);
        assert!(s.is_running(&task.id).unwrap());
        // The next slot arrives while the first run is still going.
        let later = due + chrono::Duration::milliseconds(1_500);
        assert!(s.tick_at(later).unwrap().is_empty());
        assert!(s.get_task(&task.id).unwrap().next_run_at.unwrap() > later);

        assert!(s.wait_idle(Duration::from_secs(10)).await);
        let history = s.history(&ExecutionQuery::for_task(task.id.clone())).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn execute_now_rejects_concurrent_run() {
        let (s, _db) = scheduler();
        let task = s
            .create_task(NewTask::new("t", "sleep 1", ScheduleSpec::manual()))
            .unwrap();

        s.execute_now(&task.id).unwrap();
        let err = s.execute_now(&task.id).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));
        assert_eq!(err.code(), "ALREADY_RUNNING");

        let views = s.task_views().unwrap();
        assert_eq!(views[0].runtime_status, TaskRuntimeStatus::EnabledRunning);

        assert!(s.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(s.history(&ExecutionQuery::default()).unwrap().len(), 1);
        assert!(!s.is_running(&task.id).unwrap());
        assert_eq!(
            s.task_views().unwrap()[0].runtime_status,
            TaskRuntimeStatus::EnabledStopped
        );
    }

    #[tokio::test]
    async fn retries_record_only_the_final_attempt() {
        let (s, _db) = scheduler();
        let marker = std::env::temp_dir().join(format!("srvmgr-retry-{}", TaskId::new()));
        let command = format!(
            "if [ -e {m} ]; then echo second; else touch {m}; echo first >&2; exit 1; fi",
            m = marker.display()
        );
        let task = s
            .create_task(NewTask {
                max_retries: 2,
                ..NewTask::new("flaky", command, ScheduleSpec::manual())
            })
            .unwrap();

        let id = s.execute_now(&task.id).unwrap();
        assert!(s.wait_idle(Duration::from_secs(10)).await);
        let _ = std::fs::remove_file(&marker);

        let execution = s.execution(&id).unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.attempts, 2);
        assert_eq!(execution.stdout.trim(), "second");
        assert!(execution.stderr.is_empty());
    }

    #[tokio::test]
    async fn remove_task_cascades_history() {
        let (s, _db) = scheduler();
        let keep = s.create_task(NewTask::new("keep", "true", ScheduleSpec::manual())).unwrap();
        let gone = s.create_task(NewTask::new("gone", "true", ScheduleSpec::manual())).unwrap();
        s.execute_now(&keep.id).unwrap();
        s.execute_now(&gone.id).unwrap();
        assert!(s.wait_idle(Duration::from_secs(5)).await);

        s.remove_task(&gone.id).unwrap();
        let history = s.history(&ExecutionQuery::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].task_id, keep.id);
        assert!(matches!(s.get_task(&gone.id), Err(SchedulerError::TaskNotFound { .. })));
        assert!(matches!(s.remove_task(&gone.id), Err(SchedulerError::TaskNotFound { .. })));

        // Unregistering twice is harmless.
        s.unregister(&gone.id).unwrap();
        s.unregister(&gone.id).unwrap();
    }

    #[tokio::test]
    async fn update_revalidates_and_reschedules() {
        let (s, _db) = scheduler();
        let task = s.create_task(NewTask::new("t", "true", ScheduleSpec::manual())).unwrap();

        let err = s
            .update_task(
                &task.id,
                TaskUpdate {
                    timeout_seconds: Some(0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let updated = s
            .update_task(
                &task.id,
                TaskUpdate {
                    schedule: Some(ScheduleSpec::every(120)),
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.schedule, Schedule::Interval { seconds: 120 });
        assert!(updated.next_run_at.is_some());
        assert_eq!(updated.created_at, task.created_at);
    }

    #[tokio::test]
    async fn run_in_another_process_blocks_a_second_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srvmgr.db");
        let daemon = file_scheduler(&path);
        let cli = file_scheduler(&path);

        let task = daemon
            .create_task(NewTask::new("slow", "sleep 2", ScheduleSpec::manual()))
            .unwrap();
        assert_eq!(cli.attach_tasks().unwrap(), 1);

        daemon.execute_now(&task.id).unwrap();
        let err = cli.execute_now(&task.id).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));
        // The rejected start left no in-flight flag behind.
        assert!(cli.inner.registry.lock().unwrap().in_flight.is_empty());
        assert!(cli.is_running(&task.id).unwrap());
        assert_eq!(
            cli.task_views().unwrap()[0].runtime_status,
            TaskRuntimeStatus::EnabledRunning
        );

        assert!(daemon.wait_idle(Duration::from_secs(10)).await);
        assert!(!cli.is_running(&task.id).unwrap());
        let history = cli.history(&ExecutionQuery::for_task(task.id.clone())).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Success);

        cli.execute_now(&task.id).unwrap();
        assert!(cli.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(
            cli.history(&ExecutionQuery::for_task(task.id.clone())).unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn scheduled_fire_of_a_task_removed_elsewhere_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srvmgr.db");
        let daemon = file_scheduler(&path);
        let cli = file_scheduler(&path);

        let task = daemon
            .create_task(NewTask::new("hourly", "true", ScheduleSpec::every(60)))
            .unwrap();
        cli.attach_tasks().unwrap();
        cli.remove_task(&task.id).unwrap();

        // The daemon has not synced yet and still thinks the task is due.
        let later = time::now() + chrono::Duration::seconds(120);
        assert!(daemon.tick_at(later).unwrap().is_empty());
        assert!(registered(&daemon, &task.id).is_none());
        assert!(daemon.wait_idle(Duration::from_secs(5)).await);
        assert!(daemon
            .history(&ExecutionQuery::for_task(task.id.clone()))
            .unwrap()
            .is_empty());
        assert!(matches!(
            daemon.execute_now(&task.id),
            Err(SchedulerError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn run_whose_record_was_deleted_before_start_is_skipped() {
        let (s, _db) = scheduler_with(SchedulerOptions {
            max_workers: 1,
            ..SchedulerOptions::default()
        });
        let marker = std::env::temp_dir().join(format!("srvmgr-skip-{}", TaskId::new()));
        let blocker = s
            .create_task(NewTask::new("blocker", "sleep 1", ScheduleSpec::manual()))
            .unwrap();
        let queued = s
            .create_task(NewTask::new(
                "queued",
                format!("touch {}", marker.display()),
                ScheduleSpec::manual(),
            ))
            .unwrap();

        s.execute_now(&blocker.id).unwrap();
        s.execute_now(&queued.id).unwrap();
        // Queued behind the blocker for the only worker slot.
        s.remove_task(&queued.id).unwrap();

        assert!(s.wait_idle(Duration::from_secs(10)).await);
        assert!(!marker.exists());
        assert!(s
            .history(&ExecutionQuery::for_task(queued.id.clone()))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn attach_leaves_stored_fire_times_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srvmgr.db");
        let daemon = file_scheduler(&path);
        let task = daemon
            .create_task(NewTask::new("nightly", "true", ScheduleSpec::every(3600)))
            .unwrap();
        // A fire the daemon is about to take.
        let overdue = time::now() - chrono::Duration::seconds(5);
        daemon
            .inner
            .tasks
            .set_run_times(&task.id, None, Some(overdue))
            .unwrap();

        let cli = file_scheduler(&path);
        assert_eq!(cli.attach_tasks().unwrap(), 1);
        assert!(registered(&cli, &task.id).unwrap().next_run_at.unwrap() > time::now());
        let stored = daemon.inner.tasks.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.next_run_at, Some(overdue));

        // A full load rewrites it.
        cli.load_tasks().unwrap();
        let stored = daemon.inner.tasks.get(&task.id).unwrap().unwrap();
        assert!(stored.next_run_at.unwrap() > time::now());
    }

    /// Runs two one-second tasks that fall due together and reports whether
    /// their executions overlapped.
    async fn due_pair_overlaps(max_workers: usize) -> bool {
        let (s, _db) = scheduler_with(SchedulerOptions {
            max_workers,
            ..SchedulerOptions::default()
        });
        let a = s
            .create_task(NewTask::new("a", "sleep 1", ScheduleSpec::every(60)))
            .unwrap();
        let b = s
            .create_task(NewTask::new("b", "sleep 1", ScheduleSpec::every(60)))
            .unwrap();

        let later = time::now() + chrono::Duration::seconds(120);
        assert_eq!(s.tick_at(later).unwrap().len(), 2);
        assert!(s.wait_idle(Duration::from_secs(15)).await);

        let run = |id: &TaskId| {
            let history = s.history(&ExecutionQuery::for_task(id.clone())).unwrap();
            assert_eq!(history.len(), 1);
            let e = &history[0];
            assert_eq!(e.status, ExecutionStatus::Success);
            (e.started_at.unwrap(), e.ended_at.unwrap())
        };
        let (a_start, a_end) = run(&a.id);
        let (b_start, b_end) = run(&b.id);
        a_start < b_end && b_start < a_end
    }

    #[tokio::test]
    async fn due_tasks_run_in_parallel_up_to_the_worker_limit() {
        assert!(due_pair_overlaps(2).await);
        assert!(!due_pair_overlaps(1).await);
    }
}
