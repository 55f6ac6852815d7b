//! End-to-end scheduler behaviour with real `sh` subprocesses.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::watch;

use srvmgr_core::time;
use srvmgr_executor::{CommandExecutor, ExecOptions, TIMEOUT_MESSAGE};
use srvmgr_scheduler::{
    db::init_db, Execution, ExecutionQuery, ExecutionStatus, ExecutionStore, NewTask, Scheduler,
    SchedulerOptions, ScheduleSpec, SortKey, SortOrder, SqliteExecutionStore, TaskStore,
    INTERRUPTED_MESSAGE,
};

fn open(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        .unwrap();
    init_db(&conn).unwrap();
    conn
}

fn scheduler_at(path: &Path, options: SchedulerOptions) -> Scheduler {
    Scheduler::new(
        TaskStore::new(open(path)),
        Arc::new(SqliteExecutionStore::new(open(path))),
        CommandExecutor::new(ExecOptions {
            kill_grace: Duration::from_millis(300),
            ..ExecOptions::default()
        }),
        options,
    )
}

fn fast_ticks() -> SchedulerOptions {
    SchedulerOptions {
        tick_interval: Duration::from_millis(50),
        ..SchedulerOptions::default()
    }
}

#[tokio::test]
async fn timed_out_command_is_recorded_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler_at(&dir.path().join("db.sqlite"), fast_ticks());
    let task = s
        .create_task(NewTask {
            timeout_seconds: Some(1),
            ..NewTask::new("hang", "echo begin; exec sleep 30", ScheduleSpec::manual())
        })
        .unwrap();

    let id = s.execute_now(&task.id).unwrap();
    assert!(s.wait_idle(Duration::from_secs(10)).await);

    let execution = s.execution(&id).unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failure);
    assert_eq!(execution.exit_code, None);
    assert_eq!(execution.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
    assert_eq!(execution.stdout.trim(), "begin");
    let elapsed = execution.duration().unwrap();
    assert!(elapsed < chrono::Duration::seconds(10));
}

#[tokio::test]
async fn interval_runs_are_never_closer_than_the_interval() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler_at(&dir.path().join("db.sqlite"), fast_ticks());
    let task = s
        .create_task(NewTask::new("beat", "true", ScheduleSpec::every(1)))
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let runner = {
        let s = s.clone();
        tokio::spawn(async move { s.run(rx).await })
    };
    tokio::time::sleep(Duration::from_millis(3_600)).await;
    tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
    assert!(s.wait_idle(Duration::from_secs(5)).await);

    let runs = s
        .history(&ExecutionQuery {
            sort: SortKey::StartedAt,
            order: SortOrder::Asc,
            ..ExecutionQuery::for_task(task.id.clone())
        })
        .unwrap();
    assert!(runs.len() >= 2, "expected at least two runs, got {}", runs.len());
    for pair in runs.windows(2) {
        let gap = pair[1].started_at.unwrap() - pair[0].started_at.unwrap();
        assert!(gap >= chrono::Duration::seconds(1), "runs only {gap} apart");
    }
    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Success));
    assert!(s.get_task(&task.id).unwrap().last_run_at.is_some());
}

#[tokio::test]
async fn restart_fails_interrupted_runs_and_skips_missed_fires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite");

    let (task_id, stale_id) = {
        let s = scheduler_at(&path, fast_ticks());
        let task = s
            .create_task(NewTask::new("nightly", "true", ScheduleSpec::every(60)))
            .unwrap();

        // Simulate a crash: a record left running and a fire time in the past.
        let store = SqliteExecutionStore::new(open(&path));
        let task = s.get_task(&task.id).unwrap();
        let stale = Execution::pending(&task, time::now());
        store.create(&stale).unwrap();
        store.mark_running(&stale.id, time::now()).unwrap();
        TaskStore::new(open(&path))
            .set_run_times(&task.id, None, Some(time::now() - chrono::Duration::hours(3)))
            .unwrap();
        (task.id, stale.id)
    };

    let s = scheduler_at(&path, fast_ticks());
    assert_eq!(s.load().unwrap(), 1);

    let stale = s.execution(&stale_id).unwrap().unwrap();
    assert_eq!(stale.status, ExecutionStatus::Failure);
    assert_eq!(stale.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

    let task = s.get_task(&task_id).unwrap();
    assert!(task.next_run_at.unwrap() > time::now());
    // Nothing from the missed window fires on the first tick.
    assert!(s.tick().unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler_at(&dir.path().join("db.sqlite"), fast_ticks());
    let task = s
        .create_task(NewTask::new("slow", "sleep 2", ScheduleSpec::manual()))
        .unwrap();
    s.execute_now(&task.id).unwrap();

    assert!(!s.wait_idle(Duration::from_millis(200)).await);
    assert!(s.running_task_ids().unwrap().contains(&task.id));
    assert!(s.wait_idle(Duration::from_secs(10)).await);
    assert!(s.running_task_ids().unwrap().is_empty());
}
