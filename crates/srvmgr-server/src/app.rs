use std::sync::Arc;

use anyhow::Context;
use rusqlite::Connection;
use tracing::info;

use srvmgr_core::SrvmgrConfig;
use srvmgr_executor::{CommandExecutor, ExecOptions};
use srvmgr_scheduler::{RetentionPolicy, Scheduler, SchedulerOptions, SqliteExecutionStore, TaskStore};
use srvmgr_wol::{probe, DeviceStore, ReachabilityMonitor, WakePacketSender};

/// Everything a command handler or the daemon needs, built once from config.
pub struct AppState {
    pub config: SrvmgrConfig,
    pub devices: Arc<DeviceStore>,
    pub wol: WakePacketSender,
    pub monitor: Arc<ReachabilityMonitor>,
    pub executions: Arc<SqliteExecutionStore>,
    pub scheduler: Scheduler,
    pub retention: RetentionPolicy,
}

impl AppState {
    /// Open (and migrate) the database, then wire up the subsystems. Each
    /// subsystem gets its own connection.
    pub fn open(config: SrvmgrConfig) -> anyhow::Result<Self> {
        let db_path = config.database.path.clone();
        ensure_parent_dir(&db_path);
        info!(path = %db_path, "opening SQLite database");

        let db = open_connection(&db_path)?;
        srvmgr_wol::db::init_db(&db)?;
        srvmgr_scheduler::db::init_db(&db)?;
        info!("database migrations complete");

        let devices = Arc::new(DeviceStore::new(open_connection(&db_path)?));
        let executions = Arc::new(SqliteExecutionStore::new(open_connection(&db_path)?));
        let tasks = TaskStore::new(open_connection(&db_path)?);

        let wol = WakePacketSender::from_config(&config.wol).context("invalid [wol] config")?;
        let monitor = Arc::new(ReachabilityMonitor::with_threshold(
            probe::from_config(&config.reachability),
            config.reachability.offline_threshold,
        ));

        let executor = CommandExecutor::new(ExecOptions::from(&config.executor));
        let options =
            SchedulerOptions::from_config(&config.scheduler, config.executor.default_timeout_secs)?;
        let scheduler = Scheduler::new(tasks, executions.clone(), executor, options);
        let retention = RetentionPolicy::from_config(&config.scheduler);

        Ok(Self {
            config,
            devices,
            wol,
            monitor,
            executions,
            scheduler,
            retention,
        })
    }
}

fn open_connection(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("cannot open database {path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srvmgr_scheduler::{NewTask, ScheduleSpec};

    fn config_in(dir: &tempfile::TempDir) -> SrvmgrConfig {
        let mut config = SrvmgrConfig::default();
        config.database.path = dir
            .path()
            .join("nested/srvmgr.db")
            .to_string_lossy()
            .into_owned();
        config
    }

    #[tokio::test]
    async fn open_creates_database_and_reopens_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let state = AppState::open(config.clone()).unwrap();
        let task = state
            .scheduler
            .create_task(NewTask::new("nightly", "true", ScheduleSpec::cron("0 0 3 * * *")))
            .unwrap();
        assert!(task.next_run_at.is_some());
        drop(state);

        let state = AppState::open(config).unwrap();
        assert_eq!(state.scheduler.load_tasks().unwrap(), 1);
        assert_eq!(state.scheduler.get_task(&task.id).unwrap().name, "nightly");
    }
}
