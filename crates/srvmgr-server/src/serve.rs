//! `srvmgr serve`: the long-running daemon.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use srvmgr_scheduler::{retention, ExecutionStore};
use srvmgr_wol::{DeviceStore, ReachabilityMonitor};

use crate::app::AppState;

pub async fn run(state: AppState) -> anyhow::Result<()> {
    let loaded = state.scheduler.load()?;
    info!(tasks = loaded, "tasks registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = state.scheduler.clone();
    let loop_rx = shutdown_rx.clone();
    let mut scheduler_task = tokio::spawn(async move { scheduler.run(loop_rx).await });

    let executions: Arc<dyn ExecutionStore> = state.executions.clone();
    let retention_task = tokio::spawn(retention::run(
        executions,
        state.retention,
        shutdown_rx.clone(),
    ));

    let sweep_secs = state.config.reachability.sweep_interval_secs;
    let sweep_task = (sweep_secs > 0).then(|| {
        tokio::spawn(sweep_loop(
            state.devices.clone(),
            state.monitor.clone(),
            Duration::from_secs(sweep_secs),
            shutdown_rx.clone(),
        ))
    });

    info!("srvmgr daemon running, press Ctrl-C to stop");

    let loop_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("cannot listen for Ctrl-C: {e}");
            }
            info!("shutdown requested");
            None
        }
        joined = &mut scheduler_task => Some(joined),
    };

    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(state.config.scheduler.shutdown_grace_secs);
    if !state.scheduler.wait_idle(grace).await {
        warn!(grace_secs = grace.as_secs(), "exiting with executions still in flight");
    }
    let _ = retention_task.await;
    if let Some(task) = sweep_task {
        let _ = task.await;
    }

    match loop_result {
        None => {
            let _ = scheduler_task.await;
            Ok(())
        }
        Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => Err(e.into()),
        Some(Err(e)) => Err(anyhow::anyhow!("scheduler loop panicked: {e}")),
    }
}

/// Probe every stored device every `every` until shutdown.
async fn sweep_loop(
    devices: Arc<DeviceStore>,
    monitor: Arc<ReachabilityMonitor>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = every.as_secs(), "reachability sweep started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let list = match devices.list() {
                    Ok(list) => list,
                    Err(e) => {
                        error!("device listing failed: {e}");
                        continue;
                    }
                };
                for (id, state) in monitor.sweep(&list).await {
                    tracing::debug!(device_id = %id, %state, "device probed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
