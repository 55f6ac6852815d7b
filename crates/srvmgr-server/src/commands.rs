//! One-shot CLI commands. Each opens the database, does its work and exits.

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use srvmgr_core::{DeviceId, ExecutionId, TaskId};
use srvmgr_scheduler::{
    Execution, ExecutionFilter, ExecutionQuery, ExecutionStatus, NewTask, ScheduleSpec, TaskUpdate, TaskView,
};
use srvmgr_wol::{probe, Device, DeviceUpdate, NewDevice, WakeReport};

use crate::app::AppState;
use crate::cli::{
    DeviceCommand, HistoryAction, HistoryArgs, ScheduleArgs, TaskCommand, WakeArgs,
};

/// Extra time `task run` waits beyond the task's own deadlines.
const RUN_WAIT_SLACK: Duration = Duration::from_secs(10);

/// Output sink shared by every handler.
pub struct Out {
    json: bool,
    tz: Tz,
}

impl Out {
    pub fn new(json: bool, tz: Tz) -> Self {
        Self { json, tz }
    }

    /// Print `value` as JSON, or run `human` for the plain-text rendering.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&Self)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(self);
        }
        Ok(())
    }

    fn time(&self, at: Option<DateTime<Utc>>) -> String {
        at.map(|t| t.with_timezone(&self.tz).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

// ---------------------------------------------------------------------------
// Wake / probe
// ---------------------------------------------------------------------------

pub async fn wake(state: &AppState, out: &Out, args: WakeArgs) -> anyhow::Result<()> {
    let report = match (args.who.mac, args.who.device) {
        (Some(mac), _) => state.wol.send(&mac, args.target.as_deref(), args.port).await?,
        (None, Some(id)) => {
            let device = state.devices.require(&DeviceId::from(id))?;
            match args.target.as_deref() {
                Some(target) => {
                    state
                        .wol
                        .send(&device.mac_address.to_string(), Some(target), args.port)
                        .await?
                }
                None => state.wol.wake_device(&device, args.port).await?,
            }
        }
        (None, None) => bail!("either --mac or --device is required"),
    };
    out.emit(&report, |_| print_wake(&report))
}

fn print_wake(report: &WakeReport) {
    println!(
        "magic packet for {} sent to {} ({} bytes)",
        report.mac, report.target, report.bytes_sent
    );
}

pub async fn probe_once(state: &AppState, out: &Out, address: &str) -> anyhow::Result<()> {
    let prober = probe::from_config(&state.config.reachability);
    let outcome = prober.probe(address).await;
    out.emit(&outcome, |_| println!("{address}: {outcome} (via {})", prober.name()))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

pub async fn device(state: &AppState, out: &Out, cmd: DeviceCommand) -> anyhow::Result<()> {
    match cmd {
        DeviceCommand::Add {
            name,
            mac,
            hostname,
            ip,
            description,
        } => {
            let device = state.devices.create(&NewDevice {
                name,
                hostname,
                ip_address: ip,
                mac_address: mac,
                description,
            })?;
            out.emit(&device, |o| print_device(o, &device))
        }
        DeviceCommand::List => {
            let devices = state.devices.list()?;
            out.emit(&devices, |o| {
                if devices.is_empty() {
                    println!("no devices");
                }
                for device in &devices {
                    print_device(o, device);
                }
            })
        }
        DeviceCommand::Update {
            id,
            name,
            mac,
            hostname,
            ip,
            description,
        } => {
            let update = DeviceUpdate {
                name,
                hostname,
                ip_address: ip,
                mac_address: mac,
                description,
            };
            let device = state.devices.update(&DeviceId::from(id), &update)?;
            out.emit(&device, |o| print_device(o, &device))
        }
        DeviceCommand::Rm { id } => {
            let id = DeviceId::from(id);
            if !state.devices.delete(&id)? {
                bail!("device {id} not found");
            }
            state.monitor.forget(&id);
            out.emit(&serde_json::json!({ "deleted": id }), |_| {
                println!("device {id} deleted")
            })
        }
        DeviceCommand::Status => {
            let devices = state.devices.list()?;
            let results = state.monitor.sweep(&devices).await;
            let rows: Vec<serde_json::Value> = results
                .iter()
                .map(|(id, reach)| {
                    let device = devices.iter().find(|d| &d.id == id);
                    serde_json::json!({
                        "id": id,
                        "name": device.map(|d| d.name.as_str()),
                        "address": device.map(Device::display_address),
                        "state": reach,
                    })
                })
                .collect();
            out.emit(&rows, |_| {
                for (id, reach) in &results {
                    let device = devices.iter().find(|d| &d.id == id);
                    println!(
                        "{:<10} {:<24} {}",
                        reach,
                        device.map(|d| d.name.as_str()).unwrap_or("?"),
                        device.map(Device::display_address).unwrap_or_default(),
                    );
                }
            })
        }
    }
}

fn print_device(out: &Out, device: &Device) {
    println!(
        "{}  {}  {}  {}  (added {})",
        device.id,
        device.name,
        device.mac_address,
        device.display_address(),
        out.time(Some(device.created_at)),
    );
    if let Some(ref description) = device.description {
        println!("    {description}");
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

impl ScheduleArgs {
    /// `None` when no schedule flag was given.
    fn spec(&self) -> Option<ScheduleSpec> {
        if let Some(ref expression) = self.cron {
            Some(ScheduleSpec::cron(expression.clone()))
        } else if let Some(seconds) = self.interval {
            Some(ScheduleSpec::every(seconds))
        } else if self.manual {
            Some(ScheduleSpec::manual())
        } else {
            None
        }
    }
}

pub async fn task(state: &AppState, out: &Out, cmd: TaskCommand) -> anyhow::Result<()> {
    let scheduler = &state.scheduler;
    // The daemon owns stored fire times; only read them here.
    scheduler.attach_tasks()?;

    match cmd {
        TaskCommand::Add {
            name,
            command,
            schedule,
            timeout,
            retries,
            disabled,
        } => {
            let task = scheduler.create_task(NewTask {
                name,
                command,
                schedule: schedule.spec().unwrap_or_default(),
                timeout_seconds: timeout,
                max_retries: retries,
                enabled: !disabled,
            })?;
            out.emit(&task, |o| {
                println!("task {} created", task.id);
                println!("    next run: {}", o.time(task.next_run_at));
            })
        }
        TaskCommand::List => {
            let views = scheduler.task_views()?;
            out.emit(&views, |o| {
                if views.is_empty() {
                    println!("no tasks");
                }
                for view in &views {
                    print_task(o, view);
                }
            })
        }
        TaskCommand::Update {
            id,
            name,
            command,
            schedule,
            timeout,
            retries,
        } => {
            let task = scheduler.update_task(
                &TaskId::from(id),
                TaskUpdate {
                    name,
                    command,
                    schedule: schedule.spec(),
                    timeout_seconds: timeout,
                    max_retries: retries,
                    enabled: None,
                },
            )?;
            out.emit(&task, |o| {
                println!("task {} updated ({})", task.id, task.schedule);
                println!("    next run: {}", o.time(task.next_run_at));
            })
        }
        TaskCommand::Rm { id } => {
            let id = TaskId::from(id);
            scheduler.remove_task(&id)?;
            out.emit(&serde_json::json!({ "deleted": id }), |_| {
                println!("task {id} and its history deleted")
            })
        }
        TaskCommand::Toggle { id } => {
            let id = TaskId::from(id);
            let enabled = scheduler.toggle(&id)?;
            out.emit(&serde_json::json!({ "id": id, "enabled": enabled }), |_| {
                let word = if enabled { "enabled" } else { "disabled" };
                println!("task {id} {word}");
            })
        }
        TaskCommand::Run { id } => {
            let id = TaskId::from(id);
            let task = scheduler.get_task(&id)?;
            let execution_id = scheduler.execute_now(&id)?;

            let attempts = u64::from(task.max_retries) + 1;
            let per_attempt = task.timeout_seconds + state.config.executor.kill_grace_secs;
            let budget = Duration::from_secs(per_attempt * attempts)
                + scheduler.options().retry_delay * task.max_retries
                + RUN_WAIT_SLACK;
            if !scheduler.wait_idle(budget).await {
                eprintln!("execution {execution_id} still running, giving up waiting");
            }

            let execution = fetch_execution(state, &execution_id)?;
            out.emit(&execution, |o| print_execution(o, &execution, true))?;
            if execution.status != ExecutionStatus::Success {
                bail!("execution {execution_id} ended with status {}", execution.status);
            }
            Ok(())
        }
    }
}

fn fetch_execution(state: &AppState, id: &ExecutionId) -> anyhow::Result<Execution> {
    state
        .scheduler
        .execution(id)?
        .with_context(|| format!("execution {id} disappeared"))
}

fn print_task(out: &Out, view: &TaskView) {
    let task = &view.task;
    println!(
        "{}  {:<20} {:<16} {}",
        task.id, task.name, view.runtime_status, task.schedule
    );
    println!(
        "    last: {}  next: {}  timeout: {}s  retries: {}",
        out.time(task.last_run_at),
        out.time(task.next_run_at),
        task.timeout_seconds,
        task.max_retries,
    );
    println!("    $ {}", task.command);
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub async fn history(state: &AppState, out: &Out, args: HistoryArgs) -> anyhow::Result<()> {
    match args.action {
        None => {
            let query = ExecutionQuery {
                task_id: args.task.map(TaskId::from),
                search: args.search,
                sort: args.sort.parse().map_err(anyhow::Error::msg)?,
                order: args.order.parse().map_err(anyhow::Error::msg)?,
                limit: args.limit,
            };
            let executions = state.scheduler.history(&query)?;
            out.emit(&executions, |o| {
                if executions.is_empty() {
                    println!("no executions");
                }
                for execution in &executions {
                    print_execution(o, execution, false);
                }
            })
        }
        Some(HistoryAction::Clear {
            task,
            task_name,
            search,
            older_than_days,
            all,
        }) => {
            let filter = ExecutionFilter {
                task_id: task.map(TaskId::from),
                task_name,
                search,
                older_than: older_than_days
                    .map(|days| srvmgr_core::time::now() - chrono::Duration::days(i64::from(days))),
                finished_only: false,
            };
            if filter.is_empty() && !all {
                bail!("refusing to delete the whole history without --all");
            }
            let deleted = state.scheduler.clear_history(&filter)?;
            out.emit(&serde_json::json!({ "deleted": deleted }), |_| {
                println!("{deleted} execution(s) deleted")
            })
        }
    }
}

fn print_execution(out: &Out, execution: &Execution, with_output: bool) {
    let duration = execution
        .duration()
        .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    let exit = execution
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<20} {:<8} exit {:<4} {:>8}  attempts {}  {}",
        execution.id,
        execution.task_name,
        execution.status,
        exit,
        duration,
        execution.attempts,
        out.time(execution.started_at.or(Some(execution.created_at))),
    );
    if let Some(ref message) = execution.error_message {
        println!("    error: {message}");
    }
    if with_output {
        if !execution.stdout.is_empty() {
            println!("--- stdout ---\n{}", execution.stdout.trim_end());
        }
        if !execution.stderr.is_empty() {
            println!("--- stderr ---\n{}", execution.stderr.trim_end());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_flags_map_to_spec() {
        assert_eq!(ScheduleArgs::default().spec(), None);

        let cron = ScheduleArgs {
            cron: Some("0 0 3 * * *".into()),
            ..ScheduleArgs::default()
        };
        assert_eq!(cron.spec(), Some(ScheduleSpec::cron("0 0 3 * * *")));

        let every = ScheduleArgs {
            interval: Some(90),
            ..ScheduleArgs::default()
        };
        assert_eq!(every.spec(), Some(ScheduleSpec::every(90)));

        let manual = ScheduleArgs {
            manual: true,
            ..ScheduleArgs::default()
        };
        assert_eq!(manual.spec(), Some(ScheduleSpec::manual()));
    }

    #[test]
    fn times_render_in_configured_zone() {
        let out = Out::new(false, chrono_tz::Asia::Shanghai);
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(out.time(Some(at)), "2024-01-01 08:00:00");
        assert_eq!(out.time(None), "-");
    }
}
