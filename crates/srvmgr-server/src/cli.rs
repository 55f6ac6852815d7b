use clap::{Args, Parser, Subcommand};

/// Wake-on-LAN and scheduled shell tasks for a home server.
#[derive(Parser, Debug)]
#[command(name = "srvmgr")]
#[command(version)]
pub struct Cli {
    /// Config file (default: $SRVMGR_CONFIG, then ~/.srvmgr/srvmgr.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler daemon until Ctrl-C.
    Serve,
    /// Send a magic packet.
    Wake(WakeArgs),
    /// Check whether an address answers right now.
    Probe {
        /// Hostname or IP address.
        address: String,
    },
    /// Manage wakeable devices.
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Manage scheduled tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Show or clear execution history.
    History(HistoryArgs),
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false, id = "who")]
pub struct WakeTarget {
    /// MAC address to wake.
    #[arg(long)]
    pub mac: Option<String>,
    /// Stored device id to wake.
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Args, Debug)]
pub struct WakeArgs {
    #[command(flatten)]
    pub who: WakeTarget,
    /// Broadcast or unicast address, or a CIDR block.
    #[arg(long)]
    pub target: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum DeviceCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        mac: String,
        #[arg(long)]
        hostname: Option<String>,
        /// IPv4 address or CIDR block.
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    /// Change stored fields. An empty value clears an optional field.
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        mac: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Rm {
        id: String,
    },
    /// Probe every device once and print its state.
    Status,
}

#[derive(Args, Debug, Default)]
pub struct ScheduleArgs {
    /// Six-field cron expression: "sec min hour day month weekday".
    #[arg(long, conflicts_with = "interval")]
    pub cron: Option<String>,
    /// Run every N seconds.
    #[arg(long)]
    pub interval: Option<i64>,
    /// Remove the schedule (manual runs only).
    #[arg(long, conflicts_with_all = ["cron", "interval"])]
    pub manual: bool,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        command: String,
        #[command(flatten)]
        schedule: ScheduleArgs,
        /// Seconds before the command is killed.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Create the task disabled.
        #[arg(long)]
        disabled: bool,
    },
    List,
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        command: Option<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        retries: Option<u32>,
    },
    Rm {
        id: String,
    },
    /// Enable a disabled task or disable an enabled one.
    Toggle {
        id: String,
    },
    /// Run a task now and wait for it to finish.
    Run {
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub action: Option<HistoryAction>,
    #[arg(long)]
    pub task: Option<String>,
    /// Case-insensitive text matched against name, command and output.
    #[arg(long)]
    pub search: Option<String>,
    /// created_at, started_at, task_name or status.
    #[arg(long, default_value = "created_at")]
    pub sort: String,
    /// asc or desc.
    #[arg(long, default_value = "desc")]
    pub order: String,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum HistoryAction {
    /// Delete matching records.
    Clear {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        task_name: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Only records older than this many days.
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Required to delete everything when no filter is given.
        #[arg(long)]
        all: bool,
    },
}
