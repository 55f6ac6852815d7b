use clap::Parser;
use tracing::debug;

mod app;
mod cli;
mod commands;
mod serve;

use cli::{Cli, Commands};
use commands::Out;

const DEFAULT_LOG_FILTER: &str =
    "srvmgr=info,srvmgr_scheduler=info,srvmgr_wol=info,srvmgr_executor=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > SRVMGR_CONFIG env > ~/.srvmgr/srvmgr.toml
    let config = srvmgr_core::SrvmgrConfig::load(cli.config.as_deref())?;

    let fallback = config
        .logging
        .level
        .clone()
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with_writer(std::io::stderr)
        .init();
    debug!(db = %config.database.path, timezone = %config.scheduler.timezone, "config loaded");

    let out = Out::new(cli.json, config.scheduler.tz()?);
    let state = app::AppState::open(config)?;

    match cli.command {
        Commands::Serve => serve::run(state).await,
        Commands::Wake(args) => commands::wake(&state, &out, args).await,
        Commands::Probe { address } => commands::probe_once(&state, &out, &address).await,
        Commands::Device(cmd) => commands::device(&state, &out, cmd).await,
        Commands::Task(cmd) => commands::task(&state, &out, cmd).await,
        Commands::History(args) => commands::history(&state, &out, args).await,
    }
}
