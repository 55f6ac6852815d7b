//! Single-shot reachability checks.
//!
//! A probe answers one question for one address and never retries; the
//! debouncing lives in [`crate::monitor::ReachabilityMonitor`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use srvmgr_core::config::{ProbeMethod, ReachabilityConfig};

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The host answered.
    Reachable,
    /// Confirmed negative: no answer within the timeout, or no such host.
    Unreachable,
    /// The check itself could not run (local network stack failure, missing
    /// `ping`, …). Says nothing about the host.
    Error(String),
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reachable => write!(f, "reachable"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check `address` (hostname or IP; a `/prefix` suffix is ignored).
    async fn probe(&self, address: &str) -> ProbeOutcome;
}

/// Build the probe selected in config.
pub fn from_config(config: &ReachabilityConfig) -> Arc<dyn ReachabilityProbe> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    match config.method {
        ProbeMethod::Tcp => Arc::new(TcpProbe::new(config.tcp_ports.clone(), timeout)),
        ProbeMethod::Ping => Arc::new(PingProbe::new(timeout)),
    }
}

fn host_part(address: &str) -> &str {
    let address = address.trim();
    address.split('/').next().unwrap_or(address)
}

/// Resolve a hostname or literal; `None` means the name does not resolve.
async fn resolve(address: &str) -> Option<Vec<IpAddr>> {
    let host = host_part(address);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(vec![ip]);
    }
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => {
            let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            (!ips.is_empty()).then_some(ips)
        }
        Err(e) => {
            debug!(host, error = %e, "name resolution failed");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Connects to a list of ports in parallel.
///
/// Any completed handshake or an active refusal (RST) proves the host is up.
pub struct TcpProbe {
    ports: Vec<u16>,
    timeout: Duration,
}

enum ConnectResult {
    HostUp,
    NoAnswer,
    LocalFailure(String),
}

impl TcpProbe {
    pub fn new(ports: Vec<u16>, timeout: Duration) -> Self {
        Self { ports, timeout }
    }

    async fn connect(addr: SocketAddr, timeout: Duration) -> ConnectResult {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => ConnectResult::HostUp,
            Ok(Err(e)) => classify_connect_error(&e),
            Err(_elapsed) => ConnectResult::NoAnswer,
        }
    }
}

fn classify_connect_error(e: &io::Error) -> ConnectResult {
    if e.kind() == io::ErrorKind::ConnectionRefused {
        return ConnectResult::HostUp;
    }
    if e.kind() == io::ErrorKind::TimedOut {
        return ConnectResult::NoAnswer;
    }
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::EHOSTUNREACH) {
            return ConnectResult::NoAnswer;
        }
    }
    ConnectResult::LocalFailure(e.to_string())
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn probe(&self, address: &str) -> ProbeOutcome {
        let Some(ips) = resolve(address).await else {
            return ProbeOutcome::Unreachable;
        };
        if self.ports.is_empty() {
            return ProbeOutcome::Error("no tcp ports configured".into());
        }

        let mut set = JoinSet::new();
        for ip in &ips {
            for port in &self.ports {
                let addr = SocketAddr::new(*ip, *port);
                let timeout = self.timeout;
                set.spawn(async move { Self::connect(addr, timeout).await });
            }
        }

        let mut no_answer = false;
        let mut local_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(ConnectResult::HostUp) => {
                    set.abort_all();
                    return ProbeOutcome::Reachable;
                }
                Ok(ConnectResult::NoAnswer) => no_answer = true,
                Ok(ConnectResult::LocalFailure(reason)) => {
                    local_error.get_or_insert(reason);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    local_error.get_or_insert(format!("probe task failed: {e}"));
                }
            }
        }

        match (no_answer, local_error) {
            (true, _) => ProbeOutcome::Unreachable,
            (false, Some(reason)) => {
                warn!(address, %reason, "tcp probe could not run");
                ProbeOutcome::Error(reason)
            }
            (false, None) => ProbeOutcome::Unreachable,
        }
    }
}

// ---------------------------------------------------------------------------
// ICMP via the system `ping`
// ---------------------------------------------------------------------------

/// Shells out to `ping` for one echo request.
///
/// Exit 0 is reachable, exit 1 is "no reply"; anything else (bad option,
/// missing binary, no permission) is a probe error.
pub struct PingProbe {
    timeout: Duration,
    program: String,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            program: "ping".to_string(),
        }
    }

    /// Use a different ping binary (tests, unusual hosts).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, ip: IpAddr) -> Command {
        let secs = self.timeout.as_secs().max(1);
        let mut cmd = Command::new(&self.program);
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", &(secs * 1000).to_string()]);
        } else if cfg!(target_os = "macos") {
            cmd.args(["-c", "1", "-t", &secs.to_string()]);
        } else {
            cmd.args(["-c", "1", "-W", &secs.to_string()]);
        }
        cmd.arg(ip.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn probe(&self, address: &str) -> ProbeOutcome {
        let Some(ips) = resolve(address).await else {
            return ProbeOutcome::Unreachable;
        };
        // Resolution guarantees at least one address.
        let ip = ips[0];

        let mut child = match self.command(ip).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to start ping");
                return ProbeOutcome::Error("ping unavailable".into());
            }
        };

        let budget = self.timeout + Duration::from_secs(1);
        match tokio::time::timeout(budget, child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(0) => ProbeOutcome::Reachable,
                Some(1) => ProbeOutcome::Unreachable,
                Some(code) => ProbeOutcome::Error(format!("ping exited with code {code}")),
                None => ProbeOutcome::Error("ping terminated by signal".into()),
            },
            Ok(Err(e)) => ProbeOutcome::Error(format!("waiting for ping failed: {e}")),
            Err(_elapsed) => {
                let _ = child.kill().await;
                ProbeOutcome::Unreachable
            }
        }
    }
}
