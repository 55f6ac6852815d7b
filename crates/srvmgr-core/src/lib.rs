//! `srvmgr-core`: configuration, shared identifiers and base errors used by
//! every other srvmgr crate.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::SrvmgrConfig;
pub use error::{CoreError, Result};
pub use types::{DeviceId, ExecutionId, TaskId};
