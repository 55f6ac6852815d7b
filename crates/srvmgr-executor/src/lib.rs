//! srvmgr-executor: runs scheduled shell commands under a deadline.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use srvmgr_executor::{CommandExecutor, ExecOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = CommandExecutor::new(ExecOptions::default());
//!     let result = executor.run("echo hello", 30).await;
//!     println!("{:?} {}", result.status, result.stdout);
//! }
//! ```

pub mod executor;
pub mod truncate;
pub mod types;

pub use executor::CommandExecutor;
pub use types::{ExecOptions, ExecStatus, ExecutionResult, TIMEOUT_MESSAGE};
