//! Seams to the host operating system.
//!
//! Everything passprobe reads from or writes to the host goes through one of
//! two traits so the state machine can be exercised without real hardware:
//!
//! - [`CommandRunner`]: runs diagnostic commands (`lspci`, `dmesg`)
//! - [`PciBus`]: reads driver bindings and writes driver control files

pub mod sysfs;

pub use sysfs::{ControlFile, ControlKind, PciBus, SysfsBus};

use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the process exited with status 0
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs short-lived host commands and captures their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// Returns an error only when the process could not be started.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(skip(self))]
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program).args(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProbeError::CommandNotFound {
                    command: program.to_string(),
                    hint: "Install it with your distribution's package manager".to_string(),
                }
            } else {
                ProbeError::Internal(format!("Failed to run {}: {}", program, e))
            }
        })?;

        debug!(
            program,
            status = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Host command finished"
        );

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
