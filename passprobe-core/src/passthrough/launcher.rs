//! Guest launcher abstraction.
//!
//! A test guest is started with exactly one passthrough device and a bounded
//! runtime. When the runtime expires the guest is killed and whatever it
//! printed so far is returned.

use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Default guest runtime before it is killed.
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 60;

/// How long to keep draining output after the guest is gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Guest settings shared by every device test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Emulator binary
    pub binary: String,
    /// Guest memory, in QEMU `-m` syntax (e.g., "4G")
    pub memory: String,
    /// Pass the host CPU model through (`-cpu host`)
    pub cpu_host: bool,
    /// Use KVM acceleration (`-enable-kvm`)
    pub enable_kvm: bool,
    /// Run headless (`-nographic`)
    pub nographic: bool,
    /// Optional boot image attached as CD-ROM
    pub boot_image: Option<PathBuf>,
    /// Extra arguments appended verbatim
    pub extra_args: Vec<String>,
    /// Guest runtime in seconds before it is killed
    pub timeout_secs: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            memory: "4G".to_string(),
            cpu_host: true,
            enable_kvm: true,
            nographic: true,
            boot_image: None,
            extra_args: Vec::new(),
            timeout_secs: DEFAULT_LAUNCH_TIMEOUT_SECS,
        }
    }
}

impl GuestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Emulator arguments for a guest with `address` passed through.
    pub fn args_for(&self, address: &str) -> Vec<String> {
        let mut args = Vec::new();

        if self.nographic {
            args.push("-nographic".to_string());
        }
        if self.enable_kvm {
            args.push("-enable-kvm".to_string());
        }

        args.push("-m".to_string());
        args.push(self.memory.clone());

        if self.cpu_host {
            args.push("-cpu".to_string());
            args.push("host".to_string());
        }

        args.push("-device".to_string());
        args.push(format!("vfio-pci,host={}", address));

        if let Some(image) = &self.boot_image {
            args.push("-cdrom".to_string());
            args.push(image.to_string_lossy().to_string());
            args.push("-boot".to_string());
            args.push("d".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Full command line, for logs and the audit record.
    pub fn command_line(&self, address: &str) -> String {
        let mut parts = vec![self.binary.clone()];
        parts.extend(self.args_for(address));
        parts.join(" ")
    }
}

/// Result of one guest run.
#[derive(Debug, Clone, Default)]
pub struct LaunchOutput {
    /// Exit code, `None` when killed by a signal or by the timeout
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The guest was still running when the timeout expired
    pub timed_out: bool,
}

/// Starts a test guest with one passthrough device.
#[async_trait]
pub trait GuestLauncher: Send + Sync {
    /// Run a guest for `address` under `config` and capture its output.
    ///
    /// Errors only when the guest could not be started at all.
    async fn launch(&self, address: &str, config: &GuestConfig) -> Result<LaunchOutput>;

    /// Launcher name (for logging/metrics).
    fn name(&self) -> &str;
}

/// [`GuestLauncher`] that runs QEMU.
#[derive(Debug, Clone, Default)]
pub struct QemuLauncher;

impl QemuLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GuestLauncher for QemuLauncher {
    #[instrument(skip(self, config), fields(binary = %config.binary))]
    async fn launch(&self, address: &str, config: &GuestConfig) -> Result<LaunchOutput> {
        let args = config.args_for(address);
        debug!(args = ?args, "Spawning test guest");

        let mut child = Command::new(&config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| ProbeError::Launch {
                address: address.to_string(),
                reason: format!("Failed to spawn {}: {}", config.binary, e),
            })?;

        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let (exit_code, timed_out) =
            match tokio::time::timeout(config.timeout(), child.wait()).await {
                Ok(Ok(status)) => (status.code(), false),
                Ok(Err(e)) => {
                    return Err(ProbeError::Launch {
                        address: address.to_string(),
                        reason: format!("Failed to wait for guest: {}", e),
                    });
                }
                Err(_) => {
                    debug!(timeout_secs = config.timeout_secs, "Guest runtime expired, killing");
                    kill_process_group(child.id());
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill test guest");
                    }
                    (None, true)
                }
            };

        Ok(LaunchOutput {
            exit_code,
            stdout: join_output(stdout).await,
            stderr: join_output(stderr).await,
            timed_out,
        })
    }

    fn name(&self) -> &str {
        "qemu"
    }
}

/// Drain a child pipe to a string on a background task.
fn collect<R>(mut pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            warn!(error = %e, "Failed to read guest output");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Collect a reader task, giving up after [`OUTPUT_GRACE`].
///
/// A helper that escaped the guest's process group can hold the pipe open
/// indefinitely.
async fn join_output(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_GRACE, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            warn!("Guest output still open after the guest exited, dropping it");
            handle.abort();
            String::new()
        }
    }
}

/// SIGKILL the guest and everything it forked.
///
/// The guest leads its own process group (`process_group(0)` at spawn).
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}
