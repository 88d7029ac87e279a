//! Passthrough test harness.
//!
//! Classification is textual: any output on the guest's error stream is a
//! failure, everything else is a success. A success only means the emulator
//! accepted the device configuration without complaint.

use crate::error::ProbeError;
use crate::observability::metrics;
use crate::passthrough::launcher::{GuestConfig, GuestLauncher};
use crate::pci::PciDevice;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Result category of one device's test cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    HypervisorLaunchFailed,
    BindFailed,
    UnbindFailed,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HypervisorLaunchFailed => "hypervisor_launch_failed",
            Self::BindFailed => "bind_failed",
            Self::UnbindFailed => "unbind_failed",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one device's test cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PassthroughAttempt {
    pub address: String,
    pub outcome: AttemptOutcome,
    /// Error text, or guest output on success
    pub diagnostic: String,
    /// Emulator command line, when a guest was launched
    pub guest_command: Option<String>,
}

impl PassthroughAttempt {
    /// Attempt that ended before a guest was launched.
    pub fn failed(address: &str, outcome: AttemptOutcome, error: &ProbeError) -> Self {
        Self {
            address: address.to_string(),
            outcome,
            diagnostic: error.to_string(),
            guest_command: None,
        }
    }
}

/// Launches test guests and classifies the result.
#[derive(Clone)]
pub struct TestHarness {
    launcher: Arc<dyn GuestLauncher>,
    guest: GuestConfig,
}

impl TestHarness {
    pub fn new(launcher: Arc<dyn GuestLauncher>, guest: GuestConfig) -> Self {
        Self { launcher, guest }
    }

    /// Launch a guest with `device` passed through and classify the run.
    #[instrument(skip(self, device), fields(address = %device.address, launcher = self.launcher.name()))]
    pub async fn test_device(&self, device: &PciDevice) -> PassthroughAttempt {
        let command = self.guest.command_line(&device.address);
        info!(command = %command, "Testing device");

        let start = Instant::now();
        let result = self.launcher.launch(&device.address, &self.guest).await;
        metrics::record_launch(start.elapsed().as_secs_f64(), self.launcher.name());

        let (outcome, diagnostic) = match result {
            // Any stderr output at all is a failure, even whitespace.
            Ok(output) if !output.stderr.is_empty() => {
                let text = output.stderr.trim();
                let diagnostic = if text.is_empty() {
                    "emulator wrote blank output to stderr".to_string()
                } else {
                    text.to_string()
                };
                (AttemptOutcome::HypervisorLaunchFailed, diagnostic)
            }
            Ok(output) => {
                let mut diagnostic = output.stdout.trim().to_string();
                if output.timed_out {
                    if !diagnostic.is_empty() {
                        diagnostic.push('\n');
                    }
                    diagnostic.push_str(&format!(
                        "guest still running after {}s, stopped",
                        self.guest.timeout_secs
                    ));
                }
                (AttemptOutcome::Success, diagnostic)
            }
            Err(e) => (AttemptOutcome::HypervisorLaunchFailed, e.to_string()),
        };

        if outcome.is_success() {
            info!("Guest accepted passthrough device");
        } else {
            warn!(diagnostic = %diagnostic, "Guest launch failed");
        }

        PassthroughAttempt {
            address: device.address.clone(),
            outcome,
            diagnostic,
            guest_command: Some(command),
        }
    }
}
