//! Audit log of tested devices.
//!
//! One human-readable key:value block is appended per successfully tested
//! device. The layout is meant for operators and is not a stable format.

use crate::error::{ProbeError, Result};
use crate::hypervisor::HypervisorKind;
use crate::passthrough::PassthroughAttempt;
use crate::pci::PciDevice;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One audit entry.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub device: String,
    pub class: String,
    pub original_driver: String,
    pub hypervisor: HypervisorKind,
    pub outcome: String,
    pub guest_command: String,
}

impl AuditRecord {
    pub fn new(device: &PciDevice, hypervisor: HypervisorKind, attempt: &PassthroughAttempt) -> Self {
        Self {
            timestamp: Utc::now(),
            address: device.address.clone(),
            device: format!("{} [{}]", device.name, device.id),
            class: device.class.to_string(),
            original_driver: device.original_driver_name().to_string(),
            hypervisor,
            outcome: attempt.outcome.to_string(),
            guest_command: attempt.guest_command.clone().unwrap_or_else(|| "-".to_string()),
        }
    }

    /// Render as a key:value block terminated by a blank line.
    pub fn render(&self) -> String {
        format!(
            "Timestamp: {}\n\
             Address: {}\n\
             Device: {}\n\
             Class: {}\n\
             Original Driver: {}\n\
             Hypervisor: {}\n\
             Outcome: {}\n\
             Guest Command: {}\n\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.address,
            self.device,
            self.class,
            self.original_driver,
            self.hypervisor,
            self.outcome,
            self.guest_command,
        )
    }
}

/// Append-only audit log file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, creating the file and its parent directory as needed.
    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProbeError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ProbeError::IoError { path: self.path.clone(), source: e })?;

        file.write_all(record.render().as_bytes())
            .map_err(|e| ProbeError::IoError { path: self.path.clone(), source: e })?;

        debug!(path = %self.path.display(), address = %record.address, "Audit record appended");
        Ok(())
    }
}
