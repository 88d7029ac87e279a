//! Configuration management.

use crate::error::{ProbeError, Result};
use crate::hypervisor::HypervisorKind;
use crate::passthrough::GuestConfig;
use crate::paths;
use crate::pci::DeviceClass;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Order in which candidate devices are tested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceOrder {
    /// Host bus order
    #[default]
    Enumeration,
    /// Display devices first, then the rest in bus order
    DisplayFirst,
}

impl DeviceOrder {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "enumeration" | "bus" => Some(Self::Enumeration),
            "display-first" | "display" => Some(Self::DisplayFirst),
            _ => None,
        }
    }
}

/// Persistent configuration for passprobe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver devices are bound to for passthrough
    pub passthrough_driver: String,
    /// Backend driver used under Xen
    pub xen_backend_driver: String,
    /// Device classes considered for testing
    pub device_classes: Vec<DeviceClass>,
    pub order: DeviceOrder,
    /// Ask the operator before each device
    pub confirm: bool,
    /// Allow testing the GPU that drives the console
    pub allow_boot_vga: bool,
    /// Skip detection and use this hypervisor
    pub hypervisor: Option<String>,
    /// Root of the PCI bus in sysfs
    pub sysfs_root: String,
    /// Audit log location (defaults under the data dir)
    pub audit_log: Option<PathBuf>,
    pub log_level: String,
    pub guest: GuestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            passthrough_driver: "vfio-pci".to_string(),
            xen_backend_driver: "pciback".to_string(),
            device_classes: vec![DeviceClass::Display, DeviceClass::Audio, DeviceClass::UsbController],
            order: DeviceOrder::Enumeration,
            confirm: false,
            allow_boot_vga: false,
            hypervisor: None,
            sysfs_root: paths::DEFAULT_SYSFS_ROOT.to_string(),
            audit_log: None,
            log_level: "info".to_string(),
            guest: GuestConfig::default(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ProbeError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ProbeError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProbeError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| ProbeError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| ProbeError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.passthrough_driver.trim().is_empty() {
            return Err(ProbeError::InvalidConfig {
                reason: "passthrough_driver must not be empty".to_string(),
            });
        }
        if self.guest.timeout_secs == 0 {
            return Err(ProbeError::InvalidConfig {
                reason: "guest.timeout_secs must be at least 1".to_string(),
            });
        }
        self.hypervisor_override()?;
        Ok(())
    }

    /// Configured hypervisor override, if any.
    pub fn hypervisor_override(&self) -> Result<Option<HypervisorKind>> {
        self.hypervisor.as_deref().map(str::parse::<HypervisorKind>).transpose()
    }

    /// Audit log path, falling back to the data dir.
    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log.clone().unwrap_or_else(paths::audit_log_path)
    }
}
