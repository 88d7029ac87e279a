//! Error types for passprobe.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Run-level failures (inventory, hypervisor detection) abort the whole run;
//! everything else is attributed to exactly one device.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for passprobe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Which step of a device's driver transition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPhase {
    Unbind,
    Bind,
    Restore,
}

impl fmt::Display for BindPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbind => write!(f, "unbind"),
            Self::Bind => write!(f, "bind"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// Main error type for passprobe.
#[derive(Error, Debug)]
pub enum ProbeError {
    // Run-level (fatal) errors
    #[error("PCI inventory unavailable: {reason}")]
    InventoryUnavailable { reason: String },

    #[error("No hypervisor detected in kernel log; refusing to touch any driver bindings")]
    HypervisorUndetected,

    #[error("Unsupported hypervisor: {hypervisor}")]
    UnsupportedHypervisor { hypervisor: String },

    #[error("Required command not found: {command}. {hint}")]
    CommandNotFound { command: String, hint: String },

    // Per-device errors
    #[error("Failed to {phase} device {address}: {reason}")]
    Bind { phase: BindPhase, address: String, reason: String },

    #[error("Failed to launch guest for device {address}: {reason}")]
    Launch { address: String, reason: String },

    #[error("Device {address} left without its original driver, manual recovery required: {reason}")]
    ManualRecoveryRequired { address: String, reason: String },

    #[error("Invalid PCI address: {address} (expected: 0000:01:00.0)")]
    InvalidPciAddress { address: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProbeError {
    /// Shorthand for a per-device binding failure.
    pub fn bind(phase: BindPhase, address: &str, reason: impl Into<String>) -> Self {
        Self::Bind { phase, address: address.to_string(), reason: reason.into() }
    }

    /// Re-attribute a binding failure to another phase; other errors pass through.
    pub fn in_phase(self, phase: BindPhase) -> Self {
        match self {
            Self::Bind { address, reason, .. } => Self::Bind { phase, address, reason },
            other => other,
        }
    }

    /// Whether this error aborts the whole run rather than a single device cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InventoryUnavailable { .. }
                | Self::HypervisorUndetected
                | Self::UnsupportedHypervisor { .. }
                | Self::CommandNotFound { .. }
                | Self::InvalidConfig { .. }
        )
    }
}
