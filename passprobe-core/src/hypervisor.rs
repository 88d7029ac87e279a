//! Hypervisor detection from the kernel log.

use crate::error::{ProbeError, Result};
use crate::host::CommandRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Virtualization technology owning the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HypervisorKind {
    Kvm,
    Xen,
    VMware,
    HyperV,
    Unknown,
}

/// Detection table, in priority order. First match wins.
const MARKERS: &[(HypervisorKind, &str)] = &[
    (HypervisorKind::Kvm, "kvm"),
    (HypervisorKind::Xen, "xen"),
    (HypervisorKind::VMware, "vmware"),
    (HypervisorKind::HyperV, "hyper-v"),
];

impl HypervisorKind {
    /// Classify kernel diagnostic text.
    ///
    /// Matching is case-insensitive substring search in the fixed order
    /// KVM, Xen, VMware, Hyper-V.
    pub fn from_kernel_log(text: &str) -> Self {
        let text = text.to_lowercase();
        MARKERS
            .iter()
            .find(|(_, marker)| text.contains(marker))
            .map(|(kind, _)| *kind)
            .unwrap_or(Self::Unknown)
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kvm => write!(f, "KVM"),
            Self::Xen => write!(f, "Xen"),
            Self::VMware => write!(f, "VMware"),
            Self::HyperV => write!(f, "Hyper-V"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for HypervisorKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kvm" => Ok(Self::Kvm),
            "xen" => Ok(Self::Xen),
            "vmware" => Ok(Self::VMware),
            "hyperv" | "hyper-v" | "microsoft hyper-v" => Ok(Self::HyperV),
            other => Err(ProbeError::UnsupportedHypervisor { hypervisor: other.to_string() }),
        }
    }
}

/// Detects the hypervisor by reading `dmesg`.
#[derive(Clone)]
pub struct HypervisorDetector {
    runner: Arc<dyn CommandRunner>,
}

impl HypervisorDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Detect the active hypervisor.
    ///
    /// Returns `Unknown` when nothing matches, including when the kernel log
    /// cannot be read (e.g. `dmesg_restrict`).
    #[instrument(skip(self))]
    pub async fn detect(&self) -> Result<HypervisorKind> {
        let output = self.runner.run("dmesg", &[]).await?;
        if !output.success {
            warn!(stderr = %output.stderr.trim(), "dmesg failed; kernel log unavailable");
        }

        let kind = HypervisorKind::from_kernel_log(&output.stdout);
        if kind.is_known() {
            info!(hypervisor = %kind, "Detected virtualization system");
        } else {
            warn!("No hypervisor marker found in kernel log");
        }
        Ok(kind)
    }
}
