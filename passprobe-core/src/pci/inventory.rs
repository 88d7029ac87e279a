//! PCI device inventory.
//!
//! Enumerates devices with `lspci -Dnn` and fills in each device's bound
//! driver from the bus. All lspci text parsing lives here.

use crate::error::{ProbeError, Result};
use crate::host::{CommandRunner, PciBus};
use crate::pci::device::{normalize_pci_address, DeviceClass, PciDevice, VendorDeviceId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// One `lspci -nn` line:
/// `0000:01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GA102 [GeForce RTX 3090] [10de:2204] (rev a1)`
///
/// The vendor text may itself contain brackets, so the greedy name group
/// anchors on the last `[vvvv:dddd]` pair.
static LSPCI_LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<addr>\S+)\s+(?P<class>.+?)\s+\[[0-9a-fA-F]{4}\]:\s+(?P<name>.+)\s+\[(?P<id>[0-9a-fA-F]{4}:[0-9a-fA-F]{4})\](?:\s+\(.*\))?\s*$",
    )
    .expect("Invalid lspci line regex")
});

/// A parsed lspci entry, before driver state is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LspciEntry {
    pub address: String,
    pub id: VendorDeviceId,
    pub class_description: String,
    pub name: String,
}

/// Parse one line of `lspci -nn` / `lspci -Dnn` output.
pub fn parse_lspci_line(line: &str) -> Option<LspciEntry> {
    let caps = LSPCI_LINE_REGEX.captures(line.trim())?;
    let address = normalize_pci_address(&caps["addr"]).ok()?;
    let id = VendorDeviceId::parse(&caps["id"])?;

    Some(LspciEntry {
        address,
        id,
        class_description: caps["class"].trim().to_string(),
        name: caps["name"].trim().to_string(),
    })
}

/// Parse full lspci output, preserving bus order.
///
/// Blank lines are ignored; any other line that does not parse makes the
/// whole result unusable.
pub fn parse_lspci(output: &str) -> Result<Vec<LspciEntry>> {
    let mut entries = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let entry = parse_lspci_line(line).ok_or_else(|| ProbeError::InventoryUnavailable {
            reason: format!("Malformed lspci line: {:?}", line),
        })?;
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(ProbeError::InventoryUnavailable {
            reason: "lspci reported no PCI devices".to_string(),
        });
    }

    Ok(entries)
}

/// Lists PCI devices from the host.
#[derive(Clone)]
pub struct DeviceInventory {
    runner: Arc<dyn CommandRunner>,
    bus: Arc<dyn PciBus>,
}

impl DeviceInventory {
    pub fn new(runner: Arc<dyn CommandRunner>, bus: Arc<dyn PciBus>) -> Self {
        Self { runner, bus }
    }

    /// Enumerate all PCI devices in bus order.
    ///
    /// Every device's `original_driver` and `current_driver` are read from the
    /// bus at this moment.
    #[instrument(skip(self))]
    pub async fn list_devices(&self) -> Result<Vec<PciDevice>> {
        let output = self.runner.run("lspci", &["-Dnn"]).await.map_err(|e| match e {
            ProbeError::CommandNotFound { command, .. } => ProbeError::InventoryUnavailable {
                reason: format!("{} is not installed", command),
            },
            other => ProbeError::InventoryUnavailable { reason: other.to_string() },
        })?;

        if !output.success {
            return Err(ProbeError::InventoryUnavailable {
                reason: format!("lspci failed: {}", output.stderr.trim()),
            });
        }

        let mut devices = Vec::new();
        for entry in parse_lspci(&output.stdout)? {
            let driver = self.bus.current_driver(&entry.address).map_err(|e| {
                ProbeError::InventoryUnavailable {
                    reason: format!("Cannot read driver of {}: {}", entry.address, e),
                }
            })?;

            let class = DeviceClass::from_description(&entry.class_description);
            debug!(
                address = %entry.address,
                id = %entry.id,
                class = %class,
                driver = ?driver,
                "Discovered PCI device"
            );

            devices.push(PciDevice {
                address: entry.address,
                id: entry.id,
                class,
                class_description: entry.class_description,
                name: entry.name,
                original_driver: driver.clone(),
                current_driver: driver,
                registered_with: None,
            });
        }

        info!(devices = devices.len(), "PCI inventory complete");
        Ok(devices)
    }
}
