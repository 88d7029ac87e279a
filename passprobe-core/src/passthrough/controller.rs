//! Driver binding controller.
//!
//! Moves one device through `Bound(original) -> Unbound -> Bound(target)`.
//! Every transition re-reads the bound driver from the bus before writing and
//! again afterwards, and stores what the host reported in
//! `PciDevice::current_driver`. Nothing is retried.

use crate::error::{BindPhase, ProbeError, Result};
use crate::host::{ControlFile, ControlKind, PciBus};
use crate::hypervisor::HypervisorKind;
use crate::pci::PciDevice;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a device is attached to its passthrough driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindProtocol {
    /// KVM: register the vendor:device ID through `new_id`, then `bind`.
    NewId,
    /// Xen: hand the slot to the pciback backend through `new_slot`, then `bind`.
    NewSlot,
    /// VMware: write the address straight to `bind`.
    DirectBind,
    /// Hyper-V: no host-side rebinding at all.
    Skip,
}

impl BindProtocol {
    /// Protocol for a detected hypervisor.
    pub fn for_hypervisor(kind: HypervisorKind) -> Result<Self> {
        match kind {
            HypervisorKind::Kvm => Ok(Self::NewId),
            HypervisorKind::Xen => Ok(Self::NewSlot),
            HypervisorKind::VMware => Ok(Self::DirectBind),
            HypervisorKind::HyperV => Ok(Self::Skip),
            HypervisorKind::Unknown => Err(ProbeError::HypervisorUndetected),
        }
    }

    /// Driver a device is bound to for passthrough under this protocol.
    pub fn target_driver<'a>(self, passthrough_driver: &'a str, xen_backend: &'a str) -> &'a str {
        match self {
            Self::NewSlot => xen_backend,
            _ => passthrough_driver,
        }
    }
}

/// Unbinds devices from their drivers and binds them to passthrough drivers.
#[derive(Clone)]
pub struct BindingController {
    bus: Arc<dyn PciBus>,
    hypervisor: HypervisorKind,
    protocol: BindProtocol,
}

impl BindingController {
    /// Create a controller for `hypervisor`.
    ///
    /// Fails for `Unknown`: there is no safe default protocol.
    pub fn new(bus: Arc<dyn PciBus>, hypervisor: HypervisorKind) -> Result<Self> {
        let protocol = BindProtocol::for_hypervisor(hypervisor)?;
        Ok(Self { bus, hypervisor, protocol })
    }

    pub fn hypervisor(&self) -> HypervisorKind {
        self.hypervisor
    }

    pub fn protocol(&self) -> BindProtocol {
        self.protocol
    }

    /// Detach `device` from the driver it is currently bound to.
    ///
    /// The host must still report the driver recorded in
    /// `device.current_driver`; a mismatch means someone else changed the
    /// binding and the device is left alone.
    pub fn unbind(&self, device: &mut PciDevice) -> Result<()> {
        if self.protocol == BindProtocol::Skip {
            debug!(address = %device.address, hypervisor = %self.hypervisor, "Unbind not required");
            return Ok(());
        }

        let expected = device.current_driver.clone();
        let live = self.refresh(device, BindPhase::Unbind)?;

        if live != expected {
            return Err(ProbeError::bind(
                BindPhase::Unbind,
                &device.address,
                format!(
                    "driver changed underneath us: expected {}, host reports {}",
                    expected.as_deref().unwrap_or("none"),
                    live.as_deref().unwrap_or("none")
                ),
            ));
        }

        let Some(driver) = live else {
            debug!(address = %device.address, "Device already unbound");
            return Ok(());
        };

        debug!(address = %device.address, driver = %driver, "Unbinding from driver");
        let unbind = ControlFile::new(&driver, ControlKind::Unbind);
        self.write_address(&unbind, &device.address, BindPhase::Unbind)?;

        if let Some(still) = self.refresh(device, BindPhase::Unbind)? {
            return Err(ProbeError::bind(
                BindPhase::Unbind,
                &device.address,
                format!("host still reports driver {} after unbind", still),
            ));
        }

        info!(address = %device.address, driver = %driver, "Device unbound");
        Ok(())
    }

    /// Attach an unbound `device` to `target` using the hypervisor's protocol.
    pub fn bind(&self, device: &mut PciDevice, target: &str) -> Result<()> {
        if self.protocol == BindProtocol::Skip {
            debug!(address = %device.address, hypervisor = %self.hypervisor, "Bind not required");
            return Ok(());
        }

        match self.refresh(device, BindPhase::Bind)? {
            Some(d) if d == target => {
                debug!(address = %device.address, driver = %target, "Device already bound");
                return Ok(());
            }
            Some(d) => {
                return Err(ProbeError::bind(
                    BindPhase::Bind,
                    &device.address,
                    format!("device is still bound to {}", d),
                ));
            }
            None => {}
        }

        debug!(
            address = %device.address,
            driver = %target,
            protocol = ?self.protocol,
            "Binding to passthrough driver"
        );

        match self.protocol {
            BindProtocol::NewId => {
                self.register_device_id(device, target)?;
                device.registered_with = Some(target.to_string());
                // vfio-pci may claim the device on its own once it knows the ID.
                if self.refresh(device, BindPhase::Bind)?.as_deref() != Some(target) {
                    self.write_bind(device, target, BindPhase::Bind)?;
                }
            }
            BindProtocol::NewSlot => {
                self.write_address(
                    &ControlFile::new(target, ControlKind::NewSlot),
                    &device.address,
                    BindPhase::Bind,
                )?;
                device.registered_with = Some(target.to_string());
                self.write_bind(device, target, BindPhase::Bind)?;
            }
            BindProtocol::DirectBind => self.write_bind(device, target, BindPhase::Bind)?,
            BindProtocol::Skip => return Ok(()),
        }

        self.expect_driver(device, target, BindPhase::Bind)?;
        info!(address = %device.address, driver = %target, "Device bound");
        Ok(())
    }

    /// Bind an unbound device back to a native kernel driver via its `bind` file.
    pub(crate) fn bind_native(&self, device: &mut PciDevice, driver: &str) -> Result<()> {
        match self.refresh(device, BindPhase::Restore)? {
            Some(d) if d == driver => return Ok(()),
            Some(d) => {
                return Err(ProbeError::bind(
                    BindPhase::Restore,
                    &device.address,
                    format!("device is bound to {} instead of being unbound", d),
                ));
            }
            None => {}
        }

        self.write_bind(device, driver, BindPhase::Restore)?;
        self.expect_driver(device, driver, BindPhase::Restore)
    }

    /// Undo the ID/slot registration made by [`bind`](Self::bind).
    ///
    /// Best effort: failures are logged, the device is already detached.
    pub(crate) fn release_registration(&self, device: &PciDevice, driver: &str) {
        let (file, value) = match self.protocol {
            BindProtocol::NewId => {
                (ControlFile::new(driver, ControlKind::RemoveId), device.id.new_id_string())
            }
            BindProtocol::NewSlot => {
                (ControlFile::new(driver, ControlKind::RemoveSlot), device.address.clone())
            }
            BindProtocol::DirectBind | BindProtocol::Skip => return,
        };

        if let Err(e) = self.bus.write_control(&file, &value) {
            warn!(address = %device.address, file = %file, error = %e, "Failed to release driver registration");
        }
    }

    /// Re-read the bound driver and store it on the device.
    pub(crate) fn refresh(&self, device: &mut PciDevice, phase: BindPhase) -> Result<Option<String>> {
        let live = self
            .bus
            .current_driver(&device.address)
            .map_err(|e| ProbeError::bind(phase, &device.address, e.to_string()))?;
        device.current_driver = live.clone();
        Ok(live)
    }

    // --- Private helpers ---

    fn expect_driver(&self, device: &mut PciDevice, driver: &str, phase: BindPhase) -> Result<()> {
        let live = self.refresh(device, phase)?;
        if live.as_deref() != Some(driver) {
            return Err(ProbeError::bind(
                phase,
                &device.address,
                format!(
                    "host reports driver {} after binding to {}",
                    live.as_deref().unwrap_or("none"),
                    driver
                ),
            ));
        }
        Ok(())
    }

    /// Register the device's vendor:device ID with `driver`.
    fn register_device_id(&self, device: &PciDevice, driver: &str) -> Result<()> {
        let file = ControlFile::new(driver, ControlKind::NewId);
        let id = device.id.new_id_string();

        debug!(address = %device.address, id = %device.id, driver, "Registering device ID");

        match self.bus.write_control(&file, &id) {
            Ok(()) => Ok(()),
            Err(e) => {
                // "File exists" or "Device or resource busy" means already registered
                let err_str = e.to_string();
                if err_str.contains("exist") || err_str.contains("busy") {
                    debug!(id = %device.id, driver, "Device ID already registered");
                    Ok(())
                } else {
                    Err(write_error(BindPhase::Bind, &device.address, &file, &e))
                }
            }
        }
    }

    /// Write the address to `driver`'s bind file.
    ///
    /// A rejected write still counts when the host already shows the device on
    /// `driver` (it was probed automatically).
    fn write_bind(&self, device: &mut PciDevice, driver: &str, phase: BindPhase) -> Result<()> {
        let file = ControlFile::new(driver, ControlKind::Bind);
        match self.bus.write_control(&file, &device.address) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.refresh(device, phase)?.as_deref() == Some(driver) {
                    debug!(address = %device.address, driver, "Device auto-bound");
                    Ok(())
                } else {
                    Err(write_error(phase, &device.address, &file, &e))
                }
            }
        }
    }

    fn write_address(&self, file: &ControlFile, address: &str, phase: BindPhase) -> Result<()> {
        self.bus.write_control(file, address).map_err(|e| write_error(phase, address, file, &e))
    }
}

fn write_error(phase: BindPhase, address: &str, file: &ControlFile, err: &io::Error) -> ProbeError {
    ProbeError::bind(phase, address, format!("{}: {}", file, err))
}
