//! Rollback of a device to the driver it had at discovery time.

use crate::error::{BindPhase, Result};
use crate::passthrough::controller::{BindProtocol, BindingController};
use crate::pci::PciDevice;
use tracing::{debug, info};

/// What [`RestoreManager::restore`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The host already reported the original driver; nothing was written.
    AlreadyRestored,
    /// The device was moved back to its original driver.
    Restored,
}

/// Returns devices to their original drivers.
#[derive(Clone)]
pub struct RestoreManager {
    controller: BindingController,
    /// Passthrough driver whose ID/slot registration is released on restore
    target: String,
}

impl RestoreManager {
    pub fn new(controller: BindingController, target: impl Into<String>) -> Self {
        Self { controller, target: target.into() }
    }

    /// Move `device` back to `device.original_driver`.
    ///
    /// Safe to call in any state the cycle can leave a device in: bound to the
    /// passthrough driver, unbound after a failed bind, or never touched.
    /// Failures are reported in the `Restore` phase.
    pub fn restore(&self, device: &mut PciDevice) -> Result<RestoreOutcome> {
        if self.controller.protocol() == BindProtocol::Skip {
            debug!(address = %device.address, "No host-side binding to restore");
            return Ok(RestoreOutcome::AlreadyRestored);
        }

        let live = self.controller.refresh(device, BindPhase::Restore)?;

        // A registration outlives a failed bind; a device found on the target
        // (e.g. left over from an earlier run) is assumed to hold one too.
        let registration = device
            .registered_with
            .take()
            .or_else(|| {
                live.clone()
                    .filter(|d| *d == self.target && device.original_driver.as_ref() != Some(d))
            });

        if live == device.original_driver {
            if let Some(driver) = registration {
                self.controller.release_registration(device, &driver);
            }
            debug!(
                address = %device.address,
                driver = %device.original_driver_name(),
                "Device already on original driver"
            );
            return Ok(RestoreOutcome::AlreadyRestored);
        }

        if live.is_some() {
            if let Err(e) = self.controller.unbind(device) {
                device.registered_with = registration;
                return Err(e.in_phase(BindPhase::Restore));
            }
        }
        if let Some(driver) = registration {
            self.controller.release_registration(device, &driver);
        }

        if let Some(original) = device.original_driver.clone() {
            self.controller.bind_native(device, &original)?;
        }

        info!(
            address = %device.address,
            driver = %device.original_driver_name(),
            "Device restored to original driver"
        );
        Ok(RestoreOutcome::Restored)
    }
}
