//! `passprobe restore` command

use anyhow::Result;
use colored::Colorize;
use passprobe_core::{
    pci::normalize_pci_address, BindingController, Config, DeviceInventory, HypervisorDetector,
    RestoreManager, RestoreOutcome,
};

/// Rebind a device to `driver`, releasing any passthrough registration
pub async fn restore(config: &Config, address: &str, driver: &str) -> Result<()> {
    let address = normalize_pci_address(address)?;
    let (runner, bus) = super::host(config);

    let hypervisor = match config.hypervisor_override()? {
        Some(kind) => kind,
        None => HypervisorDetector::new(runner.clone()).detect().await?,
    };

    let mut device = DeviceInventory::new(runner, bus.clone())
        .list_devices()
        .await?
        .into_iter()
        .find(|d| d.address == address)
        .ok_or_else(|| anyhow::anyhow!("Device {} not found", address))?;
    device.original_driver = Some(driver.to_string());

    let controller = BindingController::new(bus, hypervisor)?;
    let target = controller
        .protocol()
        .target_driver(&config.passthrough_driver, &config.xen_backend_driver)
        .to_string();

    match RestoreManager::new(controller, target).restore(&mut device)? {
        RestoreOutcome::AlreadyRestored => {
            println!("{} {} already on {}", "✓".green().bold(), address, device.current_driver_name());
        }
        RestoreOutcome::Restored => {
            println!("{} {} bound to {}", "✓".green().bold(), address.bold(), driver);
        }
    }

    Ok(())
}
