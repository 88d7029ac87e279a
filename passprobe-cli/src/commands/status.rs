//! `passprobe status` command

use anyhow::Result;
use passprobe_core::{pci::normalize_pci_address, Config, DeviceInventory, PciBus};

/// Show the driver state of one device
pub async fn status(config: &Config, address: &str) -> Result<()> {
    let address = normalize_pci_address(address)?;
    let (runner, bus) = super::host(config);

    let devices = DeviceInventory::new(runner, bus.clone()).list_devices().await?;
    let device = devices
        .into_iter()
        .find(|d| d.address == address)
        .ok_or_else(|| anyhow::anyhow!("Device {} not found", address))?;

    println!("Address:   {}", device.address);
    println!("Name:      {}", device.name);
    println!("ID:        {}", device.id);
    println!("Class:     {} ({})", device.class, device.class_description);
    println!("Driver:    {}", device.current_driver_name());
    println!("Boot VGA:  {}", if bus.is_boot_vga(&device.address) { "yes" } else { "no" });
    println!(
        "Driver {} loaded: {}",
        config.passthrough_driver,
        if bus.driver_available(&config.passthrough_driver) { "yes" } else { "no" }
    );

    Ok(())
}
