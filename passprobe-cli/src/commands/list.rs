//! `passprobe list` command

use anyhow::Result;
use colored::Colorize;
use passprobe_core::{Config, DeviceInventory, PciBus};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "CLASS")]
    class: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
}

/// List PCI devices and their drivers
pub async fn list(config: &Config, all: bool) -> Result<()> {
    let (runner, bus) = super::host(config);
    let devices = DeviceInventory::new(runner, bus.clone()).list_devices().await?;

    let rows: Vec<DeviceRow> = devices
        .into_iter()
        .filter(|d| all || config.device_classes.contains(&d.class))
        .map(|d| {
            let mut address = d.address.clone();
            if bus.is_boot_vga(&d.address) {
                address = format!("{} {}", address, "(boot)".yellow());
            }
            DeviceRow {
                address,
                id: d.id.to_string(),
                class: d.class.to_string(),
                name: d.name.clone(),
                driver: d.current_driver_name().to_string(),
            }
        })
        .collect();

    if rows.is_empty() {
        println!("No matching PCI devices");
        return Ok(());
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    Ok(())
}
