//! PCI device discovery.

mod device;
mod inventory;

pub use device::{
    is_valid_pci_address, normalize_pci_address, DeviceClass, PciDevice, VendorDeviceId,
};
pub use inventory::{parse_lspci, parse_lspci_line, DeviceInventory, LspciEntry};
