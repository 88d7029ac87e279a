//! PCI device model for passthrough testing.

use crate::error::{ProbeError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Regular expression to validate PCI address format: 0000:01:00.0
///
/// Domains behind an Intel VMD controller are wider than 16 bits (10000:e0:06.0).
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4,8}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Short form without the domain, as printed by plain `lspci`: 01:00.0
static SHORT_PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$").expect("Invalid PCI address regex")
});

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Normalize an address to the full `DDDD:BB:DD.F` form (lowercase).
/// Domains of more than four digits are kept as printed.
///
/// Addresses without a domain are placed in domain `0000`.
pub fn normalize_pci_address(address: &str) -> Result<String> {
    let address = address.trim();
    if is_valid_pci_address(address) {
        return Ok(address.to_lowercase());
    }
    if SHORT_PCI_ADDRESS_REGEX.is_match(address) {
        return Ok(format!("0000:{}", address.to_lowercase()));
    }
    Err(ProbeError::InvalidPciAddress { address: address.to_string() })
}

/// Coarse category a device falls into for passthrough candidacy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Display,
    Audio,
    #[serde(rename = "usb")]
    UsbController,
    Other,
}

impl DeviceClass {
    /// Map a free-text class description to a category.
    ///
    /// Checked in table order: "VGA"/"Display", then "Audio", then "USB".
    pub fn from_description(description: &str) -> Self {
        if description.contains("VGA") || description.contains("Display") {
            Self::Display
        } else if description.contains("Audio") {
            Self::Audio
        } else if description.contains("USB") {
            Self::UsbController
        } else {
            Self::Other
        }
    }

    /// Parse a class name as used in configuration and on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "display" | "vga" | "gpu" => Some(Self::Display),
            "audio" => Some(Self::Audio),
            "usb" => Some(Self::UsbController),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Display => write!(f, "display"),
            Self::Audio => write!(f, "audio"),
            Self::UsbController => write!(f, "usb"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Vendor:device hex pair, e.g. `10de:2204`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VendorDeviceId {
    pub vendor: String,
    pub device: String,
}

impl VendorDeviceId {
    /// Parse a `vvvv:dddd` pair.
    pub fn parse(s: &str) -> Option<Self> {
        let (vendor, device) = s.split_once(':')?;
        let is_hex4 = |p: &str| p.len() == 4 && p.chars().all(|c| c.is_ascii_hexdigit());
        if !is_hex4(vendor) || !is_hex4(device) {
            return None;
        }
        Some(Self { vendor: vendor.to_lowercase(), device: device.to_lowercase() })
    }

    /// The `"vvvv dddd"` form accepted by a driver's `new_id`/`remove_id` files.
    pub fn new_id_string(&self) -> String {
        format!("{} {}", self.vendor, self.device)
    }
}

impl fmt::Display for VendorDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor, self.device)
    }
}

/// One PCI function discovered on the host.
#[derive(Debug, Clone)]
pub struct PciDevice {
    /// PCI address (e.g., "0000:01:00.0")
    pub address: String,
    /// Vendor and device ID
    pub id: VendorDeviceId,
    /// Coarse device category
    pub class: DeviceClass,
    /// Class text as reported by the host (e.g., "VGA compatible controller")
    pub class_description: String,
    /// Vendor and model text (e.g., "NVIDIA Corporation GA102 [GeForce RTX 3090]")
    pub name: String,
    /// Driver bound when the device was discovered
    pub original_driver: Option<String>,
    /// Driver last observed on the host; refreshed after every transition
    pub current_driver: Option<String>,
    /// Passthrough driver holding a `new_id`/`new_slot` registration for this
    /// device, until restore releases it
    pub registered_with: Option<String>,
}

impl PciDevice {
    /// Original driver name, or "none".
    pub fn original_driver_name(&self) -> &str {
        self.original_driver.as_deref().unwrap_or("none")
    }

    /// Current driver name, or "none".
    pub fn current_driver_name(&self) -> &str {
        self.current_driver.as_deref().unwrap_or("none")
    }

    /// Whether the device is a passthrough candidate at all.
    pub fn is_candidate(&self) -> bool {
        self.class != DeviceClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:ff:1f.7"));
        assert!(is_valid_pci_address("ABCD:12:34.5"));
        assert!(is_valid_pci_address("10000:e0:06.0")); // VMD domain

        assert!(!is_valid_pci_address("01:00.0")); // Missing domain
        assert!(!is_valid_pci_address("0000:01:00")); // Missing function
        assert!(!is_valid_pci_address("0000:01:00.8")); // Invalid function (max 7)
        assert!(!is_valid_pci_address("invalid"));
        assert!(!is_valid_pci_address("000:01:00.0")); // Short domain
        assert!(!is_valid_pci_address("123456789:01:00.0")); // Domain over 32 bits
    }

    #[test]
    fn test_normalize_adds_domain() {
        assert_eq!(normalize_pci_address("01:00.0").unwrap(), "0000:01:00.0");
        assert_eq!(normalize_pci_address("0000:0A:00.1").unwrap(), "0000:0a:00.1");
        assert_eq!(normalize_pci_address("10000:E0:06.0").unwrap(), "10000:e0:06.0");
        assert!(normalize_pci_address("1:0.0").is_err());
    }

    #[test]
    fn test_class_from_description() {
        assert_eq!(DeviceClass::from_description("VGA compatible controller"), DeviceClass::Display);
        assert_eq!(DeviceClass::from_description("Display controller"), DeviceClass::Display);
        assert_eq!(DeviceClass::from_description("Audio Controller"), DeviceClass::Audio);
        assert_eq!(DeviceClass::from_description("Audio device"), DeviceClass::Audio);
        assert_eq!(DeviceClass::from_description("USB Controller"), DeviceClass::UsbController);
        assert_eq!(DeviceClass::from_description("Bridge"), DeviceClass::Other);
        assert_eq!(DeviceClass::from_description("PCI bridge"), DeviceClass::Other);
    }

    #[test]
    fn test_class_parse() {
        assert_eq!(DeviceClass::parse("GPU"), Some(DeviceClass::Display));
        assert_eq!(DeviceClass::parse("usb"), Some(DeviceClass::UsbController));
        assert_eq!(DeviceClass::parse("nic"), None);
    }

    #[test]
    fn test_vendor_device_id() {
        let id = VendorDeviceId::parse("10DE:2204").unwrap();
        assert_eq!(id.to_string(), "10de:2204");
        assert_eq!(id.new_id_string(), "10de 2204");
        assert!(VendorDeviceId::parse("10de").is_none());
        assert!(VendorDeviceId::parse("10de:22g4").is_none());
    }
}
