//! PCI driver control filesystem (sysfs).
//!
//! Layout under the bus root (default `/sys/bus/pci`):
//!
//! ```text
//! devices/<address>/driver      -> ../../../bus/pci/drivers/<name>
//! devices/<address>/boot_vga    "1" for the GPU that drove the console at boot
//! drivers/<name>/unbind         write an address to detach it
//! drivers/<name>/bind           write an address to attach it
//! drivers/<name>/new_id         write "vvvv dddd" to teach the driver an ID
//! drivers/<name>/remove_id      write "vvvv dddd" to forget it again
//! drivers/<name>/new_slot       (Xen pciback) write an address to claim it
//! drivers/<name>/remove_slot    (Xen pciback) write an address to release it
//! ```

use crate::error::{ProbeError, Result};
use crate::paths::DEFAULT_SYSFS_ROOT;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// A per-driver control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Unbind,
    Bind,
    NewId,
    RemoveId,
    NewSlot,
    RemoveSlot,
}

impl ControlKind {
    /// File name of the endpoint inside the driver directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Unbind => "unbind",
            Self::Bind => "bind",
            Self::NewId => "new_id",
            Self::RemoveId => "remove_id",
            Self::NewSlot => "new_slot",
            Self::RemoveSlot => "remove_slot",
        }
    }
}

/// A control file of a named driver, e.g. `drivers/vfio-pci/bind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    pub driver: String,
    pub kind: ControlKind,
}

impl ControlFile {
    pub fn new(driver: &str, kind: ControlKind) -> Self {
        Self { driver: driver.to_string(), kind }
    }

    /// Path relative to the bus root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from("drivers").join(&self.driver).join(self.kind.file_name())
    }
}

impl fmt::Display for ControlFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drivers/{}/{}", self.driver, self.kind.file_name())
    }
}

/// Host PCI bus: driver bindings are read and mutated only through this trait.
///
/// Implementations must not cache driver state; every call reflects the host
/// at the moment it is made.
pub trait PciBus: Send + Sync {
    /// Driver currently bound to `address`, or `None` when unbound.
    fn current_driver(&self, address: &str) -> Result<Option<String>>;

    /// Write `value` to a driver control file.
    fn write_control(&self, file: &ControlFile, value: &str) -> io::Result<()>;

    /// Whether `driver` is registered with the bus.
    fn driver_available(&self, driver: &str) -> bool;

    /// Whether `address` is the boot VGA device.
    fn is_boot_vga(&self, address: &str) -> bool;
}

/// [`PciBus`] backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsBus {
    root: PathBuf,
}

impl Default for SysfsBus {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsBus {
    /// Create a bus rooted at `root` (normally `/sys/bus/pci`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn device_path(&self, address: &str) -> PathBuf {
        self.root.join("devices").join(address)
    }
}

impl PciBus for SysfsBus {
    fn current_driver(&self, address: &str) -> Result<Option<String>> {
        let device_path = self.device_path(address);
        if !device_path.exists() {
            return Err(ProbeError::IoError {
                path: device_path,
                source: io::Error::new(io::ErrorKind::NotFound, "PCI device not found"),
            });
        }

        let driver_link = device_path.join("driver");
        match fs::read_link(&driver_link) {
            Ok(target) => {
                Ok(target.file_name().map(|n| n.to_string_lossy().to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProbeError::IoError { path: driver_link, source: e }),
        }
    }

    fn write_control(&self, file: &ControlFile, value: &str) -> io::Result<()> {
        let path = self.root.join(file.relative_path());
        debug!(path = %path.display(), value, "Writing driver control file");

        // sysfs attributes must be opened for writing without O_CREAT so a
        // missing endpoint surfaces as NotFound instead of a stray regular file.
        let mut f = fs::OpenOptions::new().write(true).open(&path)?;
        io::Write::write_all(&mut f, value.as_bytes())
    }

    fn driver_available(&self, driver: &str) -> bool {
        self.root.join("drivers").join(driver).is_dir()
    }

    fn is_boot_vga(&self, address: &str) -> bool {
        fs::read_to_string(self.device_path(address).join("boot_vga"))
            .ok()
            .is_some_and(|s| s.trim() == "1")
    }
}
