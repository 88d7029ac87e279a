//! passprobe core library
//!
//! Host inventory, hypervisor detection, driver binding and guest launch for
//! testing PCI passthrough one device at a time.

pub mod audit;
pub mod config;
pub mod error;
pub mod host;
pub mod hypervisor;
pub mod observability;
pub mod passthrough;
pub mod paths;
pub mod pci;
pub mod preflight;
pub mod runner;

// Re-export commonly used items
pub use audit::{AuditLog, AuditRecord};
pub use config::{Config, DeviceOrder};
pub use error::{BindPhase, ProbeError, Result};
pub use host::{CommandOutput, CommandRunner, PciBus, SysfsBus, SystemCommandRunner};
pub use hypervisor::{HypervisorDetector, HypervisorKind};
pub use observability::init as init_observability;
pub use passthrough::{
    AttemptOutcome, BindProtocol, BindingController, GuestConfig, GuestLauncher,
    PassthroughAttempt, QemuLauncher, RestoreManager, RestoreOutcome, TestHarness,
};
pub use pci::{DeviceClass, DeviceInventory, PciDevice, VendorDeviceId};
pub use runner::{
    AutoContinue, ConfirmPolicy, Decision, DeviceReport, PassthroughRunner, PromptOperator,
    RestoreStatus, RunOptions, RunReport, SkipReason, SkippedDevice,
};
