//! In-memory host for integration tests.
//!
//! `MockBus` keeps a driver binding table and applies control-file writes to
//! it the way the kernel would, without auto-probing.

#![allow(dead_code)]

use async_trait::async_trait;
use passprobe_core::{
    host::{ControlFile, ControlKind},
    CommandOutput, CommandRunner, GuestConfig, GuestLauncher, PciBus, ProbeError, Result,
};
use passprobe_core::passthrough::LaunchOutput;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

pub const LSPCI: &str = "\
0000:00:00.0 Host bridge [0600]: Intel Corporation Device [8086:4660] (rev 02)
0000:00:14.0 USB controller [0c03]: Intel Corporation Alder Lake-S PCH USB 3.2 XHCI Controller [8086:7ae0] (rev 11)
0000:00:1f.3 Audio device [0403]: Intel Corporation Alder Lake-S HD Audio Controller [8086:7ad0] (rev 11)
0000:01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GA102 [GeForce RTX 3090] [10de:2204] (rev a1)
";

pub const DMESG_KVM: &str = "[    0.000000] Linux version 6.8.0\n[    1.204511] kvm: Nested Virtualization enabled\n";
pub const DMESG_XEN: &str = "[    0.000000] Booting paravirtualized kernel on Xen HVM\n";
pub const DMESG_VMWARE: &str = "[    0.000000] DMI: VMware, Inc. VMware Virtual Platform\n";
pub const DMESG_HYPERV: &str = "[    0.000000] Hypervisor detected: Microsoft Hyper-V\n";
pub const DMESG_BARE: &str = "[    0.000000] Linux version 6.8.0\n[    0.100000] ACPI: Core revision\n";

#[derive(Default)]
struct BusState {
    devices: HashSet<String>,
    drivers: HashSet<String>,
    bound: HashMap<String, String>,
    boot_vga: HashSet<String>,
    rejected: HashSet<String>,
    writes: Vec<(String, String)>,
}

/// Fake PCI bus with the host layout of [`LSPCI`].
pub struct MockBus {
    state: Mutex<BusState>,
}

impl MockBus {
    /// nouveau on the GPU, xhci_hcd on USB, snd_hda_intel on audio, nothing
    /// on the host bridge. vfio-pci and pciback are loaded.
    pub fn host() -> Self {
        let mut state = BusState::default();
        for addr in ["0000:00:00.0", "0000:00:14.0", "0000:00:1f.3", "0000:01:00.0"] {
            state.devices.insert(addr.to_string());
        }
        for driver in ["nouveau", "xhci_hcd", "snd_hda_intel", "vfio-pci", "pciback"] {
            state.drivers.insert(driver.to_string());
        }
        state.bound.insert("0000:01:00.0".into(), "nouveau".into());
        state.bound.insert("0000:00:14.0".into(), "xhci_hcd".into());
        state.bound.insert("0000:00:1f.3".into(), "snd_hda_intel".into());
        Self { state: Mutex::new(state) }
    }

    /// Reject every write to `file` (e.g. `drivers/vfio-pci/bind`).
    pub fn reject(&self, file: &str) {
        self.state.lock().unwrap().rejected.insert(file.to_string());
    }

    pub fn unload_driver(&self, driver: &str) {
        self.state.lock().unwrap().drivers.remove(driver);
    }

    pub fn mark_boot_vga(&self, address: &str) {
        self.state.lock().unwrap().boot_vga.insert(address.to_string());
    }

    /// Change a binding behind the controller's back.
    pub fn set_driver(&self, address: &str, driver: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        match driver {
            Some(d) => state.bound.insert(address.to_string(), d.to_string()),
            None => state.bound.remove(address),
        };
    }

    pub fn driver_of(&self, address: &str) -> Option<String> {
        self.state.lock().unwrap().bound.get(address).cloned()
    }

    /// All attempted writes as `("drivers/<d>/<file>", value)`.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn wrote(&self, file: &str) -> bool {
        self.writes().iter().any(|(f, _)| f == file)
    }

    pub fn writes_for(&self, value: &str) -> Vec<String> {
        self.writes().into_iter().filter(|(_, v)| v == value).map(|(f, _)| f).collect()
    }
}

impl PciBus for MockBus {
    fn current_driver(&self, address: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        if !state.devices.contains(address) {
            return Err(ProbeError::IoError {
                path: PathBuf::from("devices").join(address),
                source: io::Error::new(io::ErrorKind::NotFound, "PCI device not found"),
            });
        }
        Ok(state.bound.get(address).cloned())
    }

    fn write_control(&self, file: &ControlFile, value: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = file.to_string();
        state.writes.push((name.clone(), value.to_string()));

        if state.rejected.contains(&name) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "write rejected"));
        }
        if !state.drivers.contains(&file.driver) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"));
        }

        match file.kind {
            ControlKind::Unbind => {
                if state.bound.get(value) == Some(&file.driver) {
                    state.bound.remove(value);
                    Ok(())
                } else {
                    Err(io::Error::new(io::ErrorKind::InvalidInput, "No such device"))
                }
            }
            ControlKind::Bind => {
                if !state.devices.contains(value) || state.bound.contains_key(value) {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "No such device"));
                }
                state.bound.insert(value.to_string(), file.driver.clone());
                Ok(())
            }
            ControlKind::NewId
            | ControlKind::RemoveId
            | ControlKind::NewSlot
            | ControlKind::RemoveSlot => Ok(()),
        }
    }

    fn driver_available(&self, driver: &str) -> bool {
        self.state.lock().unwrap().drivers.contains(driver)
    }

    fn is_boot_vga(&self, address: &str) -> bool {
        self.state.lock().unwrap().boot_vga.contains(address)
    }
}

/// Canned command output keyed by program name.
#[derive(Default)]
pub struct MockRunner {
    outputs: HashMap<String, CommandOutput>,
    calls: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(lspci: &str, dmesg: &str) -> Self {
        let mut outputs = HashMap::new();
        outputs.insert("lspci".to_string(), ok_output(lspci));
        outputs.insert("dmesg".to_string(), ok_output(dmesg));
        outputs.insert("modprobe".to_string(), ok_output(""));
        Self { outputs, calls: Mutex::new(Vec::new()) }
    }

    pub fn with_output(mut self, program: &str, output: CommandOutput) -> Self {
        self.outputs.insert(program.to_string(), output);
        self
    }

    pub fn without(mut self, program: &str) -> Self {
        self.outputs.remove(program);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput { success: true, stdout: stdout.to_string(), stderr: String::new() }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);

        self.outputs.get(program).cloned().ok_or_else(|| ProbeError::CommandNotFound {
            command: program.to_string(),
            hint: "not mocked".to_string(),
        })
    }
}

/// Guest launcher that returns canned stderr per device address.
#[derive(Default)]
pub struct MockLauncher {
    stderr: HashMap<String, String>,
    launched: Mutex<Vec<String>>,
}

impl MockLauncher {
    pub fn failing_for(mut self, address: &str, stderr: &str) -> Self {
        self.stderr.insert(address.to_string(), stderr.to_string());
        self
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl GuestLauncher for MockLauncher {
    async fn launch(&self, address: &str, _config: &GuestConfig) -> Result<LaunchOutput> {
        self.launched.lock().unwrap().push(address.to_string());
        let stderr = self.stderr.get(address).cloned().unwrap_or_default();
        Ok(LaunchOutput {
            exit_code: Some(if stderr.is_empty() { 0 } else { 1 }),
            stdout: "SeaBIOS (version 1.16.3)".to_string(),
            stderr,
            timed_out: false,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
