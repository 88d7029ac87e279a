//! The per-device passthrough loop.
//!
//! Hypervisor detection and the inventory run once; then each candidate
//! device goes through unbind -> bind -> test -> restore, strictly one at a
//! time. Per-device failures never abort the loop; restore is attempted for
//! every device that entered a cycle.

use crate::audit::{AuditLog, AuditRecord};
use crate::config::{Config, DeviceOrder};
use crate::error::{ProbeError, Result};
use crate::host::{CommandRunner, PciBus};
use crate::hypervisor::{HypervisorDetector, HypervisorKind};
use crate::observability::metrics;
use crate::passthrough::{
    AttemptOutcome, BindProtocol, BindingController, GuestLauncher, PassthroughAttempt,
    RestoreManager, RestoreOutcome, TestHarness,
};
use crate::pci::{normalize_pci_address, DeviceClass, DeviceInventory, PciDevice};
use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What to do with the next device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Skip,
    Stop,
}

/// Consulted before every device cycle.
#[async_trait]
pub trait ConfirmPolicy: Send + Sync {
    async fn before_device(&self, device: &PciDevice, index: usize, total: usize) -> Decision;
}

/// Never pauses.
#[derive(Debug, Clone, Default)]
pub struct AutoContinue;

#[async_trait]
impl ConfirmPolicy for AutoContinue {
    async fn before_device(&self, _device: &PciDevice, _index: usize, _total: usize) -> Decision {
        Decision::Continue
    }
}

/// Asks the operator on the terminal before each device.
#[derive(Debug, Clone, Default)]
pub struct PromptOperator;

#[async_trait]
impl ConfirmPolicy for PromptOperator {
    async fn before_device(&self, device: &PciDevice, index: usize, total: usize) -> Decision {
        let question = format!(
            "[{}/{}] Test {} ({}, driver {})? [Y/n/q] ",
            index + 1,
            total,
            device.address,
            device.class,
            device.current_driver_name()
        );

        let answer = tokio::task::spawn_blocking(move || -> io::Result<Decision> {
            let mut stdout = io::stdout();
            stdout.write_all(question.as_bytes())?;
            stdout.flush()?;
            read_answer(&mut io::stdin().lock())
        })
        .await;

        match answer {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read confirmation, stopping");
                Decision::Stop
            }
            Err(e) => {
                warn!(error = %e, "Confirmation prompt failed, stopping");
                Decision::Stop
            }
        }
    }
}

/// Read one answer line. End of input stops the run.
fn read_answer(reader: &mut impl BufRead) -> io::Result<Decision> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        warn!("No operator input available, stopping");
        return Ok(Decision::Stop);
    }
    Ok(parse_answer(&line))
}

fn parse_answer(line: &str) -> Decision {
    match line.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => Decision::Continue,
        "q" | "quit" => Decision::Stop,
        _ => Decision::Skip,
    }
}

/// Where a device ended up after its cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    AlreadyRestored,
    Restored,
    /// Restore failed while the device was on the passthrough driver
    Failed { reason: String },
    /// Restore failed after the cycle had already broken during unbind/bind;
    /// the device is likely without any driver
    ManualRecoveryRequired { reason: String },
}

impl RestoreStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::AlreadyRestored | Self::Restored)
    }
}

/// Everything that happened to one device.
#[derive(Debug)]
pub struct DeviceReport {
    /// Device as last observed, after restore
    pub device: PciDevice,
    pub attempt: PassthroughAttempt,
    /// The unbind/bind error that ended the cycle early, if any
    pub failure: Option<ProbeError>,
    pub restore: RestoreStatus,
}

/// Why a candidate was not tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BootVga,
    Operator,
}

#[derive(Debug, Clone)]
pub struct SkippedDevice {
    pub address: String,
    pub reason: SkipReason,
}

/// Result of a whole run.
#[derive(Debug)]
pub struct RunReport {
    pub hypervisor: HypervisorKind,
    pub reports: Vec<DeviceReport>,
    pub skipped: Vec<SkippedDevice>,
    /// The operator stopped the run before all candidates were processed
    pub stopped_early: bool,
}

impl RunReport {
    pub fn successes(&self) -> usize {
        self.reports.iter().filter(|r| r.attempt.outcome.is_success()).count()
    }

    /// Devices that could not be returned to their original driver.
    pub fn unrestored(&self) -> impl Iterator<Item = &DeviceReport> {
        self.reports.iter().filter(|r| !r.restore.is_ok())
    }
}

/// Run settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub passthrough_driver: String,
    pub xen_backend_driver: String,
    pub device_classes: Vec<DeviceClass>,
    pub order: DeviceOrder,
    pub allow_boot_vga: bool,
    /// Test only these addresses (any class) when non-empty
    pub devices: Vec<String>,
    /// Skip detection and use this hypervisor
    pub hypervisor: Option<HypervisorKind>,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            passthrough_driver: config.passthrough_driver.clone(),
            xen_backend_driver: config.xen_backend_driver.clone(),
            device_classes: config.device_classes.clone(),
            order: config.order,
            allow_boot_vga: config.allow_boot_vga,
            devices: Vec::new(),
            hypervisor: config.hypervisor_override()?,
        })
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            passthrough_driver: "vfio-pci".to_string(),
            xen_backend_driver: "pciback".to_string(),
            device_classes: vec![DeviceClass::Display, DeviceClass::Audio, DeviceClass::UsbController],
            order: DeviceOrder::Enumeration,
            allow_boot_vga: false,
            devices: Vec::new(),
            hypervisor: None,
        }
    }
}

/// Pick and order the devices to test.
///
/// With an explicit address list only those devices are kept, regardless of
/// class; otherwise devices of the configured classes are kept.
pub fn select_candidates(devices: Vec<PciDevice>, options: &RunOptions) -> Result<Vec<PciDevice>> {
    let total = devices.len();

    let mut selected: Vec<PciDevice> = if options.devices.is_empty() {
        devices.into_iter().filter(|d| options.device_classes.contains(&d.class)).collect()
    } else {
        let wanted = options
            .devices
            .iter()
            .map(|a| normalize_pci_address(a))
            .collect::<Result<Vec<_>>>()?;
        for addr in &wanted {
            if !devices.iter().any(|d| &d.address == addr) {
                warn!(address = %addr, "Requested device not present on the host");
            }
        }
        devices.into_iter().filter(|d| wanted.contains(&d.address)).collect()
    };

    debug!(total, selected = selected.len(), "Selected candidate devices");

    if options.order == DeviceOrder::DisplayFirst {
        // Stable: non-display devices keep bus order.
        selected.sort_by_key(|d| d.class != DeviceClass::Display);
    }

    Ok(selected)
}

/// Drives every candidate device through a passthrough test cycle.
pub struct PassthroughRunner {
    runner: Arc<dyn CommandRunner>,
    bus: Arc<dyn PciBus>,
    inventory: DeviceInventory,
    detector: HypervisorDetector,
    harness: TestHarness,
    audit: Option<AuditLog>,
    policy: Arc<dyn ConfirmPolicy>,
    options: RunOptions,
}

impl PassthroughRunner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bus: Arc<dyn PciBus>,
        harness: TestHarness,
        options: RunOptions,
    ) -> Self {
        Self {
            inventory: DeviceInventory::new(runner.clone(), bus.clone()),
            detector: HypervisorDetector::new(runner.clone()),
            runner,
            bus,
            harness,
            audit: None,
            policy: Arc::new(AutoContinue),
            options,
        }
    }

    /// Build a runner from configuration with the QEMU launcher.
    pub fn from_config(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<dyn PciBus>,
        launcher: Arc<dyn GuestLauncher>,
    ) -> Result<Self> {
        let harness = TestHarness::new(launcher, config.guest.clone());
        let mut this = Self::new(runner, bus, harness, RunOptions::from_config(config)?)
            .with_audit_log(AuditLog::new(config.audit_log_path()));
        if config.confirm {
            this = this.with_policy(Arc::new(PromptOperator));
        }
        Ok(this)
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ConfirmPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Restrict the run to these addresses.
    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.options.devices = devices;
        self
    }

    /// Resolve the hypervisor: configured override, else the kernel log.
    pub async fn resolve_hypervisor(&self) -> Result<HypervisorKind> {
        let kind = match self.options.hypervisor {
            Some(kind) => {
                info!(hypervisor = %kind, "Using configured hypervisor");
                kind
            }
            None => self.detector.detect().await?,
        };

        if !kind.is_known() {
            return Err(ProbeError::HypervisorUndetected);
        }
        Ok(kind)
    }

    /// Run the whole passthrough test.
    ///
    /// Returns an error only for run-level failures; per-device results are
    /// in the report.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RunReport> {
        let hypervisor = self.resolve_hypervisor().await?;
        let controller = BindingController::new(self.bus.clone(), hypervisor)?;
        let target = controller
            .protocol()
            .target_driver(&self.options.passthrough_driver, &self.options.xen_backend_driver)
            .to_string();
        let restorer = RestoreManager::new(controller.clone(), target.clone());

        let devices = select_candidates(self.inventory.list_devices().await?, &self.options)?;
        info!(
            hypervisor = %hypervisor,
            target = %target,
            candidates = devices.len(),
            "Starting passthrough tests"
        );

        if controller.protocol() != BindProtocol::Skip && !devices.is_empty() {
            self.ensure_driver_loaded(&target).await;
        }

        let mut report =
            RunReport { hypervisor, reports: Vec::new(), skipped: Vec::new(), stopped_early: false };
        let total = devices.len();

        for (index, device) in devices.into_iter().enumerate() {
            if device.class == DeviceClass::Display
                && !self.options.allow_boot_vga
                && self.bus.is_boot_vga(&device.address)
            {
                warn!(
                    address = %device.address,
                    "Skipping boot VGA device (driving the console); allow_boot_vga overrides"
                );
                metrics::record_skip("boot_vga");
                report.skipped.push(SkippedDevice { address: device.address, reason: SkipReason::BootVga });
                continue;
            }

            match self.policy.before_device(&device, index, total).await {
                Decision::Continue => {}
                Decision::Skip => {
                    info!(address = %device.address, "Skipped by operator");
                    metrics::record_skip("operator");
                    report.skipped.push(SkippedDevice { address: device.address, reason: SkipReason::Operator });
                    continue;
                }
                Decision::Stop => {
                    info!("Run stopped by operator");
                    report.stopped_early = true;
                    break;
                }
            }

            let device_report = self.cycle(&controller, &restorer, device, &target).await;
            report.reports.push(device_report);
        }

        info!(
            tested = report.reports.len(),
            succeeded = report.successes(),
            skipped = report.skipped.len(),
            "Passthrough tests finished"
        );
        Ok(report)
    }

    /// One device: unbind, bind, test, then restore no matter what.
    #[instrument(skip_all, fields(address = %device.address, class = %device.class))]
    async fn cycle(
        &self,
        controller: &BindingController,
        restorer: &RestoreManager,
        mut device: PciDevice,
        target: &str,
    ) -> DeviceReport {
        let mut failure = None;

        let attempt = match controller.unbind(&mut device) {
            Err(e) => {
                let attempt = PassthroughAttempt::failed(&device.address, AttemptOutcome::UnbindFailed, &e);
                failure = Some(e);
                attempt
            }
            Ok(()) => match controller.bind(&mut device, target) {
                Err(e) => {
                    let attempt = PassthroughAttempt::failed(&device.address, AttemptOutcome::BindFailed, &e);
                    failure = Some(e);
                    attempt
                }
                Ok(()) => self.harness.test_device(&device).await,
            },
        };

        if let Some(e) = &failure {
            error!(error = %e, "Device cycle aborted, restoring");
        }

        let restore = match restorer.restore(&mut device) {
            Ok(RestoreOutcome::AlreadyRestored) => RestoreStatus::AlreadyRestored,
            Ok(RestoreOutcome::Restored) => RestoreStatus::Restored,
            Err(e) if failure.is_some() => {
                let escalated = ProbeError::ManualRecoveryRequired {
                    address: device.address.clone(),
                    reason: e.to_string(),
                };
                error!(
                    error = %escalated,
                    current_driver = %device.current_driver_name(),
                    original_driver = %device.original_driver_name(),
                    "Device left unbound - manual recovery required"
                );
                metrics::record_restore_failure(true);
                RestoreStatus::ManualRecoveryRequired { reason: e.to_string() }
            }
            Err(e) => {
                error!(
                    error = %e,
                    current_driver = %device.current_driver_name(),
                    original_driver = %device.original_driver_name(),
                    "Failed to restore original driver"
                );
                metrics::record_restore_failure(false);
                RestoreStatus::Failed { reason: e.to_string() }
            }
        };

        metrics::record_attempt(attempt.outcome.as_str());
        info!(
            outcome = %attempt.outcome,
            restore = ?restore,
            driver = %device.current_driver_name(),
            "Device cycle complete"
        );

        if attempt.outcome.is_success() {
            if let Some(audit) = &self.audit {
                let record = AuditRecord::new(&device, controller.hypervisor(), &attempt);
                if let Err(e) = audit.append(&record) {
                    error!(error = %e, "Failed to write audit record");
                }
            }
        }

        DeviceReport { device, attempt, failure, restore }
    }

    /// Load the passthrough driver module if the bus does not know it yet.
    async fn ensure_driver_loaded(&self, driver: &str) {
        if self.bus.driver_available(driver) {
            return;
        }

        match self.runner.run("modprobe", &[driver]).await {
            Ok(out) if !out.success => {
                warn!(driver, stderr = %out.stderr.trim(), "modprobe returned non-zero");
            }
            Ok(_) => {}
            Err(e) => warn!(driver, error = %e, "Failed to run modprobe"),
        }

        if !self.bus.driver_available(driver) {
            warn!(driver, "Passthrough driver not available; binds are expected to fail");
        }
    }
}
