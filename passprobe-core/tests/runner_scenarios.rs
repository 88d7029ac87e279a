//! End-to-end runs of the passthrough loop against an in-memory host.

mod common;

use common::{
    MockBus, MockLauncher, MockRunner, DMESG_BARE, DMESG_HYPERV, DMESG_KVM, DMESG_XEN, LSPCI,
};
use async_trait::async_trait;
use passprobe_core::{
    AttemptOutcome, AuditLog, CommandOutput, ConfirmPolicy, Decision, DeviceClass, DeviceOrder,
    GuestConfig, HypervisorKind, PassthroughRunner, PciDevice, ProbeError, RestoreStatus,
    RunOptions, SkipReason, TestHarness,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const GPU: &str = "0000:01:00.0";
const USB: &str = "0000:00:14.0";
const AUDIO: &str = "0000:00:1f.3";

struct Host {
    bus: Arc<MockBus>,
    runner: Arc<MockRunner>,
    launcher: Arc<MockLauncher>,
    dir: TempDir,
}

impl Host {
    fn new(dmesg: &str, launcher: MockLauncher) -> Self {
        Self {
            bus: Arc::new(MockBus::host()),
            runner: Arc::new(MockRunner::new(LSPCI, dmesg)),
            launcher: Arc::new(launcher),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn audit_path(&self) -> std::path::PathBuf {
        self.dir.path().join("logs/passthrough-audit.log")
    }

    fn audit_text(&self) -> String {
        std::fs::read_to_string(self.audit_path()).unwrap_or_default()
    }

    fn runner(&self, options: RunOptions) -> PassthroughRunner {
        let harness = TestHarness::new(self.launcher.clone(), GuestConfig::default());
        PassthroughRunner::new(self.runner.clone(), self.bus.clone(), harness, options)
            .with_audit_log(AuditLog::new(self.audit_path()))
    }
}

fn only(addresses: &[&str]) -> RunOptions {
    RunOptions { devices: addresses.iter().map(|a| a.to_string()).collect(), ..Default::default() }
}

#[tokio::test]
async fn test_kvm_gpu_success_writes_one_audit_record() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    let report = host.runner(only(&[GPU])).run().await.unwrap();

    assert_eq!(report.hypervisor, HypervisorKind::Kvm);
    assert_eq!(report.reports.len(), 1);

    let gpu = &report.reports[0];
    assert_eq!(gpu.attempt.outcome, AttemptOutcome::Success);
    assert_eq!(gpu.restore, RestoreStatus::Restored);
    assert!(gpu.failure.is_none());
    assert_eq!(host.bus.driver_of(GPU).as_deref(), Some("nouveau"));

    let audit = host.audit_text();
    assert_eq!(audit.matches("Address: ").count(), 1);
    assert!(audit.contains("Address: 0000:01:00.0\n"));
    assert!(audit.contains("Original Driver: nouveau\n"));
    assert!(audit.contains("Hypervisor: KVM\n"));
    assert!(audit.contains("-device vfio-pci,host=0000:01:00.0"));
}

#[tokio::test]
async fn test_all_candidates_tested_in_bus_order() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    let report = host.runner(RunOptions::default()).run().await.unwrap();

    assert_eq!(host.launcher.launched(), vec![USB, AUDIO, GPU]);
    assert_eq!(report.successes(), 3);
    assert_eq!(host.bus.driver_of(USB).as_deref(), Some("xhci_hcd"));
    assert_eq!(host.bus.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
    assert_eq!(host.bus.driver_of(GPU).as_deref(), Some("nouveau"));
    // host bridge is class "other"
    assert!(host.bus.writes_for("0000:00:00.0").is_empty());
}

#[tokio::test]
async fn test_display_first_order() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    let options = RunOptions { order: DeviceOrder::DisplayFirst, ..Default::default() };
    host.runner(options).run().await.unwrap();

    assert_eq!(host.launcher.launched(), vec![GPU, USB, AUDIO]);
}

#[tokio::test]
async fn test_class_filter() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    let options = RunOptions { device_classes: vec![DeviceClass::Audio], ..Default::default() };
    let report = host.runner(options).run().await.unwrap();

    assert_eq!(host.launcher.launched(), vec![AUDIO]);
    assert_eq!(report.reports.len(), 1);
}

#[tokio::test]
async fn test_launch_stderr_is_failure_and_still_restored() {
    let launcher = MockLauncher::default()
        .failing_for(GPU, "qemu-system-x86_64: vfio 0000:01:00.0: group 1 is not viable");
    let host = Host::new(DMESG_KVM, launcher);
    let report = host.runner(only(&[GPU])).run().await.unwrap();

    let gpu = &report.reports[0];
    assert_eq!(gpu.attempt.outcome, AttemptOutcome::HypervisorLaunchFailed);
    assert!(gpu.attempt.diagnostic.contains("not viable"));
    assert_eq!(gpu.restore, RestoreStatus::Restored);
    assert_eq!(host.bus.driver_of(GPU).as_deref(), Some("nouveau"));
    assert!(host.audit_text().is_empty());
}

#[tokio::test]
async fn test_blank_stderr_is_still_a_launch_failure() {
    let host = Host::new(DMESG_KVM, MockLauncher::default().failing_for(GPU, "\n  \n"));
    let report = host.runner(only(&[GPU])).run().await.unwrap();

    let gpu = &report.reports[0];
    assert_eq!(gpu.attempt.outcome, AttemptOutcome::HypervisorLaunchFailed);
    assert!(!gpu.attempt.diagnostic.is_empty());
    assert_eq!(gpu.restore, RestoreStatus::Restored);
    assert!(host.audit_text().is_empty());
}

#[tokio::test]
async fn test_bind_failure_continues_with_next_device() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    host.bus.reject("drivers/vfio-pci/new_id");

    let report = host.runner(only(&[GPU, USB])).run().await.unwrap();
    assert_eq!(report.reports.len(), 2);

    for r in &report.reports {
        assert_eq!(r.attempt.outcome, AttemptOutcome::BindFailed);
        assert!(matches!(r.failure, Some(ProbeError::Bind { .. })));
        assert_eq!(r.restore, RestoreStatus::Restored);
    }

    assert_eq!(host.bus.driver_of(GPU).as_deref(), Some("nouveau"));
    assert_eq!(host.bus.driver_of(USB).as_deref(), Some("xhci_hcd"));
    assert!(!host.bus.wrote("drivers/vfio-pci/unbind"));
    assert!(host.launcher.launched().is_empty());
    assert!(host.audit_text().is_empty());
}

#[tokio::test]
async fn test_failed_restore_after_bind_failure_needs_manual_recovery() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    host.bus.reject("drivers/vfio-pci/bind");
    host.bus.reject("drivers/nouveau/bind");

    let report = host.runner(only(&[GPU, USB])).run().await.unwrap();

    // GPU comes last in bus order
    let usb = &report.reports[0];
    let gpu = &report.reports[1];
    assert_eq!(gpu.device.address, GPU);
    assert_eq!(gpu.attempt.outcome, AttemptOutcome::BindFailed);
    assert!(matches!(gpu.restore, RestoreStatus::ManualRecoveryRequired { .. }));
    assert_eq!(host.bus.driver_of(GPU), None);
    assert_eq!(report.unrestored().count(), 1);

    assert_eq!(usb.attempt.outcome, AttemptOutcome::BindFailed);
    assert_eq!(usb.restore, RestoreStatus::Restored);
    assert_eq!(host.bus.driver_of(USB).as_deref(), Some("xhci_hcd"));
}

#[tokio::test]
async fn test_failed_restore_after_success_is_reported() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    host.bus.reject("drivers/nouveau/bind");

    let report = host.runner(only(&[GPU])).run().await.unwrap();
    let gpu = &report.reports[0];

    assert_eq!(gpu.attempt.outcome, AttemptOutcome::Success);
    assert!(matches!(gpu.restore, RestoreStatus::Failed { .. }));
}

#[tokio::test]
async fn test_driver_changed_before_unbind() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    let runner = host.runner(only(&[GPU]));

    struct SwapDriver(Arc<MockBus>);

    #[async_trait]
    impl ConfirmPolicy for SwapDriver {
        async fn before_device(&self, device: &PciDevice, _: usize, _: usize) -> Decision {
            self.0.set_driver(&device.address, Some("nvidia"));
            Decision::Continue
        }
    }

    let report = runner.with_policy(Arc::new(SwapDriver(host.bus.clone()))).run().await.unwrap();
    let gpu = &report.reports[0];

    assert_eq!(gpu.attempt.outcome, AttemptOutcome::UnbindFailed);
    assert!(matches!(gpu.failure, Some(ProbeError::Bind { .. })));
    assert!(!host.bus.wrote("drivers/vfio-pci/new_id"));
    assert!(!host.bus.wrote("drivers/vfio-pci/bind"));
    assert!(host.launcher.launched().is_empty());
}

#[tokio::test]
async fn test_no_hypervisor_is_fatal_before_any_write() {
    let host = Host::new(DMESG_BARE, MockLauncher::default());
    let err = host.runner(RunOptions::default()).run().await.unwrap_err();

    assert!(matches!(err, ProbeError::HypervisorUndetected));
    assert!(host.bus.writes().is_empty());
    assert!(host.launcher.launched().is_empty());
    assert!(!host.runner.calls().iter().any(|c| c.starts_with("lspci")));
}

#[tokio::test]
async fn test_hypervisor_override_skips_detection() {
    let host = Host::new(DMESG_BARE, MockLauncher::default());
    let options = RunOptions { hypervisor: Some(HypervisorKind::VMware), ..only(&[GPU]) };
    let report = host.runner(options).run().await.unwrap();

    assert_eq!(report.hypervisor, HypervisorKind::VMware);
    assert!(!host.runner.calls().iter().any(|c| c.starts_with("dmesg")));
    assert!(!host.bus.wrote("drivers/vfio-pci/new_id"));
    assert_eq!(report.successes(), 1);
}

#[tokio::test]
async fn test_missing_inventory_is_fatal() {
    let host = Host {
        runner: Arc::new(MockRunner::new("", DMESG_KVM).without("lspci")),
        ..Host::new(DMESG_KVM, MockLauncher::default())
    };
    let err = host.runner(RunOptions::default()).run().await.unwrap_err();
    assert!(matches!(err, ProbeError::InventoryUnavailable { .. }));
    assert!(host.bus.writes().is_empty());
}

#[tokio::test]
async fn test_xen_run_binds_pciback() {
    let host = Host::new(DMESG_XEN, MockLauncher::default());
    let report = host.runner(only(&[USB])).run().await.unwrap();

    assert_eq!(report.hypervisor, HypervisorKind::Xen);
    assert!(host.bus.wrote("drivers/pciback/new_slot"));
    assert_eq!(host.bus.driver_of(USB).as_deref(), Some("xhci_hcd"));
}

#[tokio::test]
async fn test_hyperv_launches_without_binding() {
    let host = Host::new(DMESG_HYPERV, MockLauncher::default());
    let report = host.runner(only(&[GPU])).run().await.unwrap();

    assert_eq!(report.hypervisor, HypervisorKind::HyperV);
    assert_eq!(report.reports[0].attempt.outcome, AttemptOutcome::Success);
    assert_eq!(report.reports[0].restore, RestoreStatus::AlreadyRestored);
    assert!(host.bus.writes().is_empty());
    assert_eq!(host.launcher.launched(), vec![GPU]);
}

#[tokio::test]
async fn test_boot_vga_skipped_unless_allowed() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    host.bus.mark_boot_vga(GPU);

    let report = host.runner(only(&[GPU])).run().await.unwrap();
    assert!(report.reports.is_empty());
    assert_eq!(report.skipped[0].reason, SkipReason::BootVga);
    assert!(host.bus.writes().is_empty());

    let options = RunOptions { allow_boot_vga: true, ..only(&[GPU]) };
    let report = host.runner(options).run().await.unwrap();
    assert_eq!(report.successes(), 1);
}

#[tokio::test]
async fn test_missing_passthrough_driver_triggers_modprobe() {
    let host = Host::new(DMESG_KVM, MockLauncher::default());
    host.bus.unload_driver("vfio-pci");

    let report = host.runner(only(&[GPU])).run().await.unwrap();

    assert!(host.runner.calls().contains(&"modprobe vfio-pci".to_string()));
    assert_eq!(report.reports[0].attempt.outcome, AttemptOutcome::BindFailed);
    assert_eq!(host.bus.driver_of(GPU).as_deref(), Some("nouveau"));
}

#[tokio::test]
async fn test_operator_skip_and_stop() {
    struct Script(Mutex<Vec<Decision>>);

    #[async_trait]
    impl ConfirmPolicy for Script {
        async fn before_device(&self, _: &PciDevice, _: usize, _: usize) -> Decision {
            self.0.lock().unwrap().remove(0)
        }
    }

    let host = Host::new(DMESG_KVM, MockLauncher::default());
    let policy = Script(Mutex::new(vec![Decision::Skip, Decision::Continue, Decision::Stop]));
    let report = host.runner(RunOptions::default()).with_policy(Arc::new(policy)).run().await.unwrap();

    assert_eq!(host.launcher.launched(), vec![AUDIO]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].address, USB);
    assert_eq!(report.skipped[0].reason, SkipReason::Operator);
    assert!(report.stopped_early);
    assert!(host.bus.writes_for(GPU).is_empty());
}

#[tokio::test]
async fn test_failed_dmesg_is_undetected() {
    let host = Host {
        runner: Arc::new(MockRunner::new(LSPCI, "").with_output(
            "dmesg",
            CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: "dmesg: read kernel buffer failed: Operation not permitted".to_string(),
            },
        )),
        ..Host::new(DMESG_KVM, MockLauncher::default())
    };
    let err = host.runner(RunOptions::default()).run().await.unwrap_err();
    assert!(matches!(err, ProbeError::HypervisorUndetected));
}
