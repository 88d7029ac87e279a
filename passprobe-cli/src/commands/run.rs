//! `passprobe run` command

use anyhow::Result;
use colored::Colorize;
use passprobe_core::{
    preflight, AttemptOutcome, Config, DeviceReport, PassthroughRunner, QemuLauncher,
    RestoreStatus, RunReport,
};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "CLASS")]
    class: String,
    #[tabled(rename = "DEVICE")]
    device: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
    #[tabled(rename = "RESULT")]
    outcome: String,
    #[tabled(rename = "RESTORE")]
    restore: String,
}

/// Test every candidate device
pub async fn run(config: &Config, devices: Vec<String>) -> Result<()> {
    let mut required = vec!["lspci".to_string(), config.guest.binary.clone()];
    if config.hypervisor.is_none() {
        required.push("dmesg".to_string());
    }
    preflight::require_commands(&required)?;

    let (runner, bus) = super::host(config);
    let launcher = Arc::new(QemuLauncher::new());
    let mut probe = PassthroughRunner::from_config(config, runner, bus, launcher)?;
    if !devices.is_empty() {
        probe = probe.with_devices(devices);
    }

    println!("Testing passthrough (audit log: {})\n", config.audit_log_path().display());

    let report = match probe.run().await {
        Ok(report) => report,
        Err(e) => {
            if e.is_fatal() {
                println!("{} Run aborted before any device was touched", "✗".red().bold());
            }
            return Err(e.into());
        }
    };
    print_report(&report);

    let unrestored: Vec<&DeviceReport> = report.unrestored().collect();
    if !unrestored.is_empty() {
        println!();
        for r in &unrestored {
            println!(
                "{} {} is on {} instead of {}; rebind with: passprobe restore {} {}",
                "✗".red().bold(),
                r.device.address.bold(),
                r.device.current_driver_name(),
                r.device.original_driver_name(),
                r.device.address,
                r.device.original_driver_name()
            );
        }
        anyhow::bail!("{} device(s) were not restored to their original driver", unrestored.len());
    }

    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Hypervisor: {}", report.hypervisor.to_string().cyan());

    if report.reports.is_empty() {
        println!("No devices tested");
    } else {
        let rows: Vec<ResultRow> = report
            .reports
            .iter()
            .map(|r| ResultRow {
                address: r.device.address.clone(),
                class: r.device.class.to_string(),
                device: r.device.name.clone(),
                driver: r.device.original_driver_name().to_string(),
                outcome: format_outcome(r.attempt.outcome),
                restore: format_restore(&r.restore),
            })
            .collect();

        let mut table = Table::new(rows);
        table.with(Style::modern());
        println!("{}", table);
    }

    for skipped in &report.skipped {
        println!("  skipped {} ({:?})", skipped.address, skipped.reason);
    }
    if report.stopped_early {
        println!("{}", "Run stopped before all devices were tested".yellow());
    }

    println!(
        "\n{} of {} device(s) passed",
        report.successes().to_string().bold(),
        report.reports.len()
    );
}

fn format_outcome(outcome: AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Success => format!("{} {}", "✓".green().bold(), outcome),
        _ => format!("{} {}", "✗".red().bold(), outcome),
    }
}

fn format_restore(status: &RestoreStatus) -> String {
    match status {
        RestoreStatus::AlreadyRestored => "unchanged".to_string(),
        RestoreStatus::Restored => "restored".green().to_string(),
        RestoreStatus::Failed { .. } => "failed".red().to_string(),
        RestoreStatus::ManualRecoveryRequired { .. } => "manual recovery".red().bold().to_string(),
    }
}
