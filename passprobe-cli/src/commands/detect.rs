//! `passprobe detect` command

use anyhow::Result;
use colored::Colorize;
use passprobe_core::{BindProtocol, HypervisorDetector, HypervisorKind, SystemCommandRunner};
use std::sync::Arc;

/// Report the detected hypervisor and how devices would be bound
pub async fn detect() -> Result<()> {
    let kind = HypervisorDetector::new(Arc::new(SystemCommandRunner)).detect().await?;
    report(kind)
}

/// Fails when no bind protocol exists, so the exit status reflects it.
fn report(kind: HypervisorKind) -> Result<()> {
    match BindProtocol::for_hypervisor(kind) {
        Ok(protocol) => {
            println!("{} Hypervisor: {}", "✓".green().bold(), kind.to_string().bold());
            println!("  Bind protocol: {:?}", protocol);
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red().bold(), e);
            println!("  Use --hypervisor to select one explicitly");
            Err(e.into())
        }
    }
}
