use anyhow::Result;
use clap::{Parser, Subcommand};
use passprobe_core::Config;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "passprobe")]
#[command(about = "Test PCI passthrough of host devices, one at a time", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root of the PCI bus in sysfs
    #[arg(long, global = true)]
    sysfs_root: Option<String>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test every candidate device: unbind, bind, launch a guest, restore
    Run {
        /// Guest memory (e.g. "4G")
        #[arg(short, long)]
        memory: Option<String>,

        /// Guest runtime limit in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Skip detection and assume this hypervisor (kvm, xen, vmware, hyperv)
        #[arg(long)]
        hypervisor: Option<String>,

        /// Passthrough driver
        #[arg(long)]
        driver: Option<String>,

        /// Device order: enumeration or display-first
        #[arg(long)]
        order: Option<String>,

        /// Ask before testing each device
        #[arg(long)]
        confirm: bool,

        /// Also test the GPU driving the console
        #[arg(long)]
        allow_boot_vga: bool,

        /// Device classes to test (display, audio, usb, other)
        #[arg(long)]
        class: Vec<String>,

        /// Test only these PCI addresses
        #[arg(short, long)]
        device: Vec<String>,

        /// Audit log file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Boot image attached to the guest as a CD-ROM
        #[arg(long)]
        boot_image: Option<PathBuf>,
    },

    /// List PCI devices and their drivers
    List {
        /// Include devices that are not passthrough candidates
        #[arg(short, long)]
        all: bool,
    },

    /// Detect the hypervisor from the kernel log
    Detect,

    /// Rebind a device to a native driver
    Restore {
        /// PCI address (e.g. 0000:01:00.0)
        address: String,

        /// Driver to bind to (e.g. nouveau)
        driver: String,

        /// Skip detection and assume this hypervisor
        #[arg(long)]
        hypervisor: Option<String>,
    },

    /// Show the driver state of one device
    Status {
        /// PCI address
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(root) = cli.sysfs_root {
        config.sysfs_root = root;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    passprobe_core::init_observability(&config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    tracing::debug!(sysfs_root = %config.sysfs_root, "Configuration loaded");

    match cli.command {
        Commands::Run {
            memory,
            timeout,
            hypervisor,
            driver,
            order,
            confirm,
            allow_boot_vga,
            class,
            device,
            audit_log,
            boot_image,
        } => {
            if let Some(memory) = memory {
                config.guest.memory = memory;
            }
            if let Some(timeout) = timeout {
                config.guest.timeout_secs = timeout;
            }
            if hypervisor.is_some() {
                config.hypervisor = hypervisor;
            }
            if let Some(driver) = driver {
                config.passthrough_driver = driver;
            }
            if let Some(order) = order {
                config.order = passprobe_core::DeviceOrder::parse(&order)
                    .ok_or_else(|| anyhow::anyhow!("Invalid order: {}", order))?;
            }
            if !class.is_empty() {
                config.device_classes = class
                    .iter()
                    .map(|c| {
                        passprobe_core::DeviceClass::parse(c)
                            .ok_or_else(|| anyhow::anyhow!("Invalid device class: {}", c))
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
            if audit_log.is_some() {
                config.audit_log = audit_log;
            }
            if boot_image.is_some() {
                config.guest.boot_image = boot_image;
            }
            config.confirm |= confirm;
            config.allow_boot_vga |= allow_boot_vga;
            config.validate()?;

            commands::run(&config, device).await?;
        }

        Commands::List { all } => {
            commands::list(&config, all).await?;
        }

        Commands::Detect => {
            commands::detect().await?;
        }

        Commands::Restore { address, driver, hypervisor } => {
            if hypervisor.is_some() {
                config.hypervisor = hypervisor;
            }
            commands::restore(&config, &address, &driver).await?;
        }

        Commands::Status { address } => {
            commands::status(&config, &address).await?;
        }
    }

    Ok(())
}
