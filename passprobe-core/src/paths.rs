//! Centralized path configuration for passprobe.
//!
//! Host control paths (sysfs) live with the bus abstraction in `host::sysfs`;
//! this module only resolves where passprobe keeps its own files.

use std::path::PathBuf;

/// Default root of the PCI bus in sysfs.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/pci";

/// Get the passprobe data directory.
///
/// Resolution order:
/// 1. `PASSPROBE_DATA_DIR` environment variable
/// 2. `/var/lib/passprobe` if it exists (system install)
/// 3. `~/.passprobe` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PASSPROBE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/passprobe");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".passprobe")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `PASSPROBE_CONFIG_DIR` wins, then `$XDG_CONFIG_HOME/passprobe`, then the data dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PASSPROBE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("passprobe")).unwrap_or_else(data_dir)
}

/// Get the logs directory.
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Get the default audit log path.
pub fn audit_log_path() -> PathBuf {
    logs_dir().join("passthrough-audit.log")
}
