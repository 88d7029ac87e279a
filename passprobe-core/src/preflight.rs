//! Required host command checks.
//!
//! Installing missing tools is left to the operator; this only fails fast
//! with a clear message when something is still absent.

use crate::error::{ProbeError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Find `command` in `PATH`, or accept it as-is when it is a path.
pub fn find_command(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(command)).find(|p| p.is_file())
}

/// Package that usually provides `command`.
fn install_hint(command: &str) -> String {
    let package = match command {
        "lspci" => "pciutils",
        "dmesg" => "util-linux",
        c if c.starts_with("qemu-system") => "qemu (qemu-system-x86 on Debian/Ubuntu)",
        c => c,
    };
    format!("Install the '{}' package with your distribution's package manager", package)
}

/// Ensure every command is available before any device is touched.
pub fn require_commands<S: AsRef<str>>(commands: &[S]) -> Result<()> {
    for command in commands {
        let command = command.as_ref();
        match find_command(command) {
            Some(path) => debug!(command, path = %path.display(), "Found required command"),
            None => {
                return Err(ProbeError::CommandNotFound {
                    command: command.to_string(),
                    hint: install_hint(command),
                });
            }
        }
    }
    Ok(())
}
