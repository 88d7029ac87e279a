//! CLI command implementations

pub mod detect;
pub mod list;
pub mod restore;
pub mod run;
pub mod status;

pub use detect::detect;
pub use list::list;
pub use restore::restore;
pub use run::run;
pub use status::status;

use passprobe_core::{Config, SysfsBus, SystemCommandRunner};
use std::sync::Arc;

/// Host seams as configured.
fn host(config: &Config) -> (Arc<SystemCommandRunner>, Arc<SysfsBus>) {
    (Arc::new(SystemCommandRunner), Arc::new(SysfsBus::new(&config.sysfs_root)))
}
