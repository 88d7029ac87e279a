//! PCI passthrough binding, testing and rollback.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Passthrough device cycle                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BindingController                                          │
//! │  ├── unbind()  - Bound(original) -> Unbound                 │
//! │  └── bind()    - Unbound -> Bound(target), per hypervisor   │
//! │                                                             │
//! │  TestHarness                                                │
//! │  └── test_device() - one guest, one device, bounded runtime │
//! │                                                             │
//! │  RestoreManager                                             │
//! │  └── restore() - back to the original driver, idempotent    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Safety
//!
//! - **Read before write**: every transition re-reads the bound driver from
//!   the bus. Driver state is never cached across calls.
//!
//! - **Restore always**: the runner restores every device it touched, whether
//!   the test passed or not. A restore failure after a failed bind leaves the
//!   device without a driver and is reported as needing manual recovery.
//!
//! - **Boot VGA protection**: the GPU driving the console is skipped unless
//!   explicitly allowed.

mod controller;
mod harness;
mod launcher;
mod restore;

pub use controller::{BindProtocol, BindingController};
pub use harness::{AttemptOutcome, PassthroughAttempt, TestHarness};
pub use launcher::{
    GuestConfig, GuestLauncher, LaunchOutput, QemuLauncher, DEFAULT_LAUNCH_TIMEOUT_SECS,
};
pub use restore::{RestoreManager, RestoreOutcome};
