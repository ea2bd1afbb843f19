//! `pulsebridge-hal` – Hardware Abstraction Layer for edge-reporting inputs.
//!
//! # Modules
//!
//! - [`line`] – the [`LineDriver`] contract every input driver implements,
//!   plus the opaque [`LineHandle`] and [`SubscriptionHandle`] types.
//! - [`sim`] – [`SimLineDriver`], a scripted in-memory driver for headless
//!   tests and CI.
//! - [`sysfs`] – [`SysfsLineDriver`], an edge-interrupt driver over the Linux
//!   `/sys/class/gpio` interface.

pub mod line;
pub mod sim;
pub mod sysfs;

pub use line::{EdgeHandler, LineDriver, LineHandle, LineMode, SubscriptionHandle};
pub use sim::{SimCalls, SimLineDriver};
pub use sysfs::{DEFAULT_GPIO_ROOT, DEFAULT_POLL_INTERVAL, SysfsLineDriver};
