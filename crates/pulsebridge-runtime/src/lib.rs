//! `pulsebridge-runtime` – Orchestration of the bridges.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`EdgeDispatcher`][dispatcher::EdgeDispatcher]: routes
//!   edge callbacks on one input line through the
//!   [`EdgeTimer`][pulsebridge_kernel::EdgeTimer] and
//!   [`RateCalculator`][pulsebridge_kernel::RateCalculator] into a
//!   [`SampleSink`][pulsebridge_types::SampleSink].
//! - [`lifecycle`] – [`LifecycleController`][lifecycle::LifecycleController]:
//!   the power bridge's authorise → arm → wait → tear-down sequence.
//! - [`relay`] – [`RelayController`][relay::RelayController]: forwards
//!   device-hub websocket events to a virtual pin.
//! - [`shutdown`] – [`ShutdownSignal`][shutdown::ShutdownSignal] and its
//!   cloneable trigger.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP span export.

pub mod dispatcher;
pub mod lifecycle;
pub mod relay;
pub mod shutdown;
pub mod telemetry;

pub use dispatcher::{DispatcherStats, EdgeDispatcher};
pub use lifecycle::{LifecycleController, PowerReport, RunOutcome};
pub use relay::{RelayController, RelayReport};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use telemetry::{TracerProviderGuard, init_tracing};
