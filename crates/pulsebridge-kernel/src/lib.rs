//! `pulsebridge-kernel` – Timing primitives of the pulse meter.
//!
//! # Modules
//!
//! - [`clock`] – [`MonotonicClock`][clock::MonotonicClock] with a real
//!   [`SystemClock`][clock::SystemClock] and a scriptable
//!   [`ManualClock`][clock::ManualClock] for tests.
//! - [`edge_timer`] – [`EdgeTimer`][edge_timer::EdgeTimer]: the single piece
//!   of shared mutable state, restarted on every accepted rising edge.
//! - [`rate`] – [`RateCalculator`][rate::RateCalculator]: pure
//!   `calibration / elapsed` conversion with the first-edge policy.

pub mod clock;
pub mod edge_timer;
pub mod rate;

pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use edge_timer::{DEFAULT_RESOLUTION, EdgeTimer};
pub use rate::{DEFAULT_CALIBRATION, RateCalculator};
