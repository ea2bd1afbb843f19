use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a digital input line (GPIO number on Linux).
pub type LineId = u32;

/// Identifier of an addressable slot on the remote broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualPin(pub u32);

impl std::fmt::Display for VirtualPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Logical level transition observed on an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// low → high
    Rising,
    /// high → low
    Falling,
}

/// A single edge notification delivered by a line driver.
///
/// The timestamp is implicit: it is "now" at the moment the dispatcher
/// handles the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEvent {
    pub line: LineId,
    pub kind: EdgeKind,
}

impl EdgeEvent {
    pub fn rising(line: LineId) -> Self {
        Self {
            line,
            kind: EdgeKind::Rising,
        }
    }

    pub fn falling(line: LineId) -> Self {
        Self {
            line,
            kind: EdgeKind::Falling,
        }
    }
}

/// Rate derived from the interval between two rising edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub value: f64,
}

/// Value written to a virtual pin. Opaque to the edge-handling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A computed rate (power meter).
    Rate(f64),
    /// A formatted text line (device relay).
    Text(String),
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Rate(v) => write!(f, "{v}"),
            Payload::Text(s) => f.write_str(s),
        }
    }
}

/// Non-blocking handoff for computed samples.
///
/// Implementations must not suspend: `submit` is called from the edge
/// callback context while the per-line sequencing lock is held.
pub trait SampleSink: Send + Sync {
    fn submit(&self, sample: RateSample) -> Result<(), BridgeError>;
}

/// Misuse of a start/stop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateViolation {
    DoubleStart,
    StopBeforeStart,
}

impl std::fmt::Display for StateViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateViolation::DoubleStart => write!(f, "already started"),
            StateViolation::StopBeforeStart => write!(f, "stop called before start"),
        }
    }
}

/// Error type shared by every pulsebridge crate.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Authorization Failure: {0}")]
    Unauthorized(String),

    #[error("Resource Unavailable on line {line}: {details}")]
    ResourceUnavailable { line: LineId, details: String },

    #[error("Publish Failure on {pin}: {details}")]
    Publish { pin: VirtualPin, details: String },

    #[error("Invalid State: {0}")]
    InvalidState(StateViolation),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),
}
