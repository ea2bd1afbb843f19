//! Generic `LineDriver` trait for digital input lines that report edge
//! transitions (GPIO pins, opto-coupled pulse outputs, …).
//!
//! The rest of the bridge only ever talks to the trait, so a sysfs driver, a
//! character-device driver, or the in-process simulator can be swapped
//! without touching the dispatcher.

use std::sync::Arc;

use pulsebridge_types::{BridgeError, EdgeEvent, EdgeKind, LineId};

/// Callback invoked by a driver for every accepted edge.
///
/// Drivers may call handlers from their own threads; handlers must be cheap
/// and must not block on network I/O.
pub type EdgeHandler = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

/// Electrical mode requested when opening a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Floating input.
    Input,
    /// Input with the internal pull-up resistor enabled.
    InputPullUp,
    /// Input with the internal pull-down resistor enabled.
    InputPullDown,
}

/// Proof that a line is open. Consumed by [`LineDriver::close_line`].
#[derive(Debug, PartialEq, Eq)]
pub struct LineHandle {
    line: LineId,
}

impl LineHandle {
    /// Drivers mint handles; callers only receive them from `open_line`.
    pub fn new(line: LineId) -> Self {
        Self { line }
    }

    pub fn line(&self) -> LineId {
        self.line
    }
}

/// Opaque registration of one handler for one edge kind on one line.
///
/// Ids come from a per-driver counter and are never reused, so cancelling a
/// stale handle cannot remove somebody else's registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Driver contract for an edge-reporting input line.
///
/// Guarantees expected from implementors:
///
/// * a handler fires at most once per physical transition;
/// * `cancel` is safe to call from outside the callback context;
/// * cancelling an unknown or already-cancelled subscription returns `Ok`.
pub trait LineDriver: Send + Sync {
    /// Claim `line` for exclusive use.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ResourceUnavailable`] when the line does not
    /// exist, is already claimed, or cannot be configured as requested.
    fn open_line(&self, line: LineId, mode: LineMode) -> Result<LineHandle, BridgeError>;

    /// Register `handler` for `kind` transitions on an open line.
    fn on_edge(
        &self,
        handle: &LineHandle,
        kind: EdgeKind,
        handler: EdgeHandler,
    ) -> Result<SubscriptionHandle, BridgeError>;

    /// Remove a registration. Idempotent.
    fn cancel(&self, subscription: SubscriptionHandle) -> Result<(), BridgeError>;

    /// Release the line.
    fn close_line(&self, handle: LineHandle) -> Result<(), BridgeError>;
}
