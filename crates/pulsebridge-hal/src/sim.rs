//! In-process line simulator for CI/CD testing without physical hardware.
//!
//! [`SimLineDriver`] implements [`LineDriver`] entirely in memory. Tests push
//! synthetic edges with [`SimLineDriver::emit`] and inspect how many times the
//! bridge opened, closed, and cancelled things.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pulsebridge_hal::{LineDriver, LineMode, SimLineDriver};
//! use pulsebridge_types::{EdgeEvent, EdgeKind};
//!
//! let driver = SimLineDriver::new().with_line(18);
//! let handle = driver.open_line(18, LineMode::Input).expect("sim open must succeed");
//! driver
//!     .on_edge(&handle, EdgeKind::Rising, Arc::new(|_: EdgeEvent| {}))
//!     .expect("sim subscribe must succeed");
//! assert_eq!(driver.emit(18, EdgeKind::Rising), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pulsebridge_types::{BridgeError, EdgeEvent, EdgeKind, LineId};

use crate::line::{EdgeHandler, LineDriver, LineHandle, LineMode, SubscriptionHandle};

struct SimSubscription {
    line: LineId,
    kind: EdgeKind,
    handler: EdgeHandler,
}

#[derive(Default)]
struct SimState {
    available: HashSet<LineId>,
    open: HashMap<LineId, LineMode>,
    subscriptions: HashMap<u64, SimSubscription>,
    // Every handler ever registered, cancelled or not.
    history: Vec<(LineId, EdgeKind, EdgeHandler)>,
    fail_open: Option<String>,
}

/// Counters describing how a [`SimLineDriver`] has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCalls {
    pub open_line: u64,
    pub on_edge: u64,
    pub cancel: u64,
    pub close_line: u64,
}

/// A simulated edge-reporting driver. Always succeeds unless told otherwise.
#[derive(Default)]
pub struct SimLineDriver {
    state: Mutex<SimState>,
    calls: Mutex<SimCalls>,
    next_subscription: AtomicU64,
}

impl SimLineDriver {
    /// Create a driver with no lines available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `line` available for `open_line` (builder-style).
    pub fn with_line(self, line: LineId) -> Self {
        self.state.lock().available.insert(line);
        self
    }

    /// Make every `open_line` call fail with `reason`.
    pub fn failing_open(self, reason: impl Into<String>) -> Self {
        self.state.lock().fail_open = Some(reason.into());
        self
    }

    /// Deliver a synthetic edge to every live handler registered for
    /// `(line, kind)` on the caller's thread. Returns the number of handlers
    /// invoked.
    pub fn emit(&self, line: LineId, kind: EdgeKind) -> usize {
        let handlers: Vec<EdgeHandler> = {
            let state = self.state.lock();
            state
                .subscriptions
                .values()
                .filter(|s| s.line == line && s.kind == kind)
                .map(|s| s.handler.clone())
                .collect()
        };
        let event = EdgeEvent { line, kind };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Return the most recently registered handler for `(line, kind)`, even
    /// if it has since been cancelled. Lets tests replay a callback that a
    /// real driver delivered late.
    pub fn registered_handler(&self, line: LineId, kind: EdgeKind) -> Option<EdgeHandler> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .find(|(l, k, _)| *l == line && *k == kind)
            .map(|(_, _, h)| h.clone())
    }

    /// Number of live (not cancelled) subscriptions.
    pub fn live_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Whether `line` is currently open.
    pub fn is_open(&self, line: LineId) -> bool {
        self.state.lock().open.contains_key(&line)
    }

    /// Mode `line` was opened with, if open.
    pub fn mode(&self, line: LineId) -> Option<LineMode> {
        self.state.lock().open.get(&line).copied()
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> SimCalls {
        *self.calls.lock()
    }
}

impl LineDriver for SimLineDriver {
    fn open_line(&self, line: LineId, mode: LineMode) -> Result<LineHandle, BridgeError> {
        self.calls.lock().open_line += 1;
        let mut state = self.state.lock();
        if let Some(reason) = &state.fail_open {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: reason.clone(),
            });
        }
        if !state.available.contains(&line) {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: format!("line {line} does not exist"),
            });
        }
        if state.open.contains_key(&line) {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: "line is already claimed".to_string(),
            });
        }
        state.open.insert(line, mode);
        Ok(LineHandle::new(line))
    }

    fn on_edge(
        &self,
        handle: &LineHandle,
        kind: EdgeKind,
        handler: EdgeHandler,
    ) -> Result<SubscriptionHandle, BridgeError> {
        self.calls.lock().on_edge += 1;
        let line = handle.line();
        let mut state = self.state.lock();
        if !state.open.contains_key(&line) {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: "line is not open".to_string(),
            });
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        state.history.push((line, kind, handler.clone()));
        state
            .subscriptions
            .insert(id, SimSubscription { line, kind, handler });
        Ok(SubscriptionHandle::new(id))
    }

    fn cancel(&self, subscription: SubscriptionHandle) -> Result<(), BridgeError> {
        self.calls.lock().cancel += 1;
        self.state.lock().subscriptions.remove(&subscription.id());
        Ok(())
    }

    fn close_line(&self, handle: LineHandle) -> Result<(), BridgeError> {
        self.calls.lock().close_line += 1;
        let line = handle.line();
        let mut state = self.state.lock();
        state.subscriptions.retain(|_, s| s.line != line);
        state.open.remove(&line);
        Ok(())
    }
}
