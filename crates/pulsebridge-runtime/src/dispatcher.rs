//! [`EdgeDispatcher`] – turns edge callbacks on one input line into rate
//! samples.
//!
//! ```text
//!   Idle ──start──▶ Armed ──stop──▶ Idle
//! ```
//!
//! While armed, every rising edge reads the time since the previous rising
//! edge, restarts the timer and, when the interval is non-zero, hands
//! `calibration / interval` to the [`SampleSink`]. Falling edges are logged
//! and counted only.
//!
//! # Concurrency
//!
//! Driver callbacks may overlap. Rising-edge handling is serialised by a
//! per-line sequencing lock so samples reach the sink in edge order. Each
//! callback also holds a shared in-flight guard; [`EdgeDispatcher::stop`]
//! disarms the line, cancels the subscriptions and then takes the guard
//! exclusively, which waits for callbacks already running. Callbacks that
//! arrive after that point are counted as late and do nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use pulsebridge_hal::{EdgeHandler, LineDriver, LineHandle, LineMode, SubscriptionHandle};
use pulsebridge_kernel::{EdgeTimer, MonotonicClock, RateCalculator, SystemClock};
use pulsebridge_types::{
    BridgeError, EdgeEvent, EdgeKind, LineId, SampleSink, StateViolation,
};
use tracing::{debug, info, trace, warn};

/// Counters accumulated over the dispatcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub rising: u64,
    pub falling: u64,
    /// Samples handed to the sink, including ones it refused.
    pub samples: u64,
    pub sink_failures: u64,
    /// Callbacks that arrived after the line was disarmed.
    pub late: u64,
}

#[derive(Default)]
struct Counters {
    rising: AtomicU64,
    falling: AtomicU64,
    samples: AtomicU64,
    sink_failures: AtomicU64,
    late: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            rising: self.rising.load(Ordering::Relaxed),
            falling: self.falling.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-activation core
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by the callbacks of one `start`..`stop` activation.
struct EdgeCore {
    line: LineId,
    timer: EdgeTimer,
    rate: RateCalculator,
    sink: Arc<dyn SampleSink>,
    counters: Arc<Counters>,
    armed: AtomicBool,
    in_flight: RwLock<()>,
    sequence: Mutex<()>,
}

impl EdgeCore {
    fn handle(&self, event: EdgeEvent) {
        let _in_flight = self.in_flight.read();
        if !self.armed.load(Ordering::Acquire) {
            self.counters.late.fetch_add(1, Ordering::Relaxed);
            trace!(line = self.line, kind = ?event.kind, "late edge ignored");
            return;
        }
        match event.kind {
            EdgeKind::Rising => self.on_rising(),
            EdgeKind::Falling => {
                self.counters.falling.fetch_add(1, Ordering::Relaxed);
                debug!(line = self.line, "falling edge");
            }
        }
    }

    fn on_rising(&self) {
        let _sequence = self.sequence.lock();
        self.counters.rising.fetch_add(1, Ordering::Relaxed);

        // Read and restart in one step so no time is lost between them.
        let elapsed = self.timer.lap();
        let Some(sample) = self.rate.compute(elapsed) else {
            debug!(line = self.line, "rising edge, no previous interval");
            return;
        };
        debug!(line = self.line, elapsed_s = elapsed, value = sample.value, "rising edge");

        self.counters.samples.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.sink.submit(sample) {
            self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
            warn!(line = self.line, value = sample.value, error = %e, "sample dropped");
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Block until every callback currently inside `handle` has returned.
    fn wait_in_flight(&self) {
        drop(self.in_flight.write());
    }
}

struct Armed {
    driver: Arc<dyn LineDriver>,
    handle: LineHandle,
    rising: SubscriptionHandle,
    falling: SubscriptionHandle,
    core: Arc<EdgeCore>,
}

// ─────────────────────────────────────────────────────────────────────────────
// EdgeDispatcher
// ─────────────────────────────────────────────────────────────────────────────

pub struct EdgeDispatcher {
    sink: Arc<dyn SampleSink>,
    rate: RateCalculator,
    clock: Arc<dyn MonotonicClock>,
    counters: Arc<Counters>,
    state: Mutex<Option<Armed>>,
}

impl EdgeDispatcher {
    pub fn new(sink: Arc<dyn SampleSink>, rate: RateCalculator) -> Self {
        Self {
            sink,
            rate,
            clock: Arc::new(SystemClock::new()),
            counters: Arc::new(Counters::default()),
            state: Mutex::new(None),
        }
    }

    /// Measure intervals with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Claim `line` on `driver` and start producing samples.
    ///
    /// Every activation starts with a fresh timer, so the first rising edge
    /// after `start` never yields a sample.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::InvalidState`] with [`StateViolation::DoubleStart`]
    ///   when already armed.
    /// * Whatever the driver returns from `open_line` or `on_edge`. Partial
    ///   registrations are rolled back and the line is closed.
    pub fn start(&self, driver: Arc<dyn LineDriver>, line: LineId) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(BridgeError::InvalidState(StateViolation::DoubleStart));
        }

        let handle = driver.open_line(line, LineMode::Input)?;
        let core = Arc::new(EdgeCore {
            line,
            timer: EdgeTimer::with_clock(Arc::clone(&self.clock)),
            rate: self.rate,
            sink: Arc::clone(&self.sink),
            counters: Arc::clone(&self.counters),
            armed: AtomicBool::new(true),
            in_flight: RwLock::new(()),
            sequence: Mutex::new(()),
        });

        let rising = match driver.on_edge(&handle, EdgeKind::Rising, edge_handler(&core)) {
            Ok(subscription) => subscription,
            Err(e) => {
                core.disarm();
                release_line(driver.as_ref(), handle);
                return Err(e);
            }
        };
        let falling = match driver.on_edge(&handle, EdgeKind::Falling, edge_handler(&core)) {
            Ok(subscription) => subscription,
            Err(e) => {
                core.disarm();
                cancel_subscription(driver.as_ref(), line, rising);
                release_line(driver.as_ref(), handle);
                return Err(e);
            }
        };

        info!(line, calibration = self.rate.calibration(), "input line armed");
        *state = Some(Armed {
            driver,
            handle,
            rising,
            falling,
            core,
        });
        Ok(())
    }

    /// Disarm the line, wait for in-flight callbacks, then release it.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::InvalidState`] with
    ///   [`StateViolation::StopBeforeStart`] when not armed.
    /// * The driver's `close_line` error. The dispatcher is idle either way.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let armed = self
            .state
            .lock()
            .take()
            .ok_or(BridgeError::InvalidState(StateViolation::StopBeforeStart))?;
        let line = armed.core.line;

        armed.core.disarm();
        cancel_subscription(armed.driver.as_ref(), line, armed.rising);
        cancel_subscription(armed.driver.as_ref(), line, armed.falling);
        armed.core.wait_in_flight();

        armed.driver.close_line(armed.handle)?;
        info!(line, "input line released");
        Ok(())
    }

    /// Route one edge event to the armed line. Used by every driver
    /// callback; events arriving while idle count as late.
    pub fn handle(&self, event: EdgeEvent) {
        let core = self.state.lock().as_ref().map(|armed| Arc::clone(&armed.core));
        match core {
            Some(core) if core.line == event.line => core.handle(event),
            Some(core) => {
                debug!(line = core.line, event_line = event.line, "edge for a foreign line ignored");
            }
            None => {
                self.counters.late.fetch_add(1, Ordering::Relaxed);
                trace!(line = event.line, "edge while idle ignored");
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }
}

fn edge_handler(core: &Arc<EdgeCore>) -> EdgeHandler {
    let core = Arc::clone(core);
    Arc::new(move |event: EdgeEvent| core.handle(event))
}

fn cancel_subscription(driver: &dyn LineDriver, line: LineId, subscription: SubscriptionHandle) {
    if let Err(e) = driver.cancel(subscription) {
        warn!(line, error = %e, "failed to cancel edge subscription");
    }
}

fn release_line(driver: &dyn LineDriver, handle: LineHandle) {
    let line = handle.line();
    if let Err(e) = driver.close_line(handle) {
        warn!(line, error = %e, "failed to close line after aborted start");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
