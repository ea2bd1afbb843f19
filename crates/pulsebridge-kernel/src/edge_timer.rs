//! [`EdgeTimer`] – stopwatch restarted on every accepted rising edge.
//!
//! The timer is *not running* until its first [`EdgeTimer::restart`]; while
//! stopped it reports zero elapsed time, which is what makes the very first
//! edge produce no sample.
//!
//! Elapsed time is truncated to the timer's resolution (1 ms by default), so
//! two edges closer together than one tick read as a zero-length interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{MonotonicClock, SystemClock};

/// Default measurement granularity.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_millis(1);

/// Monotonic stopwatch shared between overlapping edge callbacks.
///
/// The baseline lives behind a lock, so a reader racing a restart observes
/// either the old or the new baseline in full.
pub struct EdgeTimer {
    clock: Arc<dyn MonotonicClock>,
    resolution: Duration,
    baseline: Mutex<Option<Duration>>,
}

impl EdgeTimer {
    /// Timer over the process-wide [`SystemClock`] with [`DEFAULT_RESOLUTION`].
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Timer reading from `clock` with [`DEFAULT_RESOLUTION`].
    pub fn with_clock(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            clock,
            resolution: DEFAULT_RESOLUTION,
            baseline: Mutex::new(None),
        }
    }

    /// Override the measurement granularity (builder-style).
    /// A zero resolution disables truncation.
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    /// Seconds since the last restart, or `0.0` if never restarted.
    pub fn elapsed_seconds(&self) -> f64 {
        let baseline = *self.baseline.lock();
        self.measure(baseline, self.clock.now())
    }

    /// Set the baseline to now.
    pub fn restart(&self) {
        *self.baseline.lock() = Some(self.clock.now());
    }

    /// Read the elapsed time and restart in one critical section.
    pub fn lap(&self) -> f64 {
        let mut baseline = self.baseline.lock();
        let now = self.clock.now();
        let elapsed = self.measure(*baseline, now);
        *baseline = Some(now);
        elapsed
    }

    fn measure(&self, baseline: Option<Duration>, now: Duration) -> f64 {
        let Some(start) = baseline else {
            return 0.0;
        };
        let elapsed = now.saturating_sub(start);
        quantize(elapsed, self.resolution).as_secs_f64()
    }
}

impl Default for EdgeTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn quantize(elapsed: Duration, resolution: Duration) -> Duration {
    let tick = resolution.as_nanos();
    if tick == 0 {
        return elapsed;
    }
    let ticks = elapsed.as_nanos() / tick;
    Duration::from_nanos(u64::try_from(ticks * tick).unwrap_or(u64::MAX))
}
