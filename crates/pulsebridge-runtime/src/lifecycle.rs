//! [`LifecycleController`] – authorise, arm, wait, tear down.
//!
//! The power bridge's whole life is one call to [`LifecycleController::run`]:
//!
//! 1. authorise against the broker; a rejected token ends the run before any
//!    hardware is touched;
//! 2. spawn the [`Outbox`] and arm the [`EdgeDispatcher`];
//! 3. wait for the shutdown signal;
//! 4. disarm the line, drain the outbox (bounded by the drain timeout), close
//!    the broker session.

use std::sync::Arc;
use std::time::Duration;

use pulsebridge_hal::LineDriver;
use pulsebridge_kernel::{MonotonicClock, RateCalculator, SystemClock};
use pulsebridge_middleware::{DEFAULT_DRAIN_TIMEOUT, Outbox, OutboxReport, PublishSink};
use pulsebridge_types::{BridgeError, LineId, SampleSink, VirtualPin};
use tracing::{info, instrument, warn};

use crate::dispatcher::{DispatcherStats, EdgeDispatcher};
use crate::shutdown::ShutdownSignal;

/// How a bridge run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<R> {
    /// The broker rejected the token. Nothing else was started.
    Unauthorized,
    /// The bridge ran until shutdown and tore down cleanly.
    Completed(R),
}

/// Totals of a completed power-bridge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerReport {
    pub edges: DispatcherStats,
    pub delivery: OutboxReport,
}

pub struct LifecycleController {
    sink: Arc<dyn PublishSink>,
    driver: Arc<dyn LineDriver>,
    line: LineId,
    pin: VirtualPin,
    rate: RateCalculator,
    clock: Arc<dyn MonotonicClock>,
    drain_timeout: Duration,
}

impl LifecycleController {
    /// Bridge `line` to `pin` with the default calibration.
    pub fn new(
        sink: Arc<dyn PublishSink>,
        driver: Arc<dyn LineDriver>,
        line: LineId,
        pin: VirtualPin,
    ) -> Self {
        Self {
            sink,
            driver,
            line,
            pin,
            rate: RateCalculator::default(),
            clock: Arc::new(SystemClock::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_calibration(mut self, calibration: f64) -> Self {
        self.rate = RateCalculator::new(calibration);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound how long shutdown waits for queued samples to be published.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Run the bridge until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Errors from authorisation (transport, timeout) or from arming the
    /// line. The broker session is closed before any error is returned.
    #[instrument(skip_all, fields(line = self.line, pin = %self.pin))]
    pub async fn run(
        &self,
        shutdown: ShutdownSignal,
    ) -> Result<RunOutcome<PowerReport>, BridgeError> {
        let authorized = match self.sink.authorize().await {
            Ok(authorized) => authorized,
            Err(e) => {
                self.close_sink().await;
                return Err(e);
            }
        };
        if !authorized {
            warn!("broker rejected the authorization token");
            self.close_sink().await;
            return Ok(RunOutcome::Unauthorized);
        }
        info!("authorized");

        let outbox = Arc::new(
            Outbox::spawn(Arc::clone(&self.sink), self.pin).with_drain_timeout(self.drain_timeout),
        );
        let samples: Arc<dyn SampleSink> = outbox.clone();
        let dispatcher = EdgeDispatcher::new(samples, self.rate).with_clock(Arc::clone(&self.clock));

        if let Err(e) = dispatcher.start(Arc::clone(&self.driver), self.line) {
            outbox.close().await;
            self.close_sink().await;
            return Err(e);
        }
        info!("pin enabled, press Ctrl-C to stop");

        shutdown.wait().await;
        info!("shutting down");

        let stopped = dispatcher.stop();
        let delivery = outbox.close().await;
        self.close_sink().await;
        stopped?;

        let report = PowerReport {
            edges: dispatcher.stats(),
            delivery,
        };
        info!(
            rising = report.edges.rising,
            published = report.delivery.published,
            failed = report.delivery.failed,
            "power bridge stopped"
        );
        Ok(RunOutcome::Completed(report))
    }

    async fn close_sink(&self) {
        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "failed to close broker session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pulsebridge_hal::SimLineDriver;
    use pulsebridge_kernel::ManualClock;
    use pulsebridge_types::{EdgeKind, Payload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::shutdown::ShutdownTrigger;

    const LINE: LineId = 18;

    struct MockSink {
        verdict: Result<bool, ()>,
        /// `publish` never completes, like a write to a broker that stopped
        /// reading.
        stuck: bool,
        published: Mutex<Vec<(VirtualPin, Payload)>>,
        closes: AtomicUsize,
    }

    impl MockSink {
        fn new(verdict: Result<bool, ()>) -> Arc<Self> {
            Arc::new(Self {
                verdict,
                stuck: false,
                published: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PublishSink for MockSink {
        async fn authorize(&self) -> Result<bool, BridgeError> {
            self.verdict
                .map_err(|()| BridgeError::Channel("broker unreachable".to_string()))
        }

        async fn publish(&self, pin: VirtualPin, payload: Payload) -> Result<(), BridgeError> {
            if self.stuck {
                return std::future::pending().await;
            }
            self.published.lock().push((pin, payload));
            Ok(())
        }

        async fn close(&self) -> Result<(), BridgeError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_armed(driver: &SimLineDriver) {
        for _ in 0..1000 {
            if driver.live_subscriptions() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("line was never armed");
    }

    fn controller(
        sink: Arc<MockSink>,
        driver: Arc<SimLineDriver>,
        clock: Arc<ManualClock>,
    ) -> LifecycleController {
        LifecycleController::new(sink, driver, LINE, VirtualPin(LINE))
            .with_calibration(3600.0)
            .with_clock(clock)
    }

    async fn script(
        driver: &SimLineDriver,
        clock: &ManualClock,
        trigger: ShutdownTrigger,
        gaps: &[f64],
    ) {
        wait_armed(driver).await;
        driver.emit(LINE, EdgeKind::Rising);
        for gap in gaps {
            clock.advance_secs(*gap);
            driver.emit(LINE, EdgeKind::Falling);
            driver.emit(LINE, EdgeKind::Rising);
        }
        trigger.trigger();
    }

    #[tokio::test]
    async fn unauthorized_run_never_touches_the_line() {
        let sink = MockSink::new(Ok(false));
        let driver = Arc::new(SimLineDriver::new().with_line(LINE));
        let controller = controller(sink.clone(), driver.clone(), Arc::new(ManualClock::new()));
        let (_trigger, signal) = ShutdownSignal::new();

        let outcome = controller.run(signal).await.unwrap();

        assert_eq!(outcome, RunOutcome::Unauthorized);
        assert_eq!(driver.calls().open_line, 0);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorization_error_is_returned_after_closing() {
        let sink = MockSink::new(Err(()));
        let driver = Arc::new(SimLineDriver::new().with_line(LINE));
        let controller = controller(sink.clone(), driver.clone(), Arc::new(ManualClock::new()));
        let (_trigger, signal) = ShutdownSignal::new();

        let result = controller.run(signal).await;

        assert!(matches!(result, Err(BridgeError::Channel(_))));
        assert_eq!(driver.calls().open_line, 0);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publishes_rates_in_edge_order_then_tears_down() {
        let sink = MockSink::new(Ok(true));
        let driver = Arc::new(SimLineDriver::new().with_line(LINE));
        let clock = Arc::new(ManualClock::new());
        let controller = controller(sink.clone(), driver.clone(), clock.clone());
        let (trigger, signal) = ShutdownSignal::new();

        let (outcome, ()) = tokio::join!(
            controller.run(signal),
            script(&driver, &clock, trigger, &[1.0, 2.0, 0.5]),
        );

        let RunOutcome::Completed(report) = outcome.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(report.edges.rising, 4);
        assert_eq!(report.edges.falling, 3);
        assert_eq!(report.delivery.published, 3);

        let published = sink.published.lock().clone();
        assert_eq!(
            published,
            vec![
                (VirtualPin(LINE), Payload::Rate(3600.0)),
                (VirtualPin(LINE), Payload::Rate(1800.0)),
                (VirtualPin(LINE), Payload::Rate(7200.0)),
            ]
        );

        assert!(!driver.is_open(LINE));
        let calls = driver.calls();
        assert_eq!(calls.cancel, 2);
        assert_eq!(calls.close_line, 1);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_callback_after_shutdown_publishes_nothing() {
        let sink = MockSink::new(Ok(true));
        let driver = Arc::new(SimLineDriver::new().with_line(LINE));
        let clock = Arc::new(ManualClock::new());
        let controller = controller(sink.clone(), driver.clone(), clock.clone());
        let (trigger, signal) = ShutdownSignal::new();

        let (outcome, ()) = tokio::join!(
            controller.run(signal),
            script(&driver, &clock, trigger, &[1.0]),
        );
        let RunOutcome::Completed(report) = outcome.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(report.delivery.published, 1);

        let late = driver.registered_handler(LINE, EdgeKind::Rising).unwrap();
        clock.advance_secs(1.0);
        late(pulsebridge_types::EdgeEvent::rising(LINE));

        assert_eq!(sink.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_line_fails_after_authorization() {
        let sink = MockSink::new(Ok(true));
        let driver = Arc::new(SimLineDriver::new().failing_open("exported by another process"));
        let controller = controller(sink.clone(), driver.clone(), Arc::new(ManualClock::new()));
        let (_trigger, signal) = ShutdownSignal::new();

        let result = controller.run(signal).await;

        assert!(matches!(
            result,
            Err(BridgeError::ResourceUnavailable { line: LINE, .. })
        ));
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert!(sink.published.lock().is_empty());
    }

    #[tokio::test]
    async fn shutdown_completes_when_publish_never_returns() {
        let sink = Arc::new(MockSink {
            verdict: Ok(true),
            stuck: true,
            published: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        let driver = Arc::new(SimLineDriver::new().with_line(LINE));
        let clock = Arc::new(ManualClock::new());
        let controller = controller(sink.clone(), driver.clone(), clock.clone())
            .with_drain_timeout(Duration::from_millis(50));
        let (trigger, signal) = ShutdownSignal::new();

        let run = async {
            tokio::time::timeout(Duration::from_secs(3), controller.run(signal))
                .await
                .expect("run must return after shutdown")
        };
        let (outcome, ()) = tokio::join!(run, script(&driver, &clock, trigger, &[1.0, 1.0]));

        let RunOutcome::Completed(report) = outcome.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(report.delivery, OutboxReport { published: 0, failed: 2 });
        assert!(!driver.is_open(LINE));
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }
}
