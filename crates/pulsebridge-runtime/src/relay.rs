//! [`RelayController`] – forwards device-hub websocket events to a virtual
//! pin as timestamped text lines.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use pulsebridge_middleware::{
    DEFAULT_DRAIN_TIMEOUT, DeviceEventRelay, Outbox, OutboxReport, PublishSink,
    format_device_message,
};
use pulsebridge_types::{BridgeError, Payload, VirtualPin};
use tracing::{info, instrument, warn};

use crate::lifecycle::RunOutcome;
use crate::shutdown::ShutdownSignal;

/// Totals of a completed relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Text frames received from the hub.
    pub messages: u64,
    pub delivery: OutboxReport,
}

pub struct RelayController {
    sink: Arc<dyn PublishSink>,
    device_url: String,
    pin: VirtualPin,
    drain_timeout: Duration,
}

impl RelayController {
    pub fn new(sink: Arc<dyn PublishSink>, device_url: impl Into<String>, pin: VirtualPin) -> Self {
        Self {
            sink,
            device_url: device_url.into(),
            pin,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Bound how long shutdown waits for queued events to be published.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Relay hub events until `shutdown` fires or the hub hangs up.
    ///
    /// # Errors
    ///
    /// Authorisation transport errors, a failed websocket connect, or a
    /// websocket read error. Everything started is torn down first.
    #[instrument(skip_all, fields(url = %self.device_url, pin = %self.pin))]
    pub async fn run(
        &self,
        shutdown: ShutdownSignal,
    ) -> Result<RunOutcome<RelayReport>, BridgeError> {
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

        let mut hub = match DeviceEventRelay::connect(&self.device_url).await {
            Ok(hub) => hub,
            Err(e) => {
                self.close_sink().await;
                return Err(e);
            }
        };
        let outbox =
            Outbox::spawn(Arc::clone(&self.sink), self.pin).with_drain_timeout(self.drain_timeout);
        info!("relaying device events, press Ctrl-C to stop");

        let mut messages = 0u64;
        let mut failure = None;
        let shutdown = shutdown.wait();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                next = hub.next_text() => match next {
                    Ok(Some(text)) => {
                        messages += 1;
                        let line = format_device_message(&text, Local::now());
                        info!(message = %line, "device event");
                        if let Err(e) = outbox.push(Payload::Text(line)) {
                            warn!(error = %e, "device event dropped");
                        }
                    }
                    Ok(None) => {
                        info!("device hub closed the connection");
                        break;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
            }
        }

        hub.close().await;
        let delivery = outbox.close().await;
        self.close_sink().await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(RunOutcome::Completed(RelayReport { messages, delivery }))
    }

    async fn close_sink(&self) {
        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "failed to close broker session");
        }
    }
}
