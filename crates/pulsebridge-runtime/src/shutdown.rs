//! Process-wide stop request.
//!
//! [`ShutdownSignal::new`] returns a cloneable [`ShutdownTrigger`], safe to
//! fire from a signal-handler thread, and the single [`ShutdownSignal`] a
//! bridge awaits.

use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ShutdownTrigger {
    token: CancellationToken,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent and non-blocking.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (ShutdownTrigger, ShutdownSignal) {
        let token = CancellationToken::new();
        (
            ShutdownTrigger {
                token: token.clone(),
            },
            ShutdownSignal { token },
        )
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(self) {
        self.token.cancelled().await;
    }
}
