//! The remote-channel contract.
//!
//! The bridges never speak the broker protocol directly. They hold an
//! `Arc<dyn PublishSink>`; [`VirtualPinClient`][crate::client::VirtualPinClient]
//! is the production implementation and tests substitute recording mocks.

use async_trait::async_trait;
use pulsebridge_types::{BridgeError, Payload, VirtualPin};

/// A remote virtual-pin channel.
///
/// # Contract
///
/// * `authorize` – one-shot handshake; resolves exactly once with the
///   broker's verdict. `Ok(false)` means the token was rejected.
/// * `publish` – write `payload` to `pin`. May be fire-and-forget; a returned
///   error means this payload was not delivered, nothing more.
/// * `close` – release the connection. Idempotent.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn authorize(&self) -> Result<bool, BridgeError>;

    async fn publish(&self, pin: VirtualPin, payload: Payload) -> Result<(), BridgeError>;

    async fn close(&self) -> Result<(), BridgeError>;
}
