//! `pulsebridge-middleware` – The remote channel.
//!
//! Carries payloads from the bridges to the virtual-pin broker without
//! caring what they mean.
//!
//! # Modules
//!
//! - [`sink`] – the [`PublishSink`] contract the bridges publish through.
//! - [`protocol`] – framing for the broker's binary wire format.
//! - [`client`] – [`VirtualPinClient`], the TCP implementation of
//!   [`PublishSink`].
//! - [`outbox`] – [`Outbox`], the ordered, non-blocking publisher that edge
//!   callbacks hand samples to.
//! - [`relay`] – [`DeviceEventRelay`], the websocket reader used by the relay
//!   bridge.

pub mod client;
pub mod outbox;
pub mod protocol;
pub mod relay;
pub mod sink;

pub use client::{ClientOptions, VirtualPinClient, parse_server_address};
pub use outbox::{DEFAULT_DRAIN_TIMEOUT, Outbox, OutboxReport};
pub use relay::{DeviceEventRelay, format_device_message};
pub use sink::PublishSink;
