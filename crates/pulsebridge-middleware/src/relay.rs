//! [`DeviceEventRelay`] – websocket reader for a local home-automation hub.
//!
//! The hub pushes JSON frames of the form
//! `{"module": "...", "action": "...", "data": {...}}`. Each text frame is
//! rendered into a single timestamped line with [`format_device_message`]
//! before it is forwarded to a virtual pin.

use chrono::{DateTime, TimeZone};
use futures_util::StreamExt;
use pulsebridge_types::BridgeError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

pub struct DeviceEventRelay {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl DeviceEventRelay {
    /// Open the websocket at `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Channel(format!("websocket connect to {url}: {e}")))?;
        info!(url, status = %response.status(), "connected to device hub");
        Ok(Self {
            url: url.to_string(),
            stream,
        })
    }

    /// Next text frame, or `None` once the hub closes the connection.
    ///
    /// Binary frames and control frames are skipped.
    pub async fn next_text(&mut self) -> Result<Option<String>, BridgeError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
                Some(Ok(Message::Close(frame))) => {
                    debug!(url = %self.url, ?frame, "device hub closed the websocket");
                    return Ok(None);
                }
                None => return Ok(None),
                Some(Ok(other)) => {
                    debug!(url = %self.url, kind = frame_kind(&other), "skipping non-text frame");
                }
                Some(Err(e)) => {
                    return Err(BridgeError::Channel(format!("websocket read: {e}")));
                }
            }
        }
    }

    /// Send a close frame. Errors are ignored; the peer may already be gone.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(url = %self.url, error = %e, "websocket close failed");
        }
    }
}

fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

/// Render a hub frame as `<YYYY-MM-DD HH:MM:SS> <summary>`.
///
/// JSON objects carrying `module` and `action` summarise as
/// `module/action` followed by the compact `data` value if present.
/// Anything else is passed through trimmed.
pub fn format_device_message<Tz>(text: &str, at: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let stamp = at.format("%Y-%m-%d %H:%M:%S");
    format!("{stamp} {}", summarize(text))
}

fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(trimmed)
    else {
        return trimmed.to_string();
    };
    let module = map.get("module").and_then(|v| v.as_str());
    let action = map.get("action").and_then(|v| v.as_str());
    match (module, action) {
        (Some(module), Some(action)) => match map.get("data") {
            Some(data) if !data.is_null() => format!("{module}/{action} {data}"),
            _ => format!("{module}/{action}"),
        },
        _ => trimmed.to_string(),
    }
}
