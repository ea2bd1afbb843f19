//! Virtual-pin broker wire format.
//!
//! Every message starts with a 5-byte header:
//!
//! | Bytes | Field |
//! |---|---|
//! | 0 | command |
//! | 1–2 | message id (big-endian) |
//! | 3–4 | body length, or status code for [`Command::Response`] (big-endian) |
//!
//! Response frames carry no body. A virtual-pin write is a
//! [`Command::Hardware`] frame whose body is `vw\0<pin>\0<value>`.

use pulsebridge_types::{BridgeError, Payload, VirtualPin};

pub const HEADER_LEN: usize = 5;

/// Status codes carried by [`Command::Response`] frames.
pub mod status {
    pub const OK: u16 = 200;
    pub const ILLEGAL_COMMAND: u16 = 2;
    pub const NOT_AUTHENTICATED: u16 = 5;
    pub const INVALID_TOKEN: u16 = 9;

    /// Human-readable name of a status code, for logs.
    pub fn describe(code: u16) -> &'static str {
        match code {
            OK => "ok",
            ILLEGAL_COMMAND => "illegal command",
            NOT_AUTHENTICATED => "not authenticated",
            INVALID_TOKEN => "invalid token",
            _ => "unknown status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Response,
    Login,
    Ping,
    Hardware,
    /// Any command this client does not act on.
    Other(u8),
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Response => 0,
            Command::Login => 2,
            Command::Ping => 6,
            Command::Hardware => 20,
            Command::Other(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Command::Response,
            2 => Command::Login,
            6 => Command::Ping,
            20 => Command::Hardware,
            c => Command::Other(c),
        }
    }
}

/// Decoded 5-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub msg_id: u16,
    /// Body length, or the status code of a response.
    pub value: u16,
}

impl Header {
    pub fn decode(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            command: Command::from_code(bytes[0]),
            msg_id: u16::from_be_bytes([bytes[1], bytes[2]]),
            value: u16::from_be_bytes([bytes[3], bytes[4]]),
        }
    }

    /// Number of body bytes that follow this header.
    pub fn body_len(&self) -> usize {
        match self.command {
            Command::Response => 0,
            _ => usize::from(self.value),
        }
    }
}

/// Encode a frame with a body.
pub fn encode(command: Command, msg_id: u16, body: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let len = u16::try_from(body.len()).map_err(|_| {
        BridgeError::Protocol(format!("body of {} bytes exceeds frame limit", body.len()))
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(command.code());
    frame.extend_from_slice(&msg_id.to_be_bytes());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Encode a response frame carrying `status`.
pub fn encode_response(msg_id: u16, status: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN);
    frame.push(Command::Response.code());
    frame.extend_from_slice(&msg_id.to_be_bytes());
    frame.extend_from_slice(&status.to_be_bytes());
    frame
}

/// Body of a virtual-pin write: `vw\0<pin>\0<value>`.
pub fn virtual_write_body(pin: VirtualPin, payload: &Payload) -> Vec<u8> {
    format!("vw\0{}\0{}", pin.0, payload).into_bytes()
}

/// Split a hardware body into its NUL-separated fields.
pub fn split_body(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

/// Message id generator that starts at 1 and skips 0 on wrap-around.
#[derive(Debug, Default)]
pub struct MessageIds {
    last: std::sync::atomic::AtomicU16,
}

impl MessageIds {
    pub fn next(&self) -> u16 {
        use std::sync::atomic::Ordering;
        loop {
            let id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}
