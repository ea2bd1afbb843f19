//! [`VirtualPinClient`] – TCP client for the virtual-pin broker.
//!
//! One reader task owns the socket's read half. It routes response frames to
//! whoever is waiting on that message id, answers broker pings, and ignores
//! inbound hardware commands (this bridge only writes). Writes go through a
//! shared, async-locked write half.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pulsebridge_types::{BridgeError, Payload, VirtualPin};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OnceCell, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::protocol::{
    Command, HEADER_LEN, Header, MessageIds, encode, encode_response, split_body, status,
    virtual_write_body,
};
use crate::sink::PublishSink;

/// Tunables for [`VirtualPinClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// How long `authorize` waits for the broker's verdict.
    pub auth_timeout: Duration,
    /// Interval between keep-alive pings once authorised.
    pub heartbeat: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(10),
        }
    }
}

struct Shared {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u16, oneshot::Sender<u16>>>,
    ids: MessageIds,
    authorized: AtomicBool,
}

impl Shared {
    async fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Channel("connection is closed".to_string()))?;
        writer
            .write_all(frame)
            .await
            .map_err(|e| BridgeError::Channel(format!("socket write failed: {e}")))
    }
}

/// Connected, optionally authorised, broker session.
pub struct VirtualPinClient {
    address: String,
    token: Zeroizing<String>,
    options: ClientOptions,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    verdict: OnceCell<bool>,
}

impl VirtualPinClient {
    /// Open a TCP connection to `server` (`tcp://host:port` or `host:port`).
    ///
    /// # Errors
    ///
    /// [`BridgeError::Configuration`] for a malformed address,
    /// [`BridgeError::Channel`] when the connection cannot be established.
    pub async fn connect(
        server: &str,
        token: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, BridgeError> {
        let address = parse_server_address(server)?;
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| BridgeError::Channel(format!("cannot connect to {address}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on broker socket");
        }
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            ids: MessageIds::default(),
            authorized: AtomicBool::new(false),
        });
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        info!(server = %address, "connected to virtual-pin broker");
        Ok(Self {
            address,
            token: Zeroizing::new(token.into()),
            options,
            shared,
            tasks: Mutex::new(vec![reader_task]),
            verdict: OnceCell::new(),
        })
    }

    /// Whether the broker accepted the token and the session is still open.
    pub fn is_authorized(&self) -> bool {
        self.shared.authorized.load(Ordering::SeqCst)
    }

    /// Send the login frame and wait for the broker's verdict. Starts the
    /// heartbeat when the token is accepted.
    async fn login(&self) -> Result<bool, BridgeError> {
        let id = self.shared.ids.next();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let frame = encode(Command::Login, id, self.token.as_bytes())?;
        if let Err(e) = self.shared.send(&frame).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        let verdict = match tokio::time::timeout(self.options.auth_timeout, rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => {
                return Err(BridgeError::Channel(
                    "connection closed before authorization completed".to_string(),
                ));
            }
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                return Err(BridgeError::Channel(format!(
                    "no authorization reply within {:?}",
                    self.options.auth_timeout
                )));
            }
        };

        if verdict != status::OK {
            warn!(
                status = verdict,
                reason = status::describe(verdict),
                "broker rejected the device token"
            );
            return Ok(false);
        }

        self.shared.authorized.store(true, Ordering::SeqCst);
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.shared),
            self.options.heartbeat,
        ));
        self.tasks.lock().push(heartbeat);
        Ok(true)
    }
}

#[async_trait]
impl PublishSink for VirtualPinClient {
    /// Log in once. Later calls return the first verdict without touching
    /// the socket; a transport error is not cached.
    async fn authorize(&self) -> Result<bool, BridgeError> {
        self.verdict.get_or_try_init(|| self.login()).await.copied()
    }

    async fn publish(&self, pin: VirtualPin, payload: Payload) -> Result<(), BridgeError> {
        if !self.is_authorized() {
            return Err(BridgeError::Publish {
                pin,
                details: "session is not authorized".to_string(),
            });
        }
        let body = virtual_write_body(pin, &payload);
        let frame = encode(Command::Hardware, self.shared.ids.next(), &body).map_err(|e| {
            BridgeError::Publish {
                pin,
                details: e.to_string(),
            }
        })?;
        self.shared
            .send(&frame)
            .await
            .map_err(|e| BridgeError::Publish {
                pin,
                details: e.to_string(),
            })?;
        trace!(%pin, %payload, "virtual pin written");
        Ok(())
    }

    async fn close(&self) -> Result<(), BridgeError> {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.shared.authorized.store(false, Ordering::SeqCst);
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            debug!(error = %e, "broker socket shutdown failed");
        }
        info!(server = %self.address, "disconnected from virtual-pin broker");
        Ok(())
    }
}

impl Drop for VirtualPinClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let mut raw = [0u8; HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut raw).await {
            debug!(error = %e, "broker connection closed");
            break;
        }
        let header = Header::decode(raw);
        let mut body = vec![0u8; header.body_len()];
        if let Err(e) = reader.read_exact(&mut body).await {
            warn!(error = %e, "truncated frame from broker");
            break;
        }

        match header.command {
            Command::Response => {
                let waiter = shared.pending.lock().remove(&header.msg_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(header.value);
                    }
                    None => trace!(msg_id = header.msg_id, status = header.value, "unsolicited response"),
                }
            }
            Command::Ping => {
                if let Err(e) = shared.send(&encode_response(header.msg_id, status::OK)).await {
                    warn!(error = %e, "failed to answer broker ping");
                    break;
                }
            }
            Command::Hardware => {
                debug!(fields = ?split_body(&body), "ignoring inbound hardware command");
            }
            other => {
                debug!(command = ?other, "ignoring broker command");
            }
        }
    }
    shared.authorized.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with an error.
    shared.pending.lock().clear();
}

async fn heartbeat_loop(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = match encode(Command::Ping, shared.ids.next(), &[]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "cannot encode ping");
                break;
            }
        };
        if let Err(e) = shared.send(&frame).await {
            warn!(error = %e, "heartbeat failed");
            break;
        }
    }
}

/// Normalise `tcp://host:port` or `host:port` into `host:port`.
pub fn parse_server_address(server: &str) -> Result<String, BridgeError> {
    let trimmed = server.trim();
    let rest = match trimmed.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(BridgeError::Configuration(format!(
                "unsupported server scheme '{scheme}' (expected tcp://)"
            )));
        }
        None => trimmed,
    };
    let rest = rest.trim_end_matches('/');
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(rest.to_string())
        }
        _ => Err(BridgeError::Configuration(format!(
            "server address '{server}' must be host:port"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_frame(stream: &mut TcpStream) -> (Header, Vec<u8>) {
        let mut raw = [0u8; HEADER_LEN];
        stream.read_exact(&mut raw).await.unwrap();
        let header = Header::decode(raw);
        let mut body = vec![0u8; header.body_len()];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    /// Fake broker: answers the login with `verdict`, then hands the socket
    /// to the test.
    async fn broker(verdict: u16) -> (String, JoinHandle<(TcpStream, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (header, token) = read_frame(&mut stream).await;
            assert_eq!(header.command, Command::Login);
            stream
                .write_all(&encode_response(header.msg_id, verdict))
                .await
                .unwrap();
            (stream, token)
        });
        (addr, task)
    }

    #[test]
    fn parse_accepts_tcp_scheme_and_bare_address() {
        assert_eq!(parse_server_address("tcp://127.0.0.1:8080").unwrap(), "127.0.0.1:8080");
        assert_eq!(parse_server_address("broker.local:8442").unwrap(), "broker.local:8442");
        assert_eq!(parse_server_address(" tcp://h:1/ ").unwrap(), "h:1");
    }

    #[test]
    fn parse_rejects_other_schemes_and_missing_port() {
        assert!(matches!(
            parse_server_address("http://127.0.0.1:8080"),
            Err(BridgeError::Configuration(_))
        ));
        assert!(parse_server_address("tcp://127.0.0.1").is_err());
        assert!(parse_server_address("tcp://:8080").is_err());
        assert!(parse_server_address("host:notaport").is_err());
    }

    #[tokio::test]
    async fn authorize_sends_token_and_accepts_ok() {
        let (addr, broker) = broker(status::OK).await;
        let client = VirtualPinClient::connect(&addr, "secret-token", ClientOptions::default())
            .await
            .unwrap();

        assert!(client.authorize().await.unwrap());
        assert!(client.is_authorized());

        let (_stream, token) = broker.await.unwrap();
        assert_eq!(token, b"secret-token");
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn authorize_logs_in_only_once() {
        let (addr, broker) = broker(status::OK).await;
        let client = VirtualPinClient::connect(&addr, "t", ClientOptions::default())
            .await
            .unwrap();

        assert!(client.authorize().await.unwrap());
        let (mut stream, _) = broker.await.unwrap();
        assert!(client.authorize().await.unwrap());

        // No second login frame, and a single heartbeat next to the reader.
        let next = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut stream)).await;
        assert!(next.is_err());
        assert_eq!(client.tasks.lock().len(), 2);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn authorize_reports_rejected_token() {
        let (addr, broker) = broker(status::INVALID_TOKEN).await;
        let client = VirtualPinClient::connect(&addr, "bad", ClientOptions::default())
            .await
            .unwrap();

        assert!(!client.authorize().await.unwrap());
        assert!(!client.is_authorized());
        let _ = broker.await.unwrap();
    }

    #[tokio::test]
    async fn authorize_times_out_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let options = ClientOptions {
            auth_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        };
        let client = VirtualPinClient::connect(&addr, "t", options).await.unwrap();
        assert!(matches!(
            client.authorize().await,
            Err(BridgeError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn publish_writes_virtual_pin_frame() {
        let (addr, broker) = broker(status::OK).await;
        let client = VirtualPinClient::connect(&addr, "t", ClientOptions::default())
            .await
            .unwrap();
        assert!(client.authorize().await.unwrap());
        let (mut stream, _) = broker.await.unwrap();

        client
            .publish(VirtualPin(18), Payload::Rate(1800.0))
            .await
            .unwrap();

        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.command, Command::Hardware);
        assert_eq!(split_body(&body), vec!["vw", "18", "1800"]);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_before_authorize_fails() {
        let (addr, _broker) = broker(status::OK).await;
        let client = VirtualPinClient::connect(&addr, "t", ClientOptions::default())
            .await
            .unwrap();
        let result = client.publish(VirtualPin(1), Payload::Rate(1.0)).await;
        assert!(matches!(result, Err(BridgeError::Publish { .. })));
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let (addr, broker) = broker(status::OK).await;
        let client = VirtualPinClient::connect(&addr, "t", ClientOptions::default())
            .await
            .unwrap();
        assert!(client.authorize().await.unwrap());
        let _ = broker.await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        let result = client.publish(VirtualPin(1), Payload::Rate(1.0)).await;
        assert!(matches!(result, Err(BridgeError::Publish { .. })));
    }

    #[tokio::test]
    async fn broker_ping_is_answered() {
        let (addr, broker) = broker(status::OK).await;
        let client = VirtualPinClient::connect(&addr, "t", ClientOptions::default())
            .await
            .unwrap();
        assert!(client.authorize().await.unwrap());
        let (mut stream, _) = broker.await.unwrap();

        stream
            .write_all(&encode(Command::Ping, 77, &[]).unwrap())
            .await
            .unwrap();
        let (header, _) = read_frame(&mut stream).await;
        assert_eq!(header.command, Command::Response);
        assert_eq!(header.msg_id, 77);
        assert_eq!(header.value, status::OK);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_is_channel_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = VirtualPinClient::connect(&addr, "t", ClientOptions::default()).await;
        assert!(matches!(result, Err(BridgeError::Channel(_))));
    }
}
