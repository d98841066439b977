//! WebSocket connection to the speech-synthesis service.
//!
//! The socket is split once at connect time. The write half and the read
//! half sit behind separate locks so `send` (called from `speak`) and
//! `receive` (called from the receiver task) never wait on each other:
//!
//! ```text
//!             ┌──────────── writer: Mutex<SplitSink> ◀── send(frame)
//! WebSocket ──┤
//!             └──────────── reader: Mutex<SplitStream> ──▶ receive(timeout)
//! ```
//!
//! State changes only through `connect` and `disconnect`. A closed or broken
//! stream is reported by `receive` as [`Received::Closed`]; deciding what to
//! do about it is up to the caller. There is no automatic reconnection.

use std::fmt;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::{InboundFrame, OutboundFrame};
use super::{ConnectionError, ConnectionResult};
use crate::core::playback::AudioChunk;

/// Default bound on the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the closing handshake during `disconnect`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Types
// =============================================================================

/// Connection state, changed only by explicit `connect`/`disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Authorization scheme sent with the token during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    /// `Authorization: Token <key>`
    #[default]
    Token,
    /// `Authorization: Bearer <token>`
    Bearer,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "Token",
            Self::Bearer => "Bearer",
        }
    }
}

impl std::str::FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token" => Ok(Self::Token),
            "bearer" => Ok(Self::Bearer),
            other => Err(format!("unsupported auth scheme '{other}' (expected token or bearer)")),
        }
    }
}

/// How the stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOfStream {
    /// The peer completed the closing handshake.
    Graceful { code: Option<u16>, reason: String },
    /// The transport failed or vanished without a close frame.
    Abrupt(String),
}

impl fmt::Display for EndOfStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful { code, reason } => {
                write!(f, "closed by peer")?;
                if let Some(code) = code {
                    write!(f, " (code {code})")?;
                }
                if !reason.is_empty() {
                    write!(f, ": {reason}")?;
                }
                Ok(())
            }
            Self::Abrupt(description) => write!(f, "connection lost: {description}"),
        }
    }
}

/// Result of a single `receive` call.
#[derive(Debug)]
pub enum Received {
    /// A binary frame: one chunk of synthesized audio.
    Audio(AudioChunk),
    /// A decoded control frame.
    Control(InboundFrame),
    /// A text frame that could not be decoded.
    Malformed { raw: String, reason: String },
    /// Nothing arrived before the timeout.
    Timeout,
    /// The stream has ended; no more frames will arrive.
    Closed(EndOfStream),
}

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub auth_scheme: AuthScheme,
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auth_scheme: AuthScheme::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// =============================================================================
// SynthesisConnection
// =============================================================================

/// Owns exactly one duplex connection to the synthesis endpoint.
pub struct SynthesisConnection {
    options: ConnectionOptions,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    /// Serialises connect/disconnect against each other.
    lifecycle: Mutex<()>,
}

impl SynthesisConnection {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            state: RwLock::new(ConnectionState::Disconnected),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Perform the WebSocket handshake. No-op when already connected.
    pub async fn connect(&self, url: &str, token: &str) -> ConnectionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            debug!("Synthesis connection already established");
            return Ok(());
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::ConnectionFailed(format!("invalid endpoint: {e}")))?;
        let credential =
            HeaderValue::from_str(&format!("{} {}", self.options.auth_scheme.as_str(), token))
                .map_err(|_| {
                    ConnectionError::ConnectionFailed(
                        "auth token contains invalid header characters".to_string(),
                    )
                })?;
        request.headers_mut().insert(AUTHORIZATION, credential);

        info!("Connecting to synthesis service: {}", redact_query(url));

        let (ws_stream, _response) = tokio::time::timeout(
            self.options.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| {
            ConnectionError::ConnectionFailed(format!(
                "handshake timed out after {}ms",
                self.options.connect_timeout.as_millis()
            ))
        })?
        .map_err(map_handshake_error)?;

        let (sink, stream) = ws_stream.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(stream);
        *self.state.write() = ConnectionState::Connected;

        info!("Synthesis connection established");
        Ok(())
    }

    /// Close the connection. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let was_connected = self.is_connected();
        *self.state.write() = ConnectionState::Disconnected;

        if let Some(mut sink) = self.writer.lock().await.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => debug!("Close frame sent"),
                Ok(Err(e)) => debug!("Error while closing synthesis socket: {}", e),
                Err(_) => debug!("Timed out sending close frame"),
            }
        }
        self.reader.lock().await.take();

        if was_connected {
            info!("Synthesis connection closed");
        }
    }

    /// Serialise and send one control frame.
    pub async fn send(&self, frame: &OutboundFrame) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::SendAfterClose);
        }
        let json = frame
            .to_json()
            .map_err(|e| ConnectionError::Serialization(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ConnectionError::SendAfterClose);
        };
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        debug!(frame = frame.kind(), "Sent control frame");
        Ok(())
    }

    /// Wait up to `timeout` for the next data or control frame.
    ///
    /// Ping/pong traffic is answered by the transport and never surfaces here.
    pub async fn receive(&self, timeout: Duration) -> ConnectionResult<Received> {
        let deadline = Instant::now() + timeout;
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };

        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Ok(Received::Timeout),
                Ok(next) => next,
            };

            let message = match next {
                None => {
                    return Ok(Received::Closed(EndOfStream::Abrupt(
                        "stream ended without a close frame".to_string(),
                    )));
                }
                Some(Err(e)) => return Ok(Received::Closed(classify_stream_error(e))),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Binary(data) => return Ok(Received::Audio(AudioChunk::from(data))),
                Message::Text(text) => {
                    let text = text.as_str();
                    return Ok(match InboundFrame::parse(text) {
                        Ok(frame) => Received::Control(frame),
                        Err(e) => Received::Malformed {
                            raw: text.to_string(),
                            reason: e.to_string(),
                        },
                    });
                }
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (
                            Some(u16::from(frame.code)),
                            frame.reason.as_str().to_string(),
                        ),
                        None => (None, String::new()),
                    };
                    return Ok(Received::Closed(EndOfStream::Graceful { code, reason }));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

impl Default for SynthesisConnection {
    fn default() -> Self {
        Self::new(ConnectionOptions::default())
    }
}

fn map_handshake_error(error: tungstenite::Error) -> ConnectionError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                ConnectionError::AuthenticationFailed(format!("handshake rejected with {status}"))
            } else {
                ConnectionError::ConnectionFailed(format!("handshake rejected with {status}"))
            }
        }
        other => ConnectionError::ConnectionFailed(other.to_string()),
    }
}

fn classify_stream_error(error: tungstenite::Error) -> EndOfStream {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            EndOfStream::Graceful {
                code: Some(u16::from(CloseCode::Normal)),
                reason: String::new(),
            }
        }
        other => {
            warn!("Synthesis stream error: {}", other);
            EndOfStream::Abrupt(other.to_string())
        }
    }
}

/// Endpoint URLs can carry credentials in the query string; keep them out of logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_scheme_parsing() {
        assert_eq!("token".parse::<AuthScheme>().unwrap(), AuthScheme::Token);
        assert_eq!("Bearer".parse::<AuthScheme>().unwrap(), AuthScheme::Bearer);
        assert!("basic".parse::<AuthScheme>().is_err());
    }

    #[test]
    fn test_end_of_stream_display() {
        let graceful = EndOfStream::Graceful {
            code: Some(1000),
            reason: "bye".to_string(),
        };
        assert_eq!(graceful.to_string(), "closed by peer (code 1000): bye");
        assert_eq!(
            EndOfStream::Abrupt("reset".to_string()).to_string(),
            "connection lost: reset"
        );
    }

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("wss://api.example.com/v1/speak?model=x&token=y"),
            "wss://api.example.com/v1/speak"
        );
        assert_eq!(redact_query("ws://localhost:1"), "ws://localhost:1");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let connection = SynthesisConnection::default();
        let result = connection.send(&OutboundFrame::Clear).await;
        assert!(matches!(result, Err(ConnectionError::SendAfterClose)));
    }

    #[tokio::test]
    async fn test_receive_while_disconnected_fails() {
        let connection = SynthesisConnection::default();
        let result = connection.receive(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let connection = SynthesisConnection::default();
        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connection = SynthesisConnection::default();
        let result = connection
            .connect(&format!("ws://127.0.0.1:{port}/v1/speak"), "key")
            .await;
        assert!(matches!(result, Err(ConnectionError::ConnectionFailed(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let connection = SynthesisConnection::default();
        let result = connection.connect("not a url", "key").await;
        assert!(matches!(result, Err(ConnectionError::ConnectionFailed(_))));
    }
}
