//! Synthesis service link: the WebSocket connection, its control frames and
//! the receiver loop that feeds synthesized audio into playback.

mod connection;
mod messages;
mod receiver;

pub use connection::{
    AuthScheme, ConnectionOptions, ConnectionState, DEFAULT_CONNECT_TIMEOUT, EndOfStream,
    Received, SynthesisConnection,
};
pub use messages::{InboundFrame, MetadataFrame, OutboundFrame};
pub use receiver::{
    DEFAULT_RECEIVE_TIMEOUT, ReceiverExit, ReceiverLoop, ReceiverReport, ReceiverStats,
};

use thiserror::Error;

/// Errors raised by the synthesis connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The service rejected the credentials during the handshake.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The handshake failed for any other reason.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A send was attempted while disconnected.
    #[error("Cannot send: connection is closed")]
    SendAfterClose,

    /// A receive was attempted while disconnected.
    #[error("Not connected")]
    NotConnected,

    /// The transport rejected a write.
    #[error("WebSocket error: {0}")]
    Transport(String),

    /// A frame could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
