//! Session controller: lifecycle ordering and the `speak` entry point.
//!
//! A [`TtsSession`] owns one synthesis connection, one playback buffer, one
//! playback engine and at most one receiver task. It is created once and
//! reused for every utterance:
//!
//! ```text
//! initialize ──▶ connect ──▶ start engine ──▶ spawn receiver
//!
//! speak(text) ──▶ hold + clear buffer (+ settle) ──▶ Clear ──▶ Speak ──▶ Flush
//!                    │
//!                    └── released when the service answers Cleared
//!
//! shutdown ──▶ cancel ──▶ join receiver ──▶ disconnect ──▶ stop engine
//! ```
//!
//! # Example
//! ```rust,no_run
//! use waav_speaker::config::ClientConfig;
//! use waav_speaker::core::session::TtsSession;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = TtsSession::new(ClientConfig::from_env()?);
//! session.initialize_from_config().await?;
//! session.speak("Hello there").await?;
//! session.speak("Actually, never mind").await?; // barge-in
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::{ClientConfig, ConfigError};
use crate::core::playback::{
    OutputBackend, PlaybackBuffer, PlaybackEngine, PlaybackError, RodioBackend,
};
use crate::core::synthesis::{
    ConnectionError, ConnectionState, OutboundFrame, ReceiverLoop, ReceiverReport,
    SynthesisConnection,
};

/// Characters of the text included in logs.
const LOG_PREVIEW_CHARS: usize = 50;

// =============================================================================
// Errors
// =============================================================================

/// Why `initialize` failed. The session is left not-ready.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not connect to synthesis service: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Could not start playback: {0}")]
    Playback(#[from] PlaybackError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session initialization failed: {0}")]
    Initialization(#[from] InitializationError),

    /// A send failed; the connection has been closed.
    #[error("Synthesis connection error: {0}")]
    Connection(#[from] ConnectionError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// What `speak` did with the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Clear, Speak and Flush were sent.
    Sent,
    /// Speaking is disabled; nothing was sent.
    Muted,
    /// The session is not ready; nothing was sent.
    NotConnected,
    /// The text was empty or whitespace; nothing was sent.
    Empty,
}

// =============================================================================
// TtsSession
// =============================================================================

struct SessionOptions {
    receive_timeout: Duration,
    receiver_join_timeout: Duration,
    settle_timeout: Duration,
    clear_ack_timeout: Duration,
    allow_degraded_playback: bool,
}

pub struct TtsSession {
    config: ClientConfig,
    options: SessionOptions,
    connection: Arc<SynthesisConnection>,
    buffer: Arc<PlaybackBuffer>,
    engine: Arc<PlaybackEngine>,
    speaking_enabled: AtomicBool,
    cancel: parking_lot::Mutex<CancellationToken>,
    receiver: Mutex<Option<JoinHandle<ReceiverReport>>>,
    /// Liveness flag of the current receiver; replaced on each initialize.
    receiver_running: parking_lot::Mutex<Arc<AtomicBool>>,
    /// Keeps the Clear/Speak/Flush triple of one `speak` contiguous.
    speak_lock: Mutex<()>,
    lifecycle: Mutex<()>,
}

impl TtsSession {
    /// Create a session that plays through the system audio output.
    pub fn new(config: ClientConfig) -> Self {
        let backend = Arc::new(RodioBackend::new(config.output_device.clone()));
        Self::with_backend(config, backend)
    }

    /// Create a session that plays through `backend`.
    pub fn with_backend(config: ClientConfig, backend: Arc<dyn OutputBackend>) -> Self {
        let buffer = Arc::new(match config.max_buffered_chunks {
            Some(cap) => PlaybackBuffer::with_soft_cap(cap),
            None => PlaybackBuffer::new(),
        });
        let engine = Arc::new(
            PlaybackEngine::new(backend, config.audio_format(), buffer.clone())
                .with_timing(config.poll_interval(), config.playback_join_timeout()),
        );
        let connection = Arc::new(SynthesisConnection::new(config.connection_options()));
        let options = SessionOptions {
            receive_timeout: config.receive_timeout(),
            receiver_join_timeout: config.receiver_join_timeout(),
            settle_timeout: config.settle_timeout(),
            clear_ack_timeout: config.clear_ack_timeout(),
            allow_degraded_playback: config.allow_degraded_playback,
        };

        Self {
            config,
            options,
            connection,
            buffer,
            engine,
            speaking_enabled: AtomicBool::new(true),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            receiver: Mutex::new(None),
            receiver_running: parking_lot::Mutex::new(Arc::new(AtomicBool::new(false))),
            speak_lock: Mutex::new(()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Initialize using the endpoint and token from the session's configuration.
    pub async fn initialize_from_config(&self) -> SessionResult<()> {
        let url = self
            .config
            .endpoint_url()
            .map_err(InitializationError::from)?;
        let token = Zeroizing::new(
            self.config
                .require_auth_token()
                .map_err(InitializationError::from)?
                .to_string(),
        );
        self.initialize(url.as_str(), &token).await
    }

    /// Connect, start playback and spawn the receiver.
    ///
    /// A no-op when the session is already ready. A receiver left over from
    /// a connection that has since died is cancelled and the stale
    /// connection closed first.
    pub async fn initialize(&self, url: &str, token: &str) -> SessionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_ready() {
            warn!("Session already initialized, ignoring initialize");
            return Ok(());
        }

        let stale = self.receiver.lock().await.take();
        if let Some(stale) = stale {
            warn!("Replacing a receiver left over from a previous connection");
            self.cancel.lock().cancel();
            self.join_receiver(stale).await;
            self.connection.disconnect().await;
        }

        let cancel = {
            let mut current = self.cancel.lock();
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };

        self.connection
            .connect(url, token)
            .await
            .map_err(InitializationError::from)?;
        // Acknowledgements owed by a previous connection will never arrive.
        self.buffer.release_hold();

        if let Err(e) = self.engine.start(&cancel).await {
            if self.options.allow_degraded_playback {
                warn!("Audio output unavailable, continuing without playback: {}", e);
            } else {
                error!("Audio output unavailable, rolling back initialization: {}", e);
                self.connection.disconnect().await;
                return Err(InitializationError::from(e).into());
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        *self.receiver_running.lock() = running.clone();

        let receiver = ReceiverLoop::new(
            self.connection.clone(),
            self.buffer.clone(),
            self.engine.clone(),
            cancel,
            running,
        )
        .with_receive_timeout(self.options.receive_timeout);
        *self.receiver.lock().await = Some(tokio::spawn(receiver.run()));

        info!("TTS session initialized");
        Ok(())
    }

    /// Speak `text`, superseding whatever is currently playing.
    pub async fn speak(&self, text: &str) -> SessionResult<SpeakOutcome> {
        let preview = preview(text);

        if !self.is_ready() {
            warn!(text = %preview, "Cannot speak: session is not connected");
            return Ok(SpeakOutcome::NotConnected);
        }
        if !self.is_speaking_enabled() {
            debug!(text = %preview, "Speaking disabled, skipping");
            return Ok(SpeakOutcome::Muted);
        }
        if text.trim().is_empty() {
            debug!("Ignoring empty text");
            return Ok(SpeakOutcome::Empty);
        }

        let _speak = self.speak_lock.lock().await;

        // Audio of the previous utterance may still be in transit; discard
        // everything until the service confirms this Clear.
        self.buffer.hold_for_clear(self.options.clear_ack_timeout);
        let cleared = self.buffer.clear_and_settle(self.options.settle_timeout);
        if !cleared.settled {
            warn!(
                settle_timeout_ms = self.options.settle_timeout.as_millis() as u64,
                "Previous chunk still playing after clear"
            );
        }
        debug!(discarded = cleared.discarded, "Playback buffer cleared");

        for frame in [
            OutboundFrame::Clear,
            OutboundFrame::speak(text),
            OutboundFrame::Flush,
        ] {
            if let Err(e) = self.connection.send(&frame).await {
                error!(frame = frame.kind(), "Send failed, closing connection: {}", e);
                self.connection.disconnect().await;
                self.buffer.release_hold();
                return Err(e.into());
            }
        }

        info!(text = %preview, "Speaking");
        Ok(SpeakOutcome::Sent)
    }

    /// Enable or disable speaking. Applies from the next `speak`; audio
    /// already buffered keeps playing.
    pub fn set_speaking_enabled(&self, enabled: bool) {
        let previous = self.speaking_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "Speaking toggled");
        }
    }

    pub fn is_speaking_enabled(&self) -> bool {
        self.speaking_enabled.load(Ordering::SeqCst)
    }

    /// Stop everything and release the connection and device. Idempotent.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        self.cancel.lock().cancel();

        let handle = self.receiver.lock().await.take();
        if let Some(handle) = handle {
            self.join_receiver(handle).await;
        }

        self.connection.disconnect().await;
        self.engine.stop().await;
        self.buffer.clear();
        self.buffer.release_hold();
        self.receiver_running.lock().store(false, Ordering::SeqCst);

        debug!("TTS session shut down");
    }

    /// Connected and the receiver is running.
    pub fn is_ready(&self) -> bool {
        self.connection.is_connected() && self.receiver_running.lock().load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_playback_active(&self) -> bool {
        self.engine.is_active()
    }

    /// Chunks written to the output device since the session was created.
    pub fn chunks_played(&self) -> u64 {
        self.engine.chunks_written()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn join_receiver(&self, mut handle: JoinHandle<ReceiverReport>) {
        match tokio::time::timeout(self.options.receiver_join_timeout, &mut handle).await {
            Ok(Ok(report)) => debug!(
                exit = ?report.exit,
                chunks = report.stats.chunks,
                dropped = report.stats.dropped,
                held = report.stats.held,
                malformed = report.stats.malformed,
                "Receiver joined"
            ),
            Ok(Err(e)) => error!("Receiver task failed: {}", e),
            Err(_) => warn!(
                timeout_ms = self.options.receiver_join_timeout.as_millis() as u64,
                "Receiver did not stop in time; detaching it"
            ),
        }
    }
}

impl Drop for TtsSession {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
    }
}

/// First characters of `text` for logging.
fn preview(text: &str) -> String {
    match text.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
