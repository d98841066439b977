//! Receiver loop: reads frames from the synthesis connection and pushes
//! audio into the playback buffer.
//!
//! One loop runs per session, on a tokio task:
//!
//! ```text
//! Starting ──▶ Running ──▶ Stopped
//!    │            │           │
//!  start       receive     stop engine,
//!  engine      dispatch    clear running flag
//! ```
//!
//! The loop never reconnects. Once the stream ends, the session stays
//! not-ready until it is initialised again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::connection::{EndOfStream, Received, SynthesisConnection};
use super::messages::InboundFrame;
use crate::core::playback::{PlaybackBuffer, PlaybackEngine, Pushed};

/// How long each `receive` waits before the loop re-checks cancellation.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverExit {
    /// The session's cancellation token fired.
    Cancelled,
    /// The service closed the stream or the transport dropped.
    StreamEnded(EndOfStream),
    /// Receiving failed, e.g. the connection was torn down underneath us.
    Failed(String),
}

/// Counters collected over the lifetime of one loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub chunks: u64,
    pub bytes: u64,
    pub control_frames: u64,
    pub malformed: u64,
    /// Audio chunks dropped because playback was not active.
    pub dropped: u64,
    /// Audio chunks that arrived while a Clear was still unacknowledged.
    pub held: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub exit: ReceiverExit,
    pub stats: ReceiverStats,
}

pub struct ReceiverLoop {
    connection: Arc<SynthesisConnection>,
    buffer: Arc<PlaybackBuffer>,
    engine: Arc<PlaybackEngine>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    receive_timeout: Duration,
}

impl ReceiverLoop {
    pub fn new(
        connection: Arc<SynthesisConnection>,
        buffer: Arc<PlaybackBuffer>,
        engine: Arc<PlaybackEngine>,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            buffer,
            engine,
            cancel,
            running,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Run until cancelled or the stream ends.
    pub async fn run(self) -> ReceiverReport {
        self.running.store(true, Ordering::SeqCst);

        // ===== Starting =====
        if let Err(e) = self.engine.start(&self.cancel).await {
            warn!("Playback unavailable, incoming audio will be dropped: {}", e);
        }

        // ===== Running =====
        let mut stats = ReceiverStats::default();
        let exit = self.receive_until_done(&mut stats).await;

        // ===== Stopped =====
        self.engine.stop().await;
        self.running.store(false, Ordering::SeqCst);

        match &exit {
            ReceiverExit::Cancelled => info!(
                chunks = stats.chunks,
                bytes = stats.bytes,
                "Receiver stopped"
            ),
            ReceiverExit::StreamEnded(end) => warn!(
                chunks = stats.chunks,
                bytes = stats.bytes,
                "Receiver stopped, synthesis stream ended: {}",
                end
            ),
            ReceiverExit::Failed(reason) => error!(
                chunks = stats.chunks,
                bytes = stats.bytes,
                "Receiver stopped after error: {}",
                reason
            ),
        }

        ReceiverReport { exit, stats }
    }

    async fn receive_until_done(&self, stats: &mut ReceiverStats) -> ReceiverExit {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReceiverExit::Cancelled,
                received = self.connection.receive(self.receive_timeout) => received,
            };

            match received {
                Ok(Received::Audio(chunk)) => {
                    if self.engine.is_active() {
                        let len = chunk.len();
                        match self.buffer.push(chunk) {
                            Pushed::Queued => {
                                stats.chunks += 1;
                                stats.bytes += len as u64;
                                trace!(len, "Audio chunk queued");
                            }
                            Pushed::Held => stats.held += 1,
                        }
                    } else {
                        stats.dropped += 1;
                        trace!(len = chunk.len(), "Playback inactive, audio chunk dropped");
                    }
                }
                Ok(Received::Control(frame)) => {
                    stats.control_frames += 1;
                    if matches!(frame, InboundFrame::Cleared { .. }) {
                        self.buffer.acknowledge_clear();
                    }
                    log_control_frame(&frame);
                }
                Ok(Received::Malformed { raw, reason }) => {
                    stats.malformed += 1;
                    warn!(raw = %truncate(&raw, 200), "Malformed control frame: {}", reason);
                }
                Ok(Received::Timeout) => continue,
                Ok(Received::Closed(end)) => return ReceiverExit::StreamEnded(end),
                Err(e) => return ReceiverExit::Failed(e.to_string()),
            }
        }
    }
}

fn log_control_frame(frame: &InboundFrame) {
    match frame {
        InboundFrame::Metadata(meta) => info!(
            request_id = meta.request_id.as_deref().unwrap_or("-"),
            model = meta.model_name.as_deref().unwrap_or("-"),
            "Synthesis metadata received"
        ),
        InboundFrame::SpeechEnded => info!("Synthesis reported end of speech"),
        InboundFrame::Error {
            err_code,
            description,
        } => error!(
            code = err_code.as_deref().unwrap_or("-"),
            "Synthesis service error: {}", description
        ),
        InboundFrame::Warning {
            warn_code,
            description,
        } => warn!(
            code = warn_code.as_deref().unwrap_or("-"),
            "Synthesis service warning: {}", description
        ),
        InboundFrame::Flushed { sequence_id } => {
            debug!(sequence_id = ?sequence_id, "Synthesis flushed")
        }
        InboundFrame::Cleared { sequence_id } => {
            debug!(sequence_id = ?sequence_id, "Synthesis cleared")
        }
        InboundFrame::Unknown { kind } => debug!(kind = %kind, "Ignoring unknown control frame"),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
