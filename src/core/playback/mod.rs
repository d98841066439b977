//! Local audio playback: the shared chunk buffer, the engine that drains it
//! and the output devices it writes to.

mod buffer;
mod engine;
mod output;

pub use buffer::{AudioChunk, ClearOutcome, PlaybackBuffer, Popped, Pushed, QueuedChunk};
pub use engine::{DEFAULT_JOIN_TIMEOUT, DEFAULT_POLL_INTERVAL, PlaybackEngine};
pub use output::{
    AudioFormat, AudioWriter, DEFAULT_CHANNELS, DEFAULT_CHUNK_SIZE, DEFAULT_SAMPLE_RATE,
    MemoryBackend, OutputBackend, RodioBackend, WriteOutcome,
};

use thiserror::Error;

/// Errors raised by the playback side.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// The output device could not be opened.
    #[error("Audio output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Writing to an open device failed.
    #[error("Audio output write failed: {0}")]
    DeviceWrite(String),

    /// The drain thread could not be spawned.
    #[error("Failed to spawn playback thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The drain thread exited before reporting whether the device opened.
    #[error("Playback thread died during startup")]
    DrainThreadDied,
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;
