pub mod playback;
pub mod session;
pub mod synthesis;

// Re-export commonly used types for convenience
pub use playback::{
    AudioChunk, AudioFormat, AudioWriter, MemoryBackend, OutputBackend, PlaybackBuffer,
    PlaybackEngine, PlaybackError, PlaybackResult, RodioBackend,
};

pub use synthesis::{
    AuthScheme, ConnectionError, ConnectionResult, ConnectionState, EndOfStream, InboundFrame,
    OutboundFrame, Received, ReceiverExit, ReceiverStats, SynthesisConnection,
};

pub use session::{InitializationError, SessionError, SessionResult, SpeakOutcome, TtsSession};
