//! Cancellable FIFO of synthesized audio chunks.
//!
//! The buffer is the only structure shared by the receiver task (producer)
//! and the playback drain thread (consumer). Every operation takes the same
//! lock, so `clear` is serialisable with respect to concurrent `push`/`pop`:
//! once `clear` returns, the queue holds exactly the chunks pushed after it.
//!
//! Each `clear` starts a new *generation*. A popped chunk remembers the
//! generation it was queued in, which lets the writer notice that a barge-in
//! happened while the chunk was being played, and lets the session wait for
//! an in-flight chunk from the previous utterance to be released before it
//! sends anything upstream.
//!
//! Audio of the previous utterance can still be on the wire when the session
//! sends Clear upstream. [`hold_for_clear`] closes the buffer to new chunks
//! until the service acknowledges every pending Clear (or the hold expires),
//! so nothing pushed between the local clear and the acknowledgement reaches
//! the device.
//!
//! [`hold_for_clear`]: PlaybackBuffer::hold_for_clear

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

// =============================================================================
// AudioChunk
// =============================================================================

/// One frame of synthesized PCM16 audio exactly as delivered by the service.
///
/// Chunks are opaque to the client: they are never resegmented or decoded
/// on the way from the socket to the output device.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioChunk(Bytes);

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for AudioChunk {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl fmt::Debug for AudioChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioChunk").field("len", &self.0.len()).finish()
    }
}

// =============================================================================
// Pop results
// =============================================================================

/// A chunk handed to the consumer together with its queue generation.
#[derive(Debug, Clone)]
pub struct QueuedChunk {
    pub chunk: AudioChunk,
    pub generation: u64,
}

/// Outcome of [`PlaybackBuffer::pop`].
///
/// An empty queue is an expected condition, not an error: the consumer uses
/// it to re-check its stop signal.
#[derive(Debug)]
pub enum Popped {
    Chunk(QueuedChunk),
    Empty,
}

/// Outcome of [`PlaybackBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Discarded while waiting for a Clear to be acknowledged.
    Held,
}

/// Outcome of [`PlaybackBuffer::clear_and_settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOutcome {
    /// Chunks removed from the queue.
    pub discarded: usize,
    /// False when a chunk from an older generation was still being written
    /// when the settle bound expired.
    pub settled: bool,
}

// =============================================================================
// PlaybackBuffer
// =============================================================================

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<AudioChunk>,
    generation: u64,
    /// Generation of the chunk the consumer is currently writing, if any.
    in_flight: Option<u64>,
    overflowed: u64,
    /// Clears sent upstream and not yet acknowledged.
    pending_clears: u32,
    hold_deadline: Option<Instant>,
    held: u64,
}

impl BufferState {
    /// True while pushes must be discarded. Expires the hold once its
    /// deadline has passed.
    fn holding(&mut self) -> bool {
        if self.pending_clears == 0 {
            return false;
        }
        if self.hold_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                pending = self.pending_clears,
                "Clear was not acknowledged in time, accepting audio again"
            );
            self.pending_clears = 0;
            self.hold_deadline = None;
            return false;
        }
        true
    }
}

/// Thread-safe playback queue shared by the receiver and the drain thread.
#[derive(Debug, Default)]
pub struct PlaybackBuffer {
    state: Mutex<BufferState>,
    available: Condvar,
    released: Condvar,
    /// Optional soft cap; when reached the oldest queued chunk is dropped.
    max_chunks: Option<usize>,
}

impl PlaybackBuffer {
    /// Create an unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer that drops its oldest chunk once `max_chunks` are queued.
    ///
    /// A cap of zero is treated as unbounded.
    pub fn with_soft_cap(max_chunks: usize) -> Self {
        Self {
            max_chunks: (max_chunks > 0).then_some(max_chunks),
            ..Self::default()
        }
    }

    /// Append a chunk. Never blocks on the consumer.
    ///
    /// The chunk is discarded only while a Clear hold is in place.
    pub fn push(&self, chunk: AudioChunk) -> Pushed {
        let mut state = self.state.lock();
        if state.holding() {
            state.held += 1;
            trace!(len = chunk.len(), "Awaiting clear acknowledgement, chunk discarded");
            return Pushed::Held;
        }
        if let Some(cap) = self.max_chunks {
            while state.queue.len() >= cap {
                state.queue.pop_front();
                state.overflowed += 1;
                trace!(cap, "Playback buffer full, dropped oldest chunk");
            }
        }
        state.queue.push_back(chunk);
        drop(state);
        self.available.notify_one();
        Pushed::Queued
    }

    /// Wait up to `timeout` for the next chunk.
    ///
    /// The returned chunk is marked as in flight until [`release`] is called.
    ///
    /// [`release`]: PlaybackBuffer::release
    pub fn pop(&self, timeout: Duration) -> Popped {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                let generation = state.generation;
                state.in_flight = Some(generation);
                return Popped::Chunk(QueuedChunk { chunk, generation });
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return match state.queue.pop_front() {
                    Some(chunk) => {
                        let generation = state.generation;
                        state.in_flight = Some(generation);
                        Popped::Chunk(QueuedChunk { chunk, generation })
                    }
                    None => Popped::Empty,
                };
            }
        }
    }

    /// Mark the last popped chunk as fully handled by the consumer.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.in_flight.take().is_some() {
            drop(state);
            self.released.notify_all();
        }
    }

    /// Atomically discard every queued chunk and start a new generation.
    ///
    /// Chunks already handed to the consumer are not affected. Returns the
    /// number of chunks discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.generation += 1;
        if discarded > 0 {
            debug!(discarded, generation = state.generation, "Playback buffer cleared");
        }
        discarded
    }

    /// Clear the buffer, then wait up to `bound` for a chunk popped before the
    /// clear to be released by the consumer.
    pub fn clear_and_settle(&self, bound: Duration) -> ClearOutcome {
        let deadline = Instant::now() + bound;
        let mut state = self.state.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.generation += 1;
        let generation = state.generation;
        if discarded > 0 {
            debug!(discarded, generation, "Playback buffer cleared");
        }

        let mut settled = true;
        while state.in_flight.is_some_and(|g| g < generation) {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                settled = !state.in_flight.is_some_and(|g| g < generation);
                break;
            }
        }
        ClearOutcome { discarded, settled }
    }

    /// Discard every push until [`acknowledge_clear`] has been called once
    /// per hold, or until `bound` elapses without an acknowledgement.
    ///
    /// A zero `bound` places no hold.
    ///
    /// [`acknowledge_clear`]: PlaybackBuffer::acknowledge_clear
    pub fn hold_for_clear(&self, bound: Duration) {
        if bound.is_zero() {
            return;
        }
        let mut state = self.state.lock();
        state.pending_clears += 1;
        state.hold_deadline = Some(Instant::now() + bound);
    }

    /// Record that the service confirmed one Clear.
    pub fn acknowledge_clear(&self) {
        let mut state = self.state.lock();
        state.pending_clears = state.pending_clears.saturating_sub(1);
        if state.pending_clears == 0 {
            state.hold_deadline = None;
        }
    }

    /// Drop any hold, e.g. when the connection it was waiting on is gone.
    pub fn release_hold(&self) {
        let mut state = self.state.lock();
        state.pending_clears = 0;
        state.hold_deadline = None;
    }

    /// True while pushes are being discarded awaiting an acknowledgement.
    pub fn is_holding(&self) -> bool {
        self.state.lock().holding()
    }

    /// Chunks discarded by a Clear hold.
    pub fn held(&self) -> u64 {
        self.state.lock().held
    }

    /// True when a clear happened after a chunk of `generation` was popped.
    pub fn is_stale(&self, generation: u64) -> bool {
        self.state.lock().generation != generation
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Chunks dropped because the soft cap was reached.
    pub fn overflowed(&self) -> u64 {
        self.state.lock().overflowed
    }
}
