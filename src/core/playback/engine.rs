//! Playback engine: owns the output device and drains the playback buffer.
//!
//! The device is opened and used on a dedicated OS thread. Output handles are
//! `!Send` on some platforms and device writes block, so neither belongs on
//! the async runtime. The thread reports the result of opening the device
//! through a oneshot channel, then loops:
//!
//! ```text
//! pop(poll) ──▶ chunk ──▶ write ──▶ release ──┐
//!    │                                         │
//!    └─▶ empty ──▶ cancelled? ──▶ exit         │
//!    ▲─────────────────────────────────────────┘
//! ```
//!
//! Cancellation is cooperative. `stop()` cancels the engine's token and
//! waits a bounded time for the thread to notice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::buffer::{PlaybackBuffer, Popped};
use super::output::{AudioFormat, AudioWriter, OutputBackend, WriteOutcome};
use super::{PlaybackError, PlaybackResult};

/// How long the drain loop waits on an empty buffer before re-checking
/// cancellation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for the drain thread during `stop()`.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

struct DrainHandle {
    cancel: CancellationToken,
    thread: thread::JoinHandle<()>,
    done: oneshot::Receiver<()>,
}

/// State shared between the engine and its drain thread.
struct DrainShared {
    buffer: Arc<PlaybackBuffer>,
    cancel: CancellationToken,
    poll_interval: Duration,
    active: Arc<AtomicBool>,
    device_unavailable: Arc<AtomicBool>,
    chunks_written: Arc<AtomicU64>,
}

/// Owns the output device and the drain thread.
pub struct PlaybackEngine {
    backend: Arc<dyn OutputBackend>,
    format: AudioFormat,
    buffer: Arc<PlaybackBuffer>,
    poll_interval: Duration,
    join_timeout: Duration,
    drain: Mutex<Option<DrainHandle>>,
    active: Arc<AtomicBool>,
    device_unavailable: Arc<AtomicBool>,
    chunks_written: Arc<AtomicU64>,
}

impl PlaybackEngine {
    pub fn new(
        backend: Arc<dyn OutputBackend>,
        format: AudioFormat,
        buffer: Arc<PlaybackBuffer>,
    ) -> Self {
        Self {
            backend,
            format,
            buffer,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            drain: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            device_unavailable: Arc::new(AtomicBool::new(false)),
            chunks_written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, join_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.join_timeout = join_timeout;
        self
    }

    /// Open the device and start draining. No-op if already running.
    ///
    /// The drain thread listens on a child of `parent`, so cancelling the
    /// session also stops playback.
    pub async fn start(&self, parent: &CancellationToken) -> PlaybackResult<()> {
        let mut drain = self.drain.lock().await;

        if let Some(handle) = drain.as_ref() {
            if self.is_active() && !handle.cancel.is_cancelled() {
                debug!("Playback engine already started");
                return Ok(());
            }
        }
        // Reap a thread that ended on its own (device failure or cancellation).
        if let Some(stale) = drain.take() {
            stale.cancel.cancel();
            let _ = tokio::time::timeout(self.join_timeout, stale.done).await;
            if stale.thread.is_finished() {
                let _ = stale.thread.join();
            }
        }

        let cancel = parent.child_token();
        let (init_tx, init_rx) = oneshot::channel::<PlaybackResult<()>>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let backend = self.backend.clone();
        let format = self.format;
        let shared = DrainShared {
            buffer: self.buffer.clone(),
            cancel: cancel.clone(),
            poll_interval: self.poll_interval,
            active: self.active.clone(),
            device_unavailable: self.device_unavailable.clone(),
            chunks_written: self.chunks_written.clone(),
        };

        let thread = thread::Builder::new()
            .name("waav-playback".into())
            .spawn(move || {
                let mut writer = match backend.open(&format) {
                    Ok(writer) => writer,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                shared.active.store(true, Ordering::SeqCst);
                shared.device_unavailable.store(false, Ordering::SeqCst);
                if init_tx.send(Ok(())).is_err() {
                    // Caller went away before we finished opening.
                    shared.active.store(false, Ordering::SeqCst);
                    writer.close();
                    return;
                }

                drain_loop(writer.as_mut(), &shared);

                writer.close();
                shared.active.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            })?;

        match init_rx.await {
            Ok(Ok(())) => {
                info!(backend = self.backend.name(), "Playback engine started");
                *drain = Some(DrainHandle {
                    cancel,
                    thread,
                    done: done_rx,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                self.device_unavailable.store(true, Ordering::SeqCst);
                error!("Failed to open audio output: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                self.device_unavailable.store(true, Ordering::SeqCst);
                Err(PlaybackError::DrainThreadDied)
            }
        }
    }

    /// Stop draining, close the device and drop residual chunks. Idempotent.
    pub async fn stop(&self) {
        let handle = self.drain.lock().await.take();

        if let Some(DrainHandle {
            cancel,
            thread,
            done,
        }) = handle
        {
            cancel.cancel();
            match tokio::time::timeout(self.join_timeout, done).await {
                Ok(_) => {
                    if thread.join().is_err() {
                        error!("Playback thread panicked");
                    }
                    info!("Playback engine stopped");
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.join_timeout.as_millis() as u64,
                        "Playback thread did not exit in time; detaching it"
                    );
                }
            }
        }

        self.active.store(false, Ordering::SeqCst);
        self.buffer.clear();
    }

    /// True while the device is open and the drain thread is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True after the device failed to open or a write failed.
    pub fn is_device_unavailable(&self) -> bool {
        self.device_unavailable.load(Ordering::SeqCst)
    }

    /// Chunks written whole to the device since the engine was created.
    /// Chunks skipped or cut short by a barge-in are not counted.
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

fn drain_loop(writer: &mut dyn AudioWriter, shared: &DrainShared) {
    debug!("Playback drain loop started");
    let mut last_generation: Option<u64> = None;

    loop {
        if shared.cancel.is_cancelled() {
            debug!("Playback drain loop cancelled");
            break;
        }

        let queued = match shared.buffer.pop(shared.poll_interval) {
            Popped::Chunk(queued) => queued,
            Popped::Empty => continue,
        };

        // First chunk of a newer utterance: drop what the device still holds
        // from the previous one.
        if last_generation.is_some_and(|g| g < queued.generation) {
            writer.interrupt();
        }
        last_generation = Some(queued.generation);

        let buffer = &shared.buffer;
        let cancel = &shared.cancel;
        let generation = queued.generation;
        let interrupted = || cancel.is_cancelled() || buffer.is_stale(generation);

        let result = if interrupted() {
            Ok(WriteOutcome::Interrupted)
        } else {
            writer.write(queued.chunk.as_bytes(), &interrupted)
        };
        shared.buffer.release();

        match result {
            Ok(WriteOutcome::Written) => {
                shared.chunks_written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(WriteOutcome::Interrupted) => {
                trace!(generation, "Stale chunk skipped");
            }
            Err(e) => {
                error!("Audio output write failed, stopping playback: {}", e);
                shared.device_unavailable.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    debug!("Playback drain loop finished");
}
