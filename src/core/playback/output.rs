//! Audio output devices.
//!
//! The engine never talks to an audio API directly. It opens a writer
//! through an [`OutputBackend`] on its drain thread and pushes raw PCM16
//! frames into it. Output streams are `!Send` on several platforms, which is
//! why the backend (the factory) must be `Send + Sync` while the writer it
//! returns stays on the thread that opened it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info, warn};

use super::{PlaybackError, PlaybackResult};

/// Default output sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default output channel count.
pub const DEFAULT_CHANNELS: u16 = 1;

/// Default chunk size in bytes, matching the frames the service produces.
pub const DEFAULT_CHUNK_SIZE: usize = 8_000;

/// How often a blocked write re-checks whether it has been interrupted.
const WRITE_POLL_INTERVAL: Duration = Duration::from_millis(5);

// =============================================================================
// AudioFormat
// =============================================================================

/// Output format. Samples are always signed 16-bit little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Largest write handed to the device, in bytes. Longer chunks are
    /// queued in pieces of this size, which bounds how much audio the device
    /// holds ahead of an interrupt.
    pub chunk_size: usize,
}

impl AudioFormat {
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * Self::BYTES_PER_SAMPLE
    }

    /// Playback duration of `bytes` of audio in this format.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let rate = self.bytes_per_second().max(1);
        Duration::from_secs_f64(bytes as f64 / rate as f64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// What a write did with its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole chunk was handed to the device.
    Written,
    /// The write was interrupted and the rest of the chunk discarded.
    Interrupted,
}

/// Factory for output writers. Shared across threads.
pub trait OutputBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open the device at `format`. Called on the drain thread.
    fn open(&self, format: &AudioFormat) -> PlaybackResult<Box<dyn AudioWriter>>;
}

/// An open output device. Lives on the thread that opened it.
pub trait AudioWriter {
    /// Write one chunk of PCM16 audio, blocking while the device is saturated.
    ///
    /// `interrupted` is polled while blocked; when it returns true the writer
    /// discards whatever it still has queued and returns
    /// [`WriteOutcome::Interrupted`].
    fn write(
        &mut self,
        pcm: &[u8],
        interrupted: &dyn Fn() -> bool,
    ) -> PlaybackResult<WriteOutcome>;

    /// Drop audio the device has accepted but not yet played.
    fn interrupt(&mut self) {}

    /// Release the device.
    fn close(&mut self) {}
}

// =============================================================================
// rodio backend
// =============================================================================

/// Output through the system audio stack via `rodio`.
#[derive(Debug, Clone, Default)]
pub struct RodioBackend {
    /// Output device name; `None` selects the host default.
    device: Option<String>,
}

impl RodioBackend {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    fn open_stream(&self) -> PlaybackResult<(OutputStream, OutputStreamHandle)> {
        let Some(wanted) = self.device.as_deref() else {
            return OutputStream::try_default()
                .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()));
        };

        let host = rodio::cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
        for device in devices {
            if device.name().is_ok_and(|name| name == wanted) {
                return OutputStream::try_from_device(&device)
                    .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()));
            }
        }
        Err(PlaybackError::DeviceUnavailable(format!(
            "no output device named '{wanted}'"
        )))
    }
}

impl OutputBackend for RodioBackend {
    fn name(&self) -> &str {
        "rodio"
    }

    fn open(&self, format: &AudioFormat) -> PlaybackResult<Box<dyn AudioWriter>> {
        let (stream, handle) = self.open_stream()?;
        let sink =
            Sink::try_new(&handle).map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;

        info!(
            device = self.device.as_deref().unwrap_or("default"),
            sample_rate = format.sample_rate,
            channels = format.channels,
            chunk_size = format.chunk_size,
            "Audio output opened"
        );

        Ok(Box::new(RodioWriter {
            _stream: stream,
            handle,
            sink: Some(sink),
            format: *format,
            carry: None,
        }))
    }
}

/// Writer backed by a rodio `Sink`.
///
/// Each chunk is appended in pieces of at most `chunk_size` bytes, and the
/// next piece waits until at most one is still queued ahead of it, so the
/// device never runs far ahead of the buffer and a barge-in only has to
/// discard a single piece.
struct RodioWriter {
    /// Must stay alive for the sink to produce sound.
    _stream: OutputStream,
    handle: OutputStreamHandle,
    /// `None` once the sink could not be recreated after an interrupt.
    sink: Option<Sink>,
    format: AudioFormat,
    /// Odd trailing byte carried to the next chunk.
    carry: Option<u8>,
}

impl RodioWriter {
    fn samples(&mut self, pcm: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(pcm.len() / 2 + 1);
        let mut rest = pcm;
        if let Some(low) = self.carry.take() {
            if let Some((&high, tail)) = rest.split_first() {
                samples.push(i16::from_le_bytes([low, high]));
                rest = tail;
            } else {
                self.carry = Some(low);
            }
        }
        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|b| i16::from_le_bytes([b[0], b[1]])));
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }
        samples
    }
}

impl AudioWriter for RodioWriter {
    fn write(
        &mut self,
        pcm: &[u8],
        interrupted: &dyn Fn() -> bool,
    ) -> PlaybackResult<WriteOutcome> {
        let samples = self.samples(pcm);

        for piece in device_pieces(&samples, &self.format) {
            if interrupted() {
                self.interrupt();
                return Ok(WriteOutcome::Interrupted);
            }
            let Some(sink) = self.sink.as_ref() else {
                return Err(PlaybackError::DeviceWrite(
                    "output sink is no longer available".to_string(),
                ));
            };
            sink.append(rodio::buffer::SamplesBuffer::new(
                self.format.channels,
                self.format.sample_rate,
                piece.to_vec(),
            ));

            while self.sink.as_ref().is_some_and(|sink| sink.len() > 1) {
                if interrupted() {
                    self.interrupt();
                    return Ok(WriteOutcome::Interrupted);
                }
                thread::sleep(WRITE_POLL_INTERVAL);
            }
        }
        Ok(WriteOutcome::Written)
    }

    fn interrupt(&mut self) {
        self.carry = None;
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        match Sink::try_new(&self.handle) {
            Ok(sink) => {
                debug!("Output interrupted, fresh sink created");
                self.sink = Some(sink);
            }
            Err(e) => warn!("Failed to recreate output sink after interrupt: {}", e),
        }
    }

    fn close(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        debug!("Audio output closed");
    }
}

/// Split `samples` into device writes of at most `format.chunk_size` bytes,
/// keeping every piece a whole number of frames.
fn device_pieces<'a>(samples: &'a [i16], format: &AudioFormat) -> std::slice::Chunks<'a, i16> {
    let frame = format.channels.max(1) as usize;
    let per_piece = format.chunk_size / AudioFormat::BYTES_PER_SAMPLE;
    let per_piece = (per_piece / frame).max(1) * frame;
    samples.chunks(per_piece)
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Output that records every chunk instead of playing it.
///
/// Useful for headless runs and tests. Chunks are recorded whole, whatever
/// the format's `chunk_size`. With a write delay set, each write blocks like
/// a real device would for that long; a chunk interrupted during the delay
/// is not recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_open: bool,
    write_delay: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose device can never be opened.
    pub fn unavailable() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Every chunk written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }
}

impl OutputBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, _format: &AudioFormat) -> PlaybackResult<Box<dyn AudioWriter>> {
        if self.fail_open {
            return Err(PlaybackError::DeviceUnavailable(
                "memory backend configured as unavailable".to_string(),
            ));
        }
        Ok(Box::new(MemoryWriter {
            written: self.written.clone(),
            write_delay: self.write_delay,
        }))
    }
}

struct MemoryWriter {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    write_delay: Duration,
}

impl AudioWriter for MemoryWriter {
    fn write(
        &mut self,
        pcm: &[u8],
        interrupted: &dyn Fn() -> bool,
    ) -> PlaybackResult<WriteOutcome> {
        let mut remaining = self.write_delay;
        while !remaining.is_zero() {
            if interrupted() {
                return Ok(WriteOutcome::Interrupted);
            }
            let step = remaining.min(WRITE_POLL_INTERVAL);
            thread::sleep(step);
            remaining -= step;
        }
        if interrupted() {
            return Ok(WriteOutcome::Interrupted);
        }
        self.written.lock().push(pcm.to_vec());
        Ok(WriteOutcome::Written)
    }
}
