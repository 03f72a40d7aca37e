//! Audio capture from microphone

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per captured sample (16-bit signed little-endian)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Longest a single `read` waits for the device to fill the request
const READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Unread audio kept when the reader falls behind (5 seconds)
const MAX_BUFFERED_BYTES: usize = SAMPLE_RATE as usize * BYTES_PER_SAMPLE * 5;

/// Size in bytes of a PCM frame lasting `frame_ms`
#[must_use]
pub const fn frame_bytes(frame_ms: u32) -> usize {
    (SAMPLE_RATE as usize * frame_ms as usize / 1000) * BYTES_PER_SAMPLE
}

/// Source of 16 kHz mono 16-bit little-endian PCM
///
/// Implementations own their input device exclusively between `start` and
/// `stop`. Both calls are idempotent.
pub trait AudioSource {
    /// Open the device and begin capturing
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no input device supports the format
    fn start(&mut self) -> Result<()>;

    /// Return up to `n` captured bytes, or nothing when not capturing
    fn read(&mut self, n: usize) -> Vec<u8>;

    /// Close the device
    fn stop(&mut self);

    /// Whether the device is open
    fn is_capturing(&self) -> bool;
}

/// PCM captured by the device callback, waiting to be read
///
/// Holds at most `capacity` bytes; when the reader stalls the oldest audio
/// is discarded.
struct CaptureBuffer {
    pcm: Mutex<VecDeque<u8>>,
    filled: Condvar,
    capacity: usize,
    overflowing: AtomicBool,
}

impl CaptureBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            pcm: Mutex::new(VecDeque::new()),
            filled: Condvar::new(),
            capacity,
            overflowing: AtomicBool::new(false),
        }
    }

    /// Append device samples converted to i16 LE
    fn append(&self, data: &[f32]) {
        let mut pcm = self.pcm.lock().unwrap_or_else(PoisonError::into_inner);
        for &sample in data {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            pcm.extend(sample_i16.to_le_bytes());
        }

        let excess = pcm.len().saturating_sub(self.capacity);
        if excess > 0 {
            pcm.drain(..excess);
            if !self.overflowing.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    capacity = self.capacity,
                    "capture reader falling behind, dropping oldest audio"
                );
            }
        } else {
            self.overflowing.store(false, Ordering::Relaxed);
        }
        drop(pcm);
        self.filled.notify_all();
    }
}

/// Captures audio from the first input device supporting 16 kHz mono
pub struct AudioCapture {
    buffer: Arc<CaptureBuffer>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Create a capture instance; the device is opened by `start`
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(CaptureBuffer::with_capacity(MAX_BUFFERED_BYTES)),
            stream: None,
        }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    /// Clear the audio buffer
    pub fn clear_buffer(&self) {
        self.buffer
            .pcm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Find an input device with a mono 16 kHz configuration, default device first
fn open_input() -> Result<(Device, StreamConfig)> {
    let host = cpal::default_host();
    let candidates = host
        .default_input_device()
        .into_iter()
        .chain(host.input_devices().into_iter().flatten());

    for device in candidates {
        let Ok(mut configs) = device.supported_input_configs() else {
            continue;
        };
        let supported = configs.find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        });
        if let Some(supported) = supported {
            let config = supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config();
            tracing::debug!(
                device = device.name().unwrap_or_default(),
                sample_rate = SAMPLE_RATE,
                channels = config.channels,
                "audio capture device selected"
            );
            return Ok((device, config));
        }
    }

    Err(Error::DeviceUnavailable(
        "no input device supports 16 kHz mono capture".to_string(),
    ))
}

impl AudioSource for AudioCapture {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let (device, config) = open_input()?;
        let buffer = Arc::clone(&self.buffer);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| buffer.append(data),
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        self.clear_buffer();
        self.stream = Some(stream);

        tracing::info!("audio capture started");
        Ok(())
    }

    fn read(&mut self, n: usize) -> Vec<u8> {
        if self.stream.is_none() || n == 0 {
            return Vec::new();
        }

        let deadline = Instant::now() + READ_TIMEOUT;
        let mut pcm = self
            .buffer
            .pcm
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while pcm.len() < n {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(available = pcm.len(), requested = n, "audio capture read timed out");
                break;
            }
            pcm = self
                .buffer
                .filled
                .wait_timeout(pcm, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let take = n.min(pcm.len());
        pcm.drain(..take).collect()
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.clear_buffer();
            tracing::info!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wrap 16-bit little-endian PCM in a WAV container for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for bytes in pcm.chunks_exact(BYTES_PER_SAMPLE) {
            writer
                .write_sample(i16::from_le_bytes([bytes[0], bytes[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
