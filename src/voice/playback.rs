//! Audio playback to speakers

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig};

use crate::{Error, Result};

/// Device that plays one encoded clip at a time
///
/// `play` blocks until the clip has finished sounding, so a caller looping
/// over clips never overlaps them.
pub trait AudioOutput: Send {
    /// Decode and play a WAV or MP3 clip to completion
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    fn play(&mut self, clip: &[u8]) -> Result<()>;
}

/// Plays audio to the output device that was default when it was created
///
/// The device handle lives as long as the playback; dropping it releases
/// the device.
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
}

impl AudioPlayback {
    /// Create a new audio playback instance
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no output device can be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        if supported.sample_format() != cpal::SampleFormat::F32 {
            tracing::debug!(format = ?supported.sample_format(), "output device prefers non-f32 samples");
        }

        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { device, config })
    }

    /// Output sample rate of the device
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Play mono f32 samples recorded at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if resampling or playback fails
    pub fn play_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        let device_rate = self.sample_rate();
        if sample_rate == device_rate {
            self.play_samples_blocking(samples.to_vec())
        } else {
            let resampled = resample_audio(samples, sample_rate, device_rate)?;
            self.play_samples_blocking(resampled)
        }
    }

    /// Play samples in a blocking manner
    fn play_samples_blocking(&self, samples: Vec<f32>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let config = self.config.clone();
        let channels = config.channels as usize;
        let sample_count = samples.len();

        let cursor = Arc::new(Mutex::new((samples, 0usize)));
        let callback_cursor = Arc::clone(&cursor);
        let (done_tx, done_rx) = std_mpsc::sync_channel::<()>(1);

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut guard) = callback_cursor.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    let (samples, pos) = &mut *guard;

                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(*pos).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        if *pos < samples.len() {
                            *pos += 1;
                        }
                    }

                    if *pos >= samples.len() {
                        // Full channel: completion was already signalled
                        let _ = done_tx.try_send(());
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms =
            (sample_count as u64 * 1000) / u64::from(self.config.sample_rate.0.max(1));
        let timeout = Duration::from_millis(duration_ms + 500);

        if done_rx.recv_timeout(timeout).is_err() {
            tracing::warn!(samples = sample_count, "playback did not signal completion in time");
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        Ok(())
    }
}

impl AudioOutput for AudioPlayback {
    fn play(&mut self, clip: &[u8]) -> Result<()> {
        let (samples, sample_rate) = decode_clip(clip)?;
        self.play_samples(&samples, sample_rate)
    }
}

/// Decode a WAV or MP3 clip to mono f32 samples and its sample rate
///
/// # Errors
///
/// Returns `Malformed` if the bytes are neither WAV nor MP3
pub fn decode_clip(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

/// Decode WAV bytes to mono f32 samples
#[allow(clippy::cast_precision_loss)]
fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::Malformed(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Malformed(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Malformed(format!("WAV decode error: {e}")))?
        }
    };

    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                let rate = frame.sample_rate as u32;
                sample_rate.get_or_insert(rate);

                let frame_samples: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&frame_samples, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Malformed(format!("MP3 decode error: {e}"))),
        }
    }

    let sample_rate =
        sample_rate.ok_or_else(|| Error::Malformed("clip contains no audio frames".to_string()))?;
    Ok((samples, sample_rate))
}

/// Average interleaved channels down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample audio using rubato
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let mut output = Vec::new();

    for chunk in samples.chunks(chunk_size) {
        // Zero-pad the tail so the last partial chunk is not lost
        let mut block: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        block.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let expected = (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).ceil() as usize;
    output.truncate(expected);

    Ok(output.iter().map(|&s| s as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::pcm_to_wav;

    #[test]
    fn test_playback_owns_its_device_across_threads() {
        // The sink moves the output onto the blocking pool for every clip
        fn assert_output<T: AudioOutput + 'static>() {}
        assert_output::<AudioPlayback>();
    }

    #[test]
    fn test_decode_wav_clip() {
        let pcm: Vec<u8> = [0i16, 16384, -16384, 32767]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let wav = pcm_to_wav(&pcm, 32000).unwrap();

        let (samples, rate) = decode_clip(&wav).unwrap();
        assert_eq!(rate, 32000);
        assert_eq!(samples.len(), 4);
        assert!((samples[1] - 0.5).abs() < 0.001);
        assert!((samples[2] + 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = decode_clip(b"definitely not audio").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_length() {
        let samples = vec![0.1f32; 3000];
        let out = resample_audio(&samples, 16000, 48000).unwrap();
        assert_eq!(out.len(), 9000);

        let same = resample_audio(&samples, 16000, 16000).unwrap();
        assert_eq!(same.len(), 3000);
    }
}
