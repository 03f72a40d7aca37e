//! Energy-based voice activity segmentation
//!
//! Classifies fixed-size PCM frames as active or silent and cuts the
//! microphone stream into utterances: the first active frame opens an
//! utterance, a run of silent frames long enough closes it.

use crate::pipeline::Utterance;

/// Normalized RMS energy above which a frame counts as speech
pub const DEFAULT_ACTIVATION_THRESHOLD: f32 = 0.4;

/// Silence that ends an utterance, in milliseconds
pub const DEFAULT_SILENCE_MS: u32 = 1000;

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Waiting for speech
    Silence,
    /// Inside an utterance, buffering active frames
    Speech,
}

/// Transition reported for a processed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadEvent {
    /// First active frame after silence
    SpeechStart,
    /// Silence threshold reached, utterance finalized
    SpeechEnd(Utterance),
}

/// Cuts a frame stream into utterances
pub struct VoiceActivitySegmenter {
    activation_threshold: f32,
    silence_frames: u32,
    state: VadState,
    speech_buffer: Vec<u8>,
    silence_counter: u32,
    next_sequence: u64,
}

impl VoiceActivitySegmenter {
    /// Create a segmenter
    ///
    /// # Arguments
    ///
    /// * `activation_threshold` - normalized energy (0.0..=1.0) above which a frame is active
    /// * `silence_frames` - consecutive silent frames that end an utterance (minimum 1)
    #[must_use]
    pub fn new(activation_threshold: f32, silence_frames: u32) -> Self {
        let silence_frames = silence_frames.max(1);
        tracing::debug!(activation_threshold, silence_frames, "voice activity segmenter initialized");

        Self {
            activation_threshold,
            silence_frames,
            state: VadState::Silence,
            speech_buffer: Vec::new(),
            silence_counter: 0,
            next_sequence: 0,
        }
    }

    /// Create a segmenter from durations
    #[must_use]
    pub fn from_durations(activation_threshold: f32, silence_ms: u32, frame_ms: u32) -> Self {
        Self::new(activation_threshold, silence_frames(silence_ms, frame_ms))
    }

    /// Process one frame of 16-bit little-endian PCM
    pub fn process(&mut self, frame: &[u8]) -> Option<VadEvent> {
        let energy = normalized_energy(frame);
        let is_active = energy > self.activation_threshold;

        match self.state {
            VadState::Silence => {
                if is_active {
                    self.state = VadState::Speech;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(frame);
                    self.silence_counter = 0;
                    tracing::debug!(energy, "speech started");
                    return Some(VadEvent::SpeechStart);
                }
            }
            VadState::Speech => {
                if is_active {
                    self.speech_buffer.extend_from_slice(frame);
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += 1;
                    if self.silence_counter >= self.silence_frames {
                        return Some(VadEvent::SpeechEnd(self.finalize()));
                    }
                }

                tracing::trace!(
                    buffer_len = self.speech_buffer.len(),
                    silence = self.silence_counter,
                    is_active,
                    energy,
                    "speech state"
                );
            }
        }

        None
    }

    fn finalize(&mut self) -> Utterance {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.state = VadState::Silence;
        self.silence_counter = 0;

        let utterance = Utterance {
            sequence,
            audio: std::mem::take(&mut self.speech_buffer),
        };
        tracing::debug!(sequence, bytes = utterance.audio.len(), "speech ended, utterance finalized");
        utterance
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }

    /// Audio buffered for the utterance in progress
    #[must_use]
    pub fn speech_buffer(&self) -> &[u8] {
        &self.speech_buffer
    }

    /// Silent frames that end an utterance
    #[must_use]
    pub const fn silence_frames(&self) -> u32 {
        self.silence_frames
    }

    /// Abandon the utterance in progress; the sequence keeps counting
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_buffer.clear();
        self.silence_counter = 0;
    }
}

/// Number of whole frames that fit in `silence_ms` (at least one)
///
/// A partial trailing frame is not counted, so 1000 ms of 300 ms frames
/// ends an utterance after 3 silent frames.
#[must_use]
pub const fn silence_frames(silence_ms: u32, frame_ms: u32) -> u32 {
    if frame_ms == 0 {
        return 1;
    }
    let frames = silence_ms / frame_ms;
    if frames == 0 { 1 } else { frames }
}

/// RMS energy of 16-bit little-endian PCM, normalized by the largest sample value
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn normalized_energy(frame: &[u8]) -> f32 {
    let count = frame.len() / 2;
    if count == 0 {
        return 0.0;
    }

    let sum_squares: f64 = frame
        .chunks_exact(2)
        .map(|b| {
            let sample = f64::from(i16::from_le_bytes([b[0], b[1]]));
            sample * sample
        })
        .sum();

    #[allow(clippy::cast_possible_truncation)]
    let energy = ((sum_squares / count as f64).sqrt() / f64::from(i16::MAX)) as f32;
    energy
}
