//! Voice processing module
//!
//! Audio devices, voice activity segmentation, and the STT/TTS backends
//! the pipeline stages call into.

mod capture;
mod playback;
mod stt;
mod tts;
pub mod vad;

pub use capture::{
    AudioCapture, AudioSource, BYTES_PER_SAMPLE, SAMPLE_RATE, frame_bytes, pcm_to_wav,
};
pub use playback::{AudioOutput, AudioPlayback, decode_clip, resample_audio};
pub use stt::{SpeechRecognizer, WhisperClient};
pub use tts::{SovitsClient, SpeechSynthesizer, VoiceParams};
pub use vad::{VadEvent, VadState, VoiceActivitySegmenter};
