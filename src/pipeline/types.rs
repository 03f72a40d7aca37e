//! Units of work flowing between pipeline stages

/// Complete utterance cut out of the microphone stream by the segmenter
///
/// `audio` holds the concatenated active frames as 16 kHz mono 16-bit
/// little-endian PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Position in the utterance stream, assigned at segmentation
    pub sequence: u64,
    /// Raw PCM bytes
    pub audio: Vec<u8>,
}

impl Utterance {
    /// Number of 16-bit samples in the utterance
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.audio.len() / 2
    }
}

/// Recognized text for one utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    /// Sequence of the utterance this text came from
    pub sequence: u64,
    /// Recognized text (may be empty or noise)
    pub text: String,
}

/// One sentence cut out of a generated token stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceChunk {
    /// Position in the sentence stream, assigned at segmentation
    pub sequence: u64,
    /// Sentence text including its terminator
    pub text: String,
}

/// Synthesized audio for one sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// Sequence of the sentence this clip was synthesized from
    pub sequence: u64,
    /// Encoded audio (WAV or MP3) as returned by the synthesis backend
    pub data: Vec<u8>,
}
