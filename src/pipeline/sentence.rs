//! Splits a generated token stream into speakable sentences

use super::types::SentenceChunk;

/// Characters that end a sentence (CJK and Latin punctuation, newline)
pub const TERMINATORS: [char; 7] = ['。', '！', '？', '.', '!', '?', '\n'];

/// Whether `c` ends a sentence
#[must_use]
pub fn is_terminator(c: char) -> bool {
    TERMINATORS.contains(&c)
}

/// Buffers token fragments and cuts them at sentence terminators
///
/// Terminators stay attached to the sentence they close and nothing is
/// trimmed, so concatenating every emitted chunk reproduces the input.
/// The sentence sequence keeps counting across responses; only the text
/// buffer is reset by [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    next_sequence: u64,
}

impl SentenceSegmenter {
    /// Create an empty segmenter
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: String::new(),
            next_sequence: 0,
        }
    }

    /// Append a fragment and return every sentence it completes
    pub fn feed(&mut self, fragment: &str) -> Vec<SentenceChunk> {
        // Older buffer content holds no terminator, only the new region is scanned
        let mut scan_from = self.buffer.len();
        self.buffer.push_str(fragment);

        let mut chunks = Vec::new();
        while let Some((offset, c)) = self.buffer[scan_from..]
            .char_indices()
            .find(|&(_, c)| is_terminator(c))
        {
            let end = scan_from + offset + c.len_utf8();
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            chunks.push(self.chunk(sentence));
            scan_from = 0;
        }

        chunks
    }

    /// Flush the unterminated remainder, if any, and reset for the next response
    pub fn finish(&mut self) -> Option<SentenceChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(self.chunk(rest))
    }

    /// Drop the buffered remainder without emitting it
    pub fn discard(&mut self) {
        self.buffer.clear();
    }

    /// Text waiting for a terminator
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn chunk(&mut self, text: String) -> SentenceChunk {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::trace!(sequence, len = text.len(), "sentence segmented");
        SentenceChunk { sequence, text }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_all(fragments: &[&str]) -> Vec<SentenceChunk> {
        let mut segmenter = SentenceSegmenter::new();
        let mut out: Vec<SentenceChunk> = fragments
            .iter()
            .flat_map(|f| segmenter.feed(f))
            .collect();
        out.extend(segmenter.finish());
        out
    }

    #[test]
    fn test_sentence_spans_fragments() {
        let chunks = segment_all(&["Hi", " there."]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hi there.");
        assert_eq!(chunks[0].sequence, 0);
    }

    #[test]
    fn test_multiple_terminators_in_one_fragment() {
        let mut segmenter = SentenceSegmenter::new();
        let chunks = segmenter.feed("One. Two! Three");
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["One.", " Two!"]);
        assert_eq!(segmenter.pending(), " Three");
    }

    #[test]
    fn test_cjk_terminators() {
        let chunks = segment_all(&["你好。", "今天怎么样？", "很好！还有"]);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["你好。", "今天怎么样？", "很好！", "还有"]);
    }

    #[test]
    fn test_newline_is_terminator() {
        let chunks = segment_all(&["line one\nline", " two"]);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["line one\n", "line two"]);
    }

    #[test]
    fn test_concatenation_reproduces_stream() {
        let streams: [&[&str]; 4] = [
            &["Hello", ", world", ". How", " are you", "?\n", "Fine", "."],
            &["no terminator at all"],
            &["...", "!!", "?"],
            &["混合 mixed。", "text? ", "end"],
        ];
        for fragments in streams {
            let joined: String = segment_all(fragments).into_iter().map(|c| c.text).collect();
            assert_eq!(joined, fragments.concat());
        }
    }

    #[test]
    fn test_finish_resets_buffer_and_sequence_keeps_counting() {
        let mut segmenter = SentenceSegmenter::new();
        assert!(segmenter.feed("First reply").is_empty());
        let flushed = segmenter.finish().unwrap();
        assert_eq!(flushed.text, "First reply");
        assert_eq!(segmenter.finish(), None);

        let next = segmenter.feed("Second.");
        assert_eq!(next[0].sequence, flushed.sequence + 1);
    }

    #[test]
    fn test_empty_fragment() {
        let mut segmenter = SentenceSegmenter::new();
        assert!(segmenter.feed("").is_empty());
        assert_eq!(segmenter.finish(), None);
    }
}
