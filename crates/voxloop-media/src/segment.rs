//! Sentence segmentation for incremental synthesis.
//!
//! Reply fragments are cut into synthesizable segments as soon as a
//! fragment ends with sentence or clause punctuation. Cutting on clause
//! punctuation (`,;:` as well as `.!?`) is deliberate: it trades
//! segmentation precision for minimum time-to-first-audio.

/// A span of reply text ready for synthesis. Non-final segments tell the
/// synthesizer more speech of the same utterance follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechSegment {
    pub text: String,
    pub is_final: bool,
}

impl SpeechSegment {
    fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    fn final_segment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// True when the fragment ends with segment-boundary punctuation,
/// optionally followed by whitespace.
fn ends_at_boundary(fragment: &str) -> bool {
    matches!(
        fragment.trim_end().chars().last(),
        Some('.' | '!' | '?' | ',' | ';' | ':')
    )
}

/// Accumulates reply fragments and emits complete segments at detected
/// boundaries. [`finish`] flushes the remainder as the final segment.
///
/// [`finish`]: SentenceSegmenter::finish
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    saw_fragment: bool,
    emitted_segment: bool,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment; returns a segment when the fragment completes
    /// one.
    pub fn push(&mut self, fragment: &str) -> Option<SpeechSegment> {
        self.saw_fragment = true;
        self.buffer.push_str(fragment);

        if !ends_at_boundary(fragment) {
            return None;
        }

        let text = self.buffer.trim();
        if text.is_empty() {
            return None;
        }

        let segment = SpeechSegment::partial(text);
        self.buffer.clear();
        self.emitted_segment = true;
        Some(segment)
    }

    /// End of the fragment stream. Returns the trailing segment: the
    /// trimmed remainder if any; otherwise, when fragments arrived but
    /// never formed a segment, a single-space placeholder so the
    /// synthesis context is still explicitly closed.
    pub fn finish(self) -> Option<SpeechSegment> {
        let text = self.buffer.trim();
        if !text.is_empty() {
            return Some(SpeechSegment::final_segment(text));
        }
        if self.saw_fragment && !self.emitted_segment {
            return Some(SpeechSegment::final_segment(" "));
        }
        None
    }
}
