//! Latency tracking across pipeline boundaries.
//!
//! One tracker per session, reset at the start of each turn. Stages mark
//! their boundary stamps through `&self` methods so concurrently running
//! stage futures on the same task can share the tracker; a stage duration
//! only materializes once both of its stamps exist.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Named latency stages reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyStage {
    Stt,
    LlmFirstToken,
    Llm,
    TtsFirstByte,
    Tts,
    EndToEnd,
}

#[derive(Debug, Default)]
struct Stamps {
    recording_end: Option<Instant>,
    stt_start: Option<Instant>,
    stt_end: Option<Instant>,
    llm_start: Option<Instant>,
    llm_first_token: Option<Instant>,
    llm_end: Option<Instant>,
    tts_start: Option<Instant>,
    tts_first_audio: Option<Instant>,
    tts_end: Option<Instant>,
}

/// Per-stage durations in milliseconds, sent as the `end_to_end` breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_first_token: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_first_byte: Option<u64>,
}

/// Records monotonic timestamps at pipeline boundaries.
///
/// All marks are first-wins within a turn except [`mark_synthesis_end`],
/// which is last-wins: the cumulative synthesis duration runs from the
/// first segment's start to the *last* segment's done.
///
/// [`mark_synthesis_end`]: LatencyTracker::mark_synthesis_end
#[derive(Debug, Default)]
pub struct LatencyTracker {
    stamps: Mutex<Stamps>,
}

fn ms_between(start: Option<Instant>, end: Option<Instant>) -> Option<u64> {
    match (start, end) {
        (Some(s), Some(e)) => Some(e.duration_since(s).as_millis() as u64),
        _ => None,
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stamps. Called when a new turn begins.
    pub fn reset(&self) {
        *self.stamps.lock().unwrap() = Stamps::default();
    }

    pub fn mark_recording_end(&self) {
        self.stamps.lock().unwrap().recording_end.get_or_insert_with(Instant::now);
    }

    pub fn mark_transcription_start(&self) {
        self.stamps.lock().unwrap().stt_start.get_or_insert_with(Instant::now);
    }

    pub fn mark_transcription_end(&self) {
        self.stamps.lock().unwrap().stt_end.get_or_insert_with(Instant::now);
    }

    pub fn mark_generation_start(&self) {
        self.stamps.lock().unwrap().llm_start.get_or_insert_with(Instant::now);
    }

    pub fn mark_first_fragment(&self) {
        self.stamps.lock().unwrap().llm_first_token.get_or_insert_with(Instant::now);
    }

    pub fn mark_generation_end(&self) {
        self.stamps.lock().unwrap().llm_end.get_or_insert_with(Instant::now);
    }

    /// First segment's synthesis start; later segments are no-ops.
    pub fn mark_synthesis_start(&self) {
        self.stamps.lock().unwrap().tts_start.get_or_insert_with(Instant::now);
    }

    /// First audio chunk of the turn; later chunks are no-ops.
    pub fn mark_first_audio(&self) {
        self.stamps.lock().unwrap().tts_first_audio.get_or_insert_with(Instant::now);
    }

    /// Last-wins: overwritten as each segment completes.
    pub fn mark_synthesis_end(&self) {
        self.stamps.lock().unwrap().tts_end = Some(Instant::now());
    }

    pub fn transcription_ms(&self) -> Option<u64> {
        let s = self.stamps.lock().unwrap();
        ms_between(s.stt_start, s.stt_end)
    }

    pub fn first_fragment_ms(&self) -> Option<u64> {
        let s = self.stamps.lock().unwrap();
        ms_between(s.llm_start, s.llm_first_token)
    }

    pub fn generation_ms(&self) -> Option<u64> {
        let s = self.stamps.lock().unwrap();
        ms_between(s.llm_start, s.llm_end)
    }

    pub fn first_audio_ms(&self) -> Option<u64> {
        let s = self.stamps.lock().unwrap();
        ms_between(s.tts_start, s.tts_first_audio)
    }

    pub fn synthesis_ms(&self) -> Option<u64> {
        let s = self.stamps.lock().unwrap();
        ms_between(s.tts_start, s.tts_end)
    }

    /// End-to-end: user stopped speaking to last audio chunk synthesized.
    /// Requires both the recording-end and synthesis-end stamps.
    pub fn end_to_end_ms(&self) -> Option<u64> {
        let s = self.stamps.lock().unwrap();
        ms_between(s.recording_end, s.tts_end)
    }

    pub fn breakdown(&self) -> LatencyBreakdown {
        LatencyBreakdown {
            stt: self.transcription_ms(),
            llm: self.generation_ms(),
            llm_first_token: self.first_fragment_ms(),
            tts: self.synthesis_ms(),
            tts_first_byte: self.first_audio_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_duration_without_both_stamps() {
        let tracker = LatencyTracker::new();
        assert_eq!(tracker.transcription_ms(), None);

        tracker.mark_transcription_start();
        assert_eq!(tracker.transcription_ms(), None);

        tracker.mark_transcription_end();
        assert!(tracker.transcription_ms().is_some());
    }

    #[test]
    fn test_end_to_end_requires_recording_and_synthesis_end() {
        let tracker = LatencyTracker::new();
        tracker.mark_synthesis_start();
        tracker.mark_synthesis_end();
        assert_eq!(tracker.end_to_end_ms(), None);

        tracker.mark_recording_end();
        assert!(tracker.end_to_end_ms().is_some());
    }

    #[test]
    fn test_marks_are_first_wins() {
        let tracker = LatencyTracker::new();
        tracker.mark_generation_start();
        std::thread::sleep(std::time::Duration::from_millis(15));
        // A second start mark must not move the stamp forward.
        tracker.mark_generation_start();
        tracker.mark_generation_end();
        assert!(tracker.generation_ms().unwrap() >= 15);
    }

    #[test]
    fn test_synthesis_end_is_last_wins() {
        let tracker = LatencyTracker::new();
        tracker.mark_synthesis_start();
        tracker.mark_synthesis_end();
        let first = tracker.synthesis_ms().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(15));
        tracker.mark_synthesis_end();
        assert!(tracker.synthesis_ms().unwrap() >= first + 15);
    }

    #[test]
    fn test_reset_clears_stamps() {
        let tracker = LatencyTracker::new();
        tracker.mark_transcription_start();
        tracker.mark_transcription_end();
        assert!(tracker.transcription_ms().is_some());

        tracker.reset();
        assert_eq!(tracker.transcription_ms(), None);
    }

    #[test]
    fn test_breakdown_matches_stage_durations() {
        let tracker = LatencyTracker::new();
        tracker.mark_transcription_start();
        tracker.mark_transcription_end();
        tracker.mark_generation_start();
        tracker.mark_first_fragment();
        tracker.mark_generation_end();

        let breakdown = tracker.breakdown();
        assert_eq!(breakdown.stt, tracker.transcription_ms());
        assert_eq!(breakdown.llm, tracker.generation_ms());
        assert_eq!(breakdown.llm_first_token, tracker.first_fragment_ms());
        assert_eq!(breakdown.tts, None);
    }
}
