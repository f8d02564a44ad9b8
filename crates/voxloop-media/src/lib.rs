//! Media stages — streaming speech-to-text, streaming text-to-speech, and
//! sentence segmentation.

use async_trait::async_trait;
use tokio::sync::mpsc;

use voxloop_core::error::Result;
use voxloop_core::latency::LatencyTracker;

pub mod segment;
pub mod stt;
pub mod tts;

pub use segment::{SentenceSegmenter, SpeechSegment};
pub use stt::Transcriber;
pub use tts::Synthesizer;

/// A remote recognizer: captured audio in, one finalized transcript out.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Stream the utterance to the recognizer and resolve with the first
    /// finalized transcript. Records transcription start/end stamps.
    async fn transcribe(&self, audio: &[u8], latency: &LatencyTracker) -> Result<String>;
}

/// A remote synthesizer: one text segment in, audio chunks out as they
/// are produced.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one segment under the turn's shared context id, sending
    /// base64 PCM chunks into `chunk_tx` as they arrive. Resolves when the
    /// remote signals the segment is done.
    async fn synthesize(
        &self,
        segment: &SpeechSegment,
        context_id: &str,
        chunk_tx: mpsc::UnboundedSender<String>,
        latency: &LatencyTracker,
    ) -> Result<()>;
}
