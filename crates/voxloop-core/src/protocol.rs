//! Voxloop client wire protocol.
//!
//! All client communication is JSON over one WebSocket: tagged
//! [`ClientMessage`] control frames inbound, tagged [`StreamEvent`] frames
//! outbound. Events are appended to the socket in emission order; there is
//! no replay — a disconnected client loses in-flight events.

use serde::{Deserialize, Serialize};

use crate::latency::{LatencyBreakdown, LatencyStage};

/// Client -> server control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session. Must precede all other messages.
    Init,

    /// A chunk of captured audio: base64-encoded raw 16-bit LE PCM.
    Audio { data: String },

    /// The utterance is complete; run a turn over the buffered audio.
    AudioEnd,
}

/// Server -> client event payload, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    /// Session established, caller may start streaming audio.
    Ready,

    /// Finalized transcript of the caller's utterance.
    Transcript { text: String },

    /// Reply generation has started.
    Thinking,

    /// One incremental fragment of the assistant reply.
    ReplyChunk { text: String },

    /// The assistant reply text is complete.
    ReplyDone,

    /// One chunk of synthesized speech: base64-encoded raw 16-bit LE PCM.
    AudioChunk { data: String },

    /// All audio for the turn has been synthesized.
    AudioDone,

    /// A measured stage duration.
    Latency {
        stage: LatencyStage,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        breakdown: Option<LatencyBreakdown>,
    },

    /// The turn was aborted; the session is idle again.
    Error { message: String },
}

/// A stream event as sent on the wire: the kind plus a unix-ms timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub kind: StreamEventKind,
    pub timestamp: i64,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn ready() -> Self {
        Self::new(StreamEventKind::Ready)
    }

    pub fn transcript(text: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Transcript { text: text.into() })
    }

    pub fn thinking() -> Self {
        Self::new(StreamEventKind::Thinking)
    }

    pub fn reply_chunk(text: impl Into<String>) -> Self {
        Self::new(StreamEventKind::ReplyChunk { text: text.into() })
    }

    pub fn reply_done() -> Self {
        Self::new(StreamEventKind::ReplyDone)
    }

    pub fn audio_chunk(data: impl Into<String>) -> Self {
        Self::new(StreamEventKind::AudioChunk { data: data.into() })
    }

    pub fn audio_done() -> Self {
        Self::new(StreamEventKind::AudioDone)
    }

    pub fn latency(stage: LatencyStage, duration_ms: u64) -> Self {
        Self::new(StreamEventKind::Latency {
            stage,
            duration_ms,
            breakdown: None,
        })
    }

    pub fn latency_with_breakdown(
        stage: LatencyStage,
        duration_ms: u64,
        breakdown: LatencyBreakdown,
    ) -> Self {
        Self::new(StreamEventKind::Latency {
            stage,
            duration_ms,
            breakdown: Some(breakdown),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Error {
            message: message.into(),
        })
    }
}
