//! Streaming speech synthesis over the synthesizer's WebSocket.
//!
//! One connection per segment, all segments of a turn tagged with the
//! same context id: that shared context is what keeps prosody continuous
//! across the segments of one reply. `continue = true` tells the remote
//! more of the utterance follows; the final segment sends
//! `continue = false` and releases the context.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use voxloop_core::config::Config;
use voxloop_core::error::{Result, VoxloopError};
use voxloop_core::latency::LatencyTracker;

use crate::segment::SpeechSegment;
use crate::TextToSpeech;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct VoiceSelector<'a> {
    mode: &'a str,
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct OutputFormat<'a> {
    container: &'a str,
    encoding: &'a str,
    sample_rate: u32,
}

/// One synthesis request on the wire.
#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    context_id: &'a str,
    model_id: &'a str,
    transcript: &'a str,
    #[serde(rename = "continue")]
    continue_: bool,
    language: &'a str,
    voice: VoiceSelector<'a>,
    output_format: OutputFormat<'a>,
}

/// Messages the synthesizer sends back. Unknown message types are skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SynthesizerMessage {
    Chunk { data: String },
    Done,
    Error { error: String },
}

/// Remote streaming synthesizer client.
pub struct Synthesizer {
    base_url: String,
    api_key: String,
    api_version: String,
    model_id: String,
    voice_id: String,
    language: String,
    sample_rate: u32,
    timeout: Duration,
}

impl Synthesizer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .tts_api_key()
            .ok_or_else(|| VoxloopError::Config("No TTS API key configured".into()))?;

        Ok(Self {
            base_url: config.tts_base_url(),
            api_key,
            api_version: config.tts_api_version(),
            model_id: config.tts_model_id(),
            voice_id: config.tts_voice_id(),
            language: config.tts_language(),
            sample_rate: config.tts_sample_rate(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the stage timeout (tests use a short one).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}?api_key={}&cartesia_version={}",
            self.base_url, self.api_key, self.api_version
        )
    }

    fn request_json(&self, segment: &SpeechSegment, context_id: &str) -> Result<String> {
        let request = SynthesisRequest {
            context_id,
            model_id: &self.model_id,
            transcript: &segment.text,
            continue_: !segment.is_final,
            language: &self.language,
            voice: VoiceSelector {
                mode: "id",
                id: &self.voice_id,
            },
            output_format: OutputFormat {
                container: "raw",
                encoding: "pcm_s16le",
                sample_rate: self.sample_rate,
            },
        };
        Ok(serde_json::to_string(&request)?)
    }

    /// Forward audio chunks until the remote signals done.
    async fn pump_chunks<S>(
        rx: &mut S,
        chunk_tx: &mpsc::UnboundedSender<String>,
        latency: &LatencyTracker,
    ) -> Result<()>
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(message) = rx.next().await {
            let message =
                message.map_err(|e| VoxloopError::Synthesis(format!("connection error: {e}")))?;

            let Message::Text(text) = message else {
                continue;
            };

            match serde_json::from_str::<SynthesizerMessage>(text.as_str()) {
                Ok(SynthesizerMessage::Chunk { data }) => {
                    latency.mark_first_audio();
                    if chunk_tx.send(data).is_err() {
                        // Receiver gone — the turn was torn down.
                        debug!("Audio chunk receiver dropped, stopping synthesis stream");
                        return Ok(());
                    }
                }
                Ok(SynthesizerMessage::Done) => return Ok(()),
                Ok(SynthesizerMessage::Error { error }) => {
                    return Err(VoxloopError::Synthesis(error));
                }
                Err(_) => {
                    debug!(message = %text, "Skipping unrecognized synthesizer message");
                }
            }
        }

        Err(VoxloopError::Synthesis(
            "connection closed before synthesis finished".into(),
        ))
    }
}

#[async_trait]
impl TextToSpeech for Synthesizer {
    async fn synthesize(
        &self,
        segment: &SpeechSegment,
        context_id: &str,
        chunk_tx: mpsc::UnboundedSender<String>,
        latency: &LatencyTracker,
    ) -> Result<()> {
        latency.mark_synthesis_start();
        let request = self.request_json(segment, context_id)?;

        let (ws, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| VoxloopError::Synthesis(format!("connect failed: {e}")))?;
        let (mut tx, mut rx) = ws.split();

        debug!(
            context_id,
            is_final = segment.is_final,
            chars = segment.text.len(),
            "Synthesizing segment"
        );

        let outcome = match tx.send(Message::Text(request.into())).await {
            Err(e) => Err(VoxloopError::Synthesis(format!("send failed: {e}"))),
            Ok(()) => {
                match tokio::time::timeout(
                    self.timeout,
                    Self::pump_chunks(&mut rx, &chunk_tx, latency),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(VoxloopError::Synthesis(format!(
                        "no completion within {}s",
                        self.timeout.as_secs()
                    ))),
                }
            }
        };

        // Single close point covering every exit path.
        if let Err(e) = tx.close().await {
            warn!(%e, "Error closing synthesizer connection");
        }

        if outcome.is_ok() {
            latency.mark_synthesis_end();
        }
        outcome
    }
}
