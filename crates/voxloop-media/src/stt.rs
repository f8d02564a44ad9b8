//! Streaming speech-to-text over the recognizer's bidirectional WebSocket.
//!
//! One connection per utterance: send the captured PCM, send the
//! end-of-audio marker, await the first finalized transcript. The socket
//! is closed on every exit path — success, remote-reported error, stream
//! error, or timeout — so no recognizer session outlives the call.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use voxloop_core::config::Config;
use voxloop_core::error::{Result, VoxloopError};
use voxloop_core::latency::LatencyTracker;

use crate::SpeechToText;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Control message sent to the recognizer after the audio.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RecognizerCommand {
    EndOfAudio,
}

/// Messages the recognizer sends back. Unknown message types are skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RecognizerMessage {
    Transcript { text: String },
    Error { error: String },
}

/// Remote streaming recognizer client.
pub struct Transcriber {
    base_url: String,
    api_key: String,
    api_version: String,
    model: String,
    language: String,
    sample_rate: u32,
    timeout: Duration,
}

impl Transcriber {
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .stt_api_key()
            .ok_or_else(|| VoxloopError::Config("No STT API key configured".into()))?;

        Ok(Self {
            base_url: config.stt_base_url(),
            api_key,
            api_version: config.stt_api_version(),
            model: config.stt_model(),
            language: config.stt_language(),
            sample_rate: config.stt_sample_rate(),
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
            "{}?api_key={}&cartesia_version={}&encoding=pcm_s16le&sample_rate={}&language={}&model={}",
            self.base_url, self.api_key, self.api_version, self.sample_rate, self.language, self.model
        )
    }

    /// Read recognizer messages until a transcript or error arrives.
    async fn await_transcript<S>(rx: &mut S) -> Result<String>
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(message) = rx.next().await {
            let message =
                message.map_err(|e| VoxloopError::Transcription(format!("connection error: {e}")))?;

            let Message::Text(text) = message else {
                continue;
            };

            match serde_json::from_str::<RecognizerMessage>(text.as_str()) {
                Ok(RecognizerMessage::Transcript { text }) => return Ok(text),
                Ok(RecognizerMessage::Error { error }) => {
                    return Err(VoxloopError::Transcription(error));
                }
                Err(_) => {
                    debug!(message = %text, "Skipping unrecognized recognizer message");
                }
            }
        }

        Err(VoxloopError::Transcription(
            "connection closed before a transcript arrived".into(),
        ))
    }
}

#[async_trait]
impl SpeechToText for Transcriber {
    async fn transcribe(&self, audio: &[u8], latency: &LatencyTracker) -> Result<String> {
        latency.mark_transcription_start();
        let end_marker = serde_json::to_string(&RecognizerCommand::EndOfAudio)?;

        let (ws, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| VoxloopError::Transcription(format!("connect failed: {e}")))?;
        let (mut tx, mut rx) = ws.split();

        debug!(bytes = audio.len(), model = %self.model, "Streaming utterance to recognizer");

        let send_result = async {
            tx.send(Message::Binary(audio.to_vec().into())).await?;
            tx.send(Message::Text(end_marker.into())).await
        }
        .await;

        let outcome = match send_result {
            Err(e) => Err(VoxloopError::Transcription(format!("send failed: {e}"))),
            Ok(()) => {
                match tokio::time::timeout(self.timeout, Self::await_transcript(&mut rx)).await {
                    Ok(result) => result,
                    Err(_) => Err(VoxloopError::Transcription(format!(
                        "no transcript within {}s",
                        self.timeout.as_secs()
                    ))),
                }
            }
        };

        // Single close point covering every exit path.
        if let Err(e) = tx.close().await {
            warn!(%e, "Error closing recognizer connection");
        }

        if outcome.is_ok() {
            latency.mark_transcription_end();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_core::config::SttConfig;

    fn transcriber(base_url: &str) -> Transcriber {
        Transcriber {
            base_url: base_url.into(),
            api_key: "test-key".into(),
            api_version: "2025-04-16".into(),
            model: "ink-whisper".into(),
            language: "en".into(),
            sample_rate: 16_000,
            timeout: DEFAULT_TIMEOUT,
        }
        .with_timeout(Duration::from_millis(300))
    }

    /// One-shot recognizer stub: accepts a connection and runs `script`
    /// over it.
    async fn spawn_stub<F, Fut>(script: F) -> String
    where
        F: FnOnce(
                tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
            ) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}/")
    }

    #[test]
    fn test_endpoint_query_parameters() {
        let t = transcriber("wss://api.cartesia.ai/stt/stream");
        let url = t.endpoint();
        assert!(url.starts_with("wss://api.cartesia.ai/stt/stream?"));
        assert!(url.contains("encoding=pcm_s16le"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("language=en"));
        assert!(url.contains("model=ink-whisper"));
    }

    #[test]
    fn test_from_config_requires_api_key() {
        let config = Config::default();
        assert!(matches!(
            Transcriber::from_config(&config),
            Err(VoxloopError::Config(_))
        ));

        let config = Config {
            stt: Some(SttConfig {
                api_key: Some("key".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(Transcriber::from_config(&config).is_ok());
    }

    #[test]
    fn test_end_of_audio_marker_shape() {
        let json = serde_json::to_string(&RecognizerCommand::EndOfAudio).unwrap();
        assert_eq!(json, r#"{"type":"end_of_audio"}"#);
    }

    #[tokio::test]
    async fn test_transcribe_resolves_on_transcript() {
        let url = spawn_stub(|mut ws| async move {
            // Consume the audio frame and end-of-audio marker.
            let _ = ws.next().await;
            let _ = ws.next().await;
            ws.send(Message::Text(
                r#"{"type":"transcript","text":"hello world"}"#.into(),
            ))
            .await
            .unwrap();
        })
        .await;

        let latency = LatencyTracker::new();
        let text = transcriber(&url)
            .transcribe(&[0u8; 320], &latency)
            .await
            .unwrap();
        assert_eq!(text, "hello world");
        assert!(latency.transcription_ms().is_some());
    }

    #[tokio::test]
    async fn test_transcribe_skips_unknown_messages() {
        let url = spawn_stub(|mut ws| async move {
            let _ = ws.next().await;
            let _ = ws.next().await;
            ws.send(Message::Text(r#"{"type":"flush_done"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"transcript","text":"ok"}"#.into()))
                .await
                .unwrap();
        })
        .await;

        let latency = LatencyTracker::new();
        let text = transcriber(&url)
            .transcribe(&[0u8; 4], &latency)
            .await
            .unwrap();
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn test_transcribe_rejects_on_remote_error() {
        let url = spawn_stub(|mut ws| async move {
            let _ = ws.next().await;
            let _ = ws.next().await;
            ws.send(Message::Text(
                r#"{"type":"error","error":"unsupported audio"}"#.into(),
            ))
            .await
            .unwrap();
        })
        .await;

        let latency = LatencyTracker::new();
        let err = transcriber(&url)
            .transcribe(&[0u8; 4], &latency)
            .await
            .unwrap_err();
        match err {
            VoxloopError::Transcription(message) => {
                assert!(message.contains("unsupported audio"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(latency.transcription_ms(), None);
    }

    #[tokio::test]
    async fn test_transcribe_times_out_without_transcript() {
        let url = spawn_stub(|mut ws| async move {
            // Read forever, never answer.
            while ws.next().await.is_some() {}
        })
        .await;

        let latency = LatencyTracker::new();
        let err = transcriber(&url)
            .transcribe(&[0u8; 4], &latency)
            .await
            .unwrap_err();
        assert!(matches!(err, VoxloopError::Transcription(_)));
        assert_eq!(latency.transcription_ms(), None);
    }
}
