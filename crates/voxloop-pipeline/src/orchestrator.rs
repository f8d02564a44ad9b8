//! The turn state machine.
//!
//! One turn runs `Idle → Transcribing → Generating → Idle`, with synthesis
//! interleaved with continued generation: as soon as the segmenter cuts a
//! segment, it is queued to a synthesis loop that runs joined with the
//! generation loop on the same task. Synthesis of segment *k* therefore
//! overlaps generation of the tokens that will form segment *k+1*, while
//! segments are only ever issued to the synthesizer in segment order.
//!
//! Every stage failure is caught at the turn boundary: one `error` event,
//! no history change, session idle and usable again.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use voxloop_core::config::Config;
use voxloop_core::error::{Result, VoxloopError};
use voxloop_core::latency::LatencyStage;
use voxloop_core::protocol::StreamEvent;
use voxloop_core::session::{ChatMessage, Session};
use voxloop_media::{SentenceSegmenter, SpeechSegment, SpeechToText, TextToSpeech};
use voxloop_providers::{ReplyProvider, ReplyRequest};

/// Outbound event sink; the gateway's writer loop drains it to the client
/// in emission order.
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

/// Phase of the in-flight turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Transcribing,
    Generating,
    Synthesizing,
}

/// Reply-generation parameters, fixed per process.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl LlmSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.llm_model(),
            system_prompt: config.system_prompt(),
            max_tokens: config.llm_max_tokens(),
            temperature: config.llm_temperature(),
        }
    }
}

fn send(events: &EventSink, event: StreamEvent) -> Result<()> {
    events
        .send(event)
        .map_err(|_| VoxloopError::Gateway("event channel closed".into()))
}

/// Drives one session's turns through the pipeline stages.
pub struct Orchestrator {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn ReplyProvider>,
    tts: Arc<dyn TextToSpeech>,
    settings: LlmSettings,
}

impl Orchestrator {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn ReplyProvider>,
        tts: Arc<dyn TextToSpeech>,
        settings: LlmSettings,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            settings,
        }
    }

    /// Run one complete turn over a captured utterance.
    ///
    /// Any stage failure is converted into a single `error` event here at
    /// the turn boundary; history is only touched on success.
    pub async fn run_turn(&self, session: &mut Session, audio: Vec<u8>, events: &EventSink) {
        session.latency.reset();
        session.latency.mark_recording_end();

        match self.process_turn(session, audio, events).await {
            Ok(()) => {}
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Turn aborted");
                let _ = events.send(StreamEvent::error(e.to_string()));
            }
        }
    }

    async fn process_turn(
        &self,
        session: &mut Session,
        audio: Vec<u8>,
        events: &EventSink,
    ) -> Result<()> {
        debug!(session_id = %session.id, state = ?TurnState::Transcribing, "Turn started");
        let transcript = self.stt.transcribe(&audio, &session.latency).await?;
        send(events, StreamEvent::transcript(transcript.clone()))?;
        if let Some(ms) = session.latency.transcription_ms() {
            send(events, StreamEvent::latency(LatencyStage::Stt, ms))?;
        }

        debug!(session_id = %session.id, state = ?TurnState::Generating, "Transcript finalized");
        send(events, StreamEvent::thinking())?;
        let context_id = session.begin_context();

        let mut messages = session.history.clone();
        messages.push(ChatMessage::user(transcript.clone()));
        let request = ReplyRequest {
            model: self.settings.model.clone(),
            system: self.settings.system_prompt.clone(),
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        session.latency.mark_generation_start();
        let mut fragments = self
            .llm
            .stream_reply(&request)
            .await
            .map_err(|e| VoxloopError::Generation(e.to_string()))?;

        let latency = &session.latency;
        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel::<SpeechSegment>();

        // Generation loop: emit every fragment immediately, cut segments
        // as boundaries appear.
        let generation = async move {
            let mut segmenter = SentenceSegmenter::new();
            let mut reply = String::new();
            let mut first = true;

            while let Some(fragment) = fragments.next().await {
                let fragment =
                    fragment.map_err(|e| VoxloopError::Generation(e.to_string()))?;
                if fragment.is_empty() {
                    continue;
                }

                if first {
                    first = false;
                    latency.mark_first_fragment();
                    if let Some(ms) = latency.first_fragment_ms() {
                        send(events, StreamEvent::latency(LatencyStage::LlmFirstToken, ms))?;
                    }
                }

                reply.push_str(&fragment);
                send(events, StreamEvent::reply_chunk(fragment.clone()))?;

                if let Some(segment) = segmenter.push(&fragment) {
                    if segment_tx.send(segment).is_err() {
                        // Synthesis bailed; its error surfaces via try_join.
                        break;
                    }
                }
            }

            latency.mark_generation_end();
            if let Some(ms) = latency.generation_ms() {
                send(events, StreamEvent::latency(LatencyStage::Llm, ms))?;
            }
            if let Some(segment) = segmenter.finish() {
                let _ = segment_tx.send(segment);
            }
            Ok::<String, VoxloopError>(reply)
        };

        // Synthesis loop: segments strictly in queue order, audio chunks
        // forwarded as the remote produces them.
        let synthesis = async {
            let mut first_audio_reported = false;
            while let Some(segment) = segment_rx.recv().await {
                debug!(
                    context_id = %context_id,
                    is_final = segment.is_final,
                    state = ?TurnState::Synthesizing,
                    "Segment ready"
                );
                let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
                let synth = self.tts.synthesize(&segment, &context_id, chunk_tx, latency);
                let forward = async {
                    while let Some(data) = chunk_rx.recv().await {
                        if !first_audio_reported {
                            if let Some(ms) = latency.first_audio_ms() {
                                send(
                                    events,
                                    StreamEvent::latency(LatencyStage::TtsFirstByte, ms),
                                )?;
                                first_audio_reported = true;
                            }
                        }
                        send(events, StreamEvent::audio_chunk(data))?;
                    }
                    Ok::<(), VoxloopError>(())
                };
                let (synth_result, forward_result) = tokio::join!(synth, forward);
                synth_result?;
                forward_result?;
            }

            if let Some(ms) = latency.synthesis_ms() {
                send(events, StreamEvent::latency(LatencyStage::Tts, ms))?;
            }
            Ok::<(), VoxloopError>(())
        };

        let (reply, ()) = tokio::try_join!(generation, synthesis)?;

        session.commit_turn(transcript, reply);
        send(events, StreamEvent::reply_done())?;
        send(events, StreamEvent::audio_done())?;
        if let Some(ms) = session.latency.end_to_end_ms() {
            send(
                events,
                StreamEvent::latency_with_breakdown(
                    LatencyStage::EndToEnd,
                    ms,
                    session.latency.breakdown(),
                ),
            )?;
        }

        info!(
            session_id = %session.id,
            history_len = session.history.len(),
            state = ?TurnState::Idle,
            "Turn completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use voxloop_core::latency::LatencyTracker;
    use voxloop_core::protocol::StreamEventKind;
    use voxloop_core::session::Role;
    use voxloop_providers::ReplyStream;

    struct FakeStt {
        transcript: &'static str,
    }

    #[async_trait]
    impl SpeechToText for FakeStt {
        async fn transcribe(&self, _audio: &[u8], latency: &LatencyTracker) -> Result<String> {
            latency.mark_transcription_start();
            latency.mark_transcription_end();
            Ok(self.transcript.to_string())
        }
    }

    struct FailingStt;

    #[async_trait]
    impl SpeechToText for FailingStt {
        async fn transcribe(&self, _audio: &[u8], _latency: &LatencyTracker) -> Result<String> {
            Err(VoxloopError::Transcription("recognizer unreachable".into()))
        }
    }

    struct FakeLlm {
        fragments: Vec<&'static str>,
    }

    #[async_trait]
    impl ReplyProvider for FakeLlm {
        fn id(&self) -> &str {
            "fake"
        }

        async fn stream_reply(&self, _request: &ReplyRequest) -> anyhow::Result<ReplyStream> {
            let items: Vec<anyhow::Result<String>> =
                self.fragments.iter().map(|f| Ok(f.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Streams a few fragments, then errors mid-stream.
    struct BrokenLlm;

    #[async_trait]
    impl ReplyProvider for BrokenLlm {
        fn id(&self) -> &str {
            "broken"
        }

        async fn stream_reply(&self, _request: &ReplyRequest) -> anyhow::Result<ReplyStream> {
            let items: Vec<anyhow::Result<String>> = vec![
                Ok("Partial".to_string()),
                Err(anyhow::anyhow!("model connection reset")),
            ];
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Records issued segments, emits `chunks_per_segment` audio chunks
    /// labeled by segment index.
    struct FakeTts {
        issued: Mutex<Vec<(String, bool)>>,
        chunks_per_segment: usize,
    }

    impl FakeTts {
        fn new(chunks_per_segment: usize) -> Self {
            Self {
                issued: Mutex::new(Vec::new()),
                chunks_per_segment,
            }
        }
    }

    #[async_trait]
    impl TextToSpeech for FakeTts {
        async fn synthesize(
            &self,
            segment: &SpeechSegment,
            _context_id: &str,
            chunk_tx: mpsc::UnboundedSender<String>,
            latency: &LatencyTracker,
        ) -> Result<()> {
            latency.mark_synthesis_start();
            let index = {
                let mut issued = self.issued.lock().unwrap();
                issued.push((segment.text.clone(), segment.is_final));
                issued.len() - 1
            };
            for chunk in 0..self.chunks_per_segment {
                latency.mark_first_audio();
                let _ = chunk_tx.send(format!("seg{index}-chunk{chunk}"));
                // Yield so chunk forwarding interleaves with generation.
                tokio::task::yield_now().await;
            }
            latency.mark_synthesis_end();
            Ok(())
        }
    }

    struct FailingTts;

    #[async_trait]
    impl TextToSpeech for FailingTts {
        async fn synthesize(
            &self,
            _segment: &SpeechSegment,
            _context_id: &str,
            _chunk_tx: mpsc::UnboundedSender<String>,
            _latency: &LatencyTracker,
        ) -> Result<()> {
            Err(VoxloopError::Synthesis("synthesizer unreachable".into()))
        }
    }

    fn settings() -> LlmSettings {
        LlmSettings {
            model: "gpt-4o-mini".into(),
            system_prompt: "Be brief.".into(),
            max_tokens: 256,
            temperature: None,
        }
    }

    fn orchestrator(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn ReplyProvider>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Orchestrator {
        Orchestrator::new(stt, llm, tts, settings())
    }

    async fn run(
        orchestrator: &Orchestrator,
        session: &mut Session,
    ) -> Vec<StreamEvent> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        orchestrator
            .run_turn(session, vec![0u8; 320], &events_tx)
            .await;
        drop(events_tx);
        let mut events = Vec::new();
        while let Some(event) = events_rx.recv().await {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[StreamEvent]) -> Vec<&StreamEventKind> {
        events.iter().map(|e| &e.kind).collect()
    }

    fn position(events: &[StreamEvent], predicate: impl Fn(&StreamEventKind) -> bool) -> usize {
        events
            .iter()
            .position(|e| predicate(&e.kind))
            .expect("event not found")
    }

    #[tokio::test]
    async fn test_successful_turn_commits_history_in_order() {
        let tts = Arc::new(FakeTts::new(1));
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi there" }),
            Arc::new(FakeLlm {
                fragments: vec!["Hello", " world.", " Bye"],
            }),
            tts.clone(),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].role, Role::User);
        assert_eq!(session.history[0].content, "hi there");
        assert_eq!(session.history[1].role, Role::Assistant);
        assert_eq!(session.history[1].content, "Hello world. Bye");

        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, StreamEventKind::Error { .. })));
    }

    #[tokio::test]
    async fn test_event_causal_order() {
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(FakeLlm {
                fragments: vec!["One.", " Two"],
            }),
            Arc::new(FakeTts::new(1)),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        let transcript = position(&events, |k| matches!(k, StreamEventKind::Transcript { .. }));
        let thinking = position(&events, |k| matches!(k, StreamEventKind::Thinking));
        let first_reply = position(&events, |k| matches!(k, StreamEventKind::ReplyChunk { .. }));
        let first_audio = position(&events, |k| matches!(k, StreamEventKind::AudioChunk { .. }));
        let reply_done = position(&events, |k| matches!(k, StreamEventKind::ReplyDone));
        let audio_done = position(&events, |k| matches!(k, StreamEventKind::AudioDone));

        assert!(transcript < thinking);
        assert!(thinking < first_reply);
        // Audio can only come from already-emitted reply text.
        assert!(first_reply < first_audio);
        assert!(reply_done < audio_done);
        assert_eq!(audio_done, events.len() - 2); // followed only by end_to_end latency
    }

    #[tokio::test]
    async fn test_reply_chunks_preserve_generation_order() {
        let fragments = vec!["A", "B", "C", "D."];
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(FakeLlm {
                fragments: fragments.clone(),
            }),
            Arc::new(FakeTts::new(0)),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        let chunks: Vec<&str> = kinds(&events)
            .into_iter()
            .filter_map(|k| match k {
                StreamEventKind::ReplyChunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, fragments);
    }

    #[tokio::test]
    async fn test_segments_issued_in_order_with_final_flag() {
        let tts = Arc::new(FakeTts::new(2));
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(FakeLlm {
                fragments: vec!["Hello", " world.", " Bye"],
            }),
            tts.clone(),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        let issued = tts.issued.lock().unwrap().clone();
        assert_eq!(
            issued,
            vec![
                ("Hello world.".to_string(), false),
                ("Bye".to_string(), true),
            ]
        );

        // All of segment 0's audio precedes all of segment 1's.
        let audio: Vec<&str> = kinds(&events)
            .into_iter()
            .filter_map(|k| match k {
                StreamEventKind::AudioChunk { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            audio,
            vec!["seg0-chunk0", "seg0-chunk1", "seg1-chunk0", "seg1-chunk1"]
        );
    }

    #[tokio::test]
    async fn test_failed_transcription_emits_single_error_and_no_history() {
        let orchestrator = orchestrator(
            Arc::new(FailingStt),
            Arc::new(FakeLlm { fragments: vec![] }),
            Arc::new(FakeTts::new(1)),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        assert!(session.history.is_empty());
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, StreamEventKind::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        match &errors[0].kind {
            StreamEventKind::Error { message } => {
                assert!(message.contains("recognizer unreachable"));
            }
            _ => unreachable!(),
        }
        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, StreamEventKind::ReplyDone | StreamEventKind::AudioDone)));
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_history_unchanged() {
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(BrokenLlm),
            Arc::new(FakeTts::new(1)),
        );

        let mut session = Session::new();
        session.commit_turn("earlier", "reply");
        let before = session.history.len();

        let events = run(&orchestrator, &mut session).await;

        assert_eq!(session.history.len(), before);
        let errors = events
            .iter()
            .filter(|e| matches!(e.kind, StreamEventKind::Error { .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, StreamEventKind::ReplyDone)));
    }

    #[tokio::test]
    async fn test_failed_synthesis_aborts_turn() {
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(FakeLlm {
                fragments: vec!["One.", " Two."],
            }),
            Arc::new(FailingTts),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        assert!(session.history.is_empty());
        let errors = events
            .iter()
            .filter(|e| matches!(e.kind, StreamEventKind::Error { .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, StreamEventKind::AudioDone)));
    }

    #[tokio::test]
    async fn test_end_to_end_latency_emitted_only_on_success() {
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(FakeLlm {
                fragments: vec!["Done."],
            }),
            Arc::new(FakeTts::new(1)),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        let end_to_end: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.kind {
                StreamEventKind::Latency {
                    stage: LatencyStage::EndToEnd,
                    breakdown,
                    ..
                } => Some(breakdown),
                _ => None,
            })
            .collect();
        assert_eq!(end_to_end.len(), 1);
        let breakdown = end_to_end[0].as_ref().unwrap();
        assert!(breakdown.stt.is_some());
        assert!(breakdown.llm.is_some());
        assert!(breakdown.tts.is_some());

        // And never on a failed turn.
        let failing = self::orchestrator(
            Arc::new(FailingStt),
            Arc::new(FakeLlm { fragments: vec![] }),
            Arc::new(FakeTts::new(1)),
        );
        let mut session = Session::new();
        let events = run(&failing, &mut session).await;
        assert!(!events.iter().any(|e| matches!(
            e.kind,
            StreamEventKind::Latency {
                stage: LatencyStage::EndToEnd,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_empty_reply_stream_completes_without_segments() {
        let tts = Arc::new(FakeTts::new(1));
        let orchestrator = orchestrator(
            Arc::new(FakeStt { transcript: "hi" }),
            Arc::new(FakeLlm { fragments: vec![] }),
            tts.clone(),
        );

        let mut session = Session::new();
        let events = run(&orchestrator, &mut session).await;

        assert!(tts.issued.lock().unwrap().is_empty());
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[1].content, "");
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, StreamEventKind::AudioDone)));
    }
}
