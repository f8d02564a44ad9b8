//! OpenAI-compatible Chat Completions streaming client.
//!
//! Works against `/v1/chat/completions` with `stream: true`; the stream
//! terminates on `data: [DONE]`. Also serves any OpenAI-compatible
//! endpoint via a custom base URL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use voxloop_core::session::{ChatMessage, Role};

use crate::sse::sse_events;
use crate::{ReplyProvider, ReplyRequest, ReplyStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct CompletionBody {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Build the message list: system preamble first, then the history in
/// order.
fn build_messages(request: &ReplyRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(json!({ "role": "system", "content": request.system }));
    for ChatMessage { role, content } in &request.messages {
        messages.push(json!({ "role": role_str(*role), "content": content }));
    }
    messages
}

#[async_trait]
impl ReplyProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    async fn stream_reply(&self, request: &ReplyRequest) -> anyhow::Result<ReplyStream> {
        let body = CompletionBody {
            model: request.model.clone(),
            messages: build_messages(request),
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming chat completion");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion API error {status}: {body}");
        }

        let sse = sse_events(response);

        let fragments = Box::pin(sse.filter_map(|event| {
            let event = match event {
                Ok(event) => event,
                Err(e) => return Some(Err(e)),
            };

            let data = event.data.trim();
            if data == "[DONE]" {
                // tokio-stream's filter_map cannot end the stream early,
                // but the server closes the body right after [DONE].
                return None;
            }

            let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    trace!(%e, data, "Skipping unparseable completion chunk");
                    return None;
                }
            };

            match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                Some(content) if !content.is_empty() => Some(Ok(content)),
                _ => None,
            }
        }));

        Ok(fragments)
    }
}
