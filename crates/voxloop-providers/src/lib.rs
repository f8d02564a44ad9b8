//! Reply generation — streaming chat completions from a remote LLM.
//!
//! A provider turns the conversation history into a lazy, finite,
//! non-restartable stream of text fragments in arrival order. The
//! orchestrator consumes fragments one at a time; each yield suspends
//! until the remote stream delivers more data.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use voxloop_core::session::ChatMessage;

pub mod openai;
pub mod sse;

/// A lazy stream of reply text fragments.
pub type ReplyStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// A reply-generation request. The system preamble is always sent as the
/// first message, before any history.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

/// Streaming reply provider.
#[async_trait]
pub trait ReplyProvider: Send + Sync {
    /// Provider identifier (e.g., "openai").
    fn id(&self) -> &str;

    /// Open a completion stream; the stream ends when the remote signals
    /// completion.
    async fn stream_reply(&self, request: &ReplyRequest) -> anyhow::Result<ReplyStream>;
}
