//! Provider and stream contracts every backend adapter satisfies.
//!
//! Third-party backends implement [`Provider`] and inject themselves through
//! `ClientConfig::custom_provider`; there is no global registry. The facade
//! either dispatches on the provider-name enum or uses the injected value.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

/// The capability set of a chat-completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name (e.g. "openai", "anthropic").
    fn name(&self) -> &str;

    /// Create a fully materialized chat completion.
    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse>;

    /// Create a streaming chat completion. The returned stream is owned by
    /// the caller and must be closed on all exit paths.
    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream>;

    /// Release any held connections. No-op for stateless HTTP adapters.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A streaming chat completion, normalized to canonical chunks.
///
/// Single-consumer and non-restartable. `recv` yields `Ok(Some(chunk))` in
/// wire order, `Ok(None)` at end-of-stream (and on every read after it), and
/// `Err(LlmError::StreamClosed)` once [`close`](ChatCompletionStream::close)
/// has run. `close` is idempotent, safe from any state, and releases the
/// underlying HTTP body even when end-of-stream was never reached.
#[async_trait]
pub trait ChatCompletionStream: Send {
    /// Receive the next chunk.
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>>;

    /// Close the stream, cancelling any in-flight transfer.
    async fn close(&mut self) -> Result<()>;
}

/// Boxed stream as returned by [`Provider::create_chat_completion_stream`].
pub type BoxChatStream = Box<dyn ChatCompletionStream>;
