//! Deterministic in-process adapter for tests.
//!
//! Returns canned replies without touching the network, records the requests
//! it sees, and can inject failures. Streams are scripted: each configured
//! fragment becomes a delta chunk, followed by a terminal chunk. A mock with
//! no fragments still yields the terminal chunk with an empty delta, which
//! is exactly what a zero-content vendor stream looks like.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ApiError, LlmError, Result};
use crate::provider::{BoxChatStream, ChatCompletionStream, Provider};
use crate::types::{
    epoch_now, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, Message, ProviderMetadata, Usage,
};

/// Canned-response backend for tests and offline development.
pub struct MockProvider {
    reply: String,
    fragments: Vec<String>,
    failing: bool,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatCompletionRequest>>,
}

impl MockProvider {
    /// Mock that answers every completion with `reply`.
    pub fn new(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self {
            fragments: vec![reply.clone()],
            reply,
            failing: false,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Script the delta fragments emitted by streaming calls.
    pub fn with_stream_fragments(mut self, fragments: Vec<&str>) -> Self {
        self.fragments = fragments.into_iter().map(str::to_string).collect();
        self
    }

    /// Mock whose calls all fail with a server error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new("")
        }
    }

    /// Number of completion calls (sync and streaming) seen so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request, for assertions on translation and merging.
    pub fn last_request(&self) -> Option<ChatCompletionRequest> {
        self.last_request.lock().expect("mock lock").clone()
    }

    fn record(&self, req: &ChatCompletionRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().expect("mock lock") = Some(req.clone());
        if self.failing {
            return Err(
                ApiError::new("mock", 500, "injected failure", None, None).into_error(),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        req.validate()?;
        self.record(req)?;

        Ok(ChatCompletionResponse {
            id: format!("mock-{}", self.call_count()),
            object: "chat.completion".to_string(),
            created: epoch_now(),
            model: req.model.clone(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Message::assistant(self.reply.clone()),
                finish_reason: Some("stop".to_string()),
                logprobs: None,
            }],
            usage: Usage::new(req.messages.len() as u32, 1),
            provider_metadata: ProviderMetadata::new(),
        })
    }

    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        req.validate()?;
        self.record(req)?;

        let id = format!("mock-{}", self.call_count());
        let model = req.model.clone();
        let mut chunks: VecDeque<ChatCompletionChunk> = self
            .fragments
            .iter()
            .map(|fragment| ChatCompletionChunk {
                id: id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: epoch_now(),
                model: model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: Some(Message::assistant(fragment.clone())),
                    finish_reason: None,
                }],
                usage: None,
                provider_metadata: ProviderMetadata::new(),
            })
            .collect();
        chunks.push_back(ChatCompletionChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created: epoch_now(),
            model,
            choices: vec![ChunkChoice {
                index: 0,
                delta: Some(Message::assistant("")),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage::new(req.messages.len() as u32, 1)),
            provider_metadata: ProviderMetadata::new(),
        });

        Ok(Box::new(MockStream {
            chunks,
            closed: false,
        }))
    }
}

struct MockStream {
    chunks: VecDeque<ChatCompletionChunk>,
    closed: bool,
}

#[async_trait]
impl ChatCompletionStream for MockStream {
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>> {
        if self.closed {
            return Err(LlmError::StreamClosed);
        }
        Ok(self.chunks.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.chunks.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::new("mock-model", vec![Message::user("Hi")])
    }

    #[tokio::test]
    async fn test_completion_returns_canned_reply() {
        let provider = MockProvider::new("Hello");
        let resp = provider.create_chat_completion(&request()).await.unwrap();
        assert_eq!(resp.content(), "Hello");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.last_request().unwrap().model, "mock-model");
    }

    #[tokio::test]
    async fn test_failing_mock() {
        let provider = MockProvider::failing();
        assert!(matches!(
            provider.create_chat_completion(&request()).await,
            Err(LlmError::Api(_))
        ));
        assert!(provider
            .create_chat_completion_stream(&request())
            .await
            .is_err());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_stream_fragments_then_terminal() {
        let provider = MockProvider::new("Hello world").with_stream_fragments(vec!["Hello", " world"]);
        let mut stream = provider
            .create_chat_completion_stream(&request())
            .await
            .unwrap();

        assert_eq!(stream.recv().await.unwrap().unwrap().delta_content(), "Hello");
        assert_eq!(stream.recv().await.unwrap().unwrap().delta_content(), " world");

        let terminal = stream.recv().await.unwrap().unwrap();
        assert_eq!(terminal.delta_content(), "");
        assert_eq!(terminal.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(terminal.usage.is_some());

        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_content_stream_still_has_terminal_chunk() {
        let provider = MockProvider::new("").with_stream_fragments(vec![]);
        let mut stream = provider
            .create_chat_completion_stream(&request())
            .await
            .unwrap();

        let terminal = stream.recv().await.unwrap().unwrap();
        assert_eq!(terminal.delta_content(), "");
        assert_eq!(terminal.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_close_contract() {
        let provider = MockProvider::new("x");
        let mut stream = provider
            .create_chat_completion_stream(&request())
            .await
            .unwrap();
        stream.close().await.unwrap();
        assert!(matches!(stream.recv().await, Err(LlmError::StreamClosed)));
        stream.close().await.unwrap();
    }
}
