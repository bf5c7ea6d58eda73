//! Shared core for OpenAI-dialect backends (OpenAI itself, X.AI Grok).
//!
//! The canonical request already speaks this dialect, so request translation
//! is a passthrough with the stream flag pinned. Responses and stream chunks
//! are decoded from private wire structs and mapped onto the canonical
//! types, with non-canonical fields preserved in provider metadata.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{ApiError, LlmError, Result};
use crate::provider::{BoxChatStream, ChatCompletionStream};
use crate::streaming::{ByteSource, SseReader};
use crate::types::{
    epoch_now, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, Message, ProviderMetadata, Role, ToolCall, Usage,
};

/// Default timeout for remote OpenAI-compatible endpoints.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sentinel terminating an OpenAI-style SSE stream.
const DONE_SENTINEL: &str = "[DONE]";

pub(crate) fn default_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| LlmError::InvalidConfiguration(format!("http client: {err}")))
}

/// Map a wire role string onto the canonical enum. Deltas may omit the role
/// entirely; assistant is the only role a completion can speak with.
pub(crate) fn parse_role(role: Option<&str>) -> Role {
    match role {
        Some("system") => Role::System,
        Some("user") => Role::User,
        Some("tool") => Role::Tool,
        _ => Role::Assistant,
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    system_fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: Option<u32>,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<JsonValue>,
}

// ============================================================================
// HTTP core
// ============================================================================

/// HTTP client bound to one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiCompatibleClient {
    http: Client,
    base_url: String,
    api_key: String,
    provider_name: &'static str,
}

impl OpenAiCompatibleClient {
    pub(crate) fn new(
        provider_name: &'static str,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            http: default_http_client(DEFAULT_TIMEOUT)?,
            base_url: base_url.into(),
            api_key: api_key.into(),
            provider_name,
        })
    }

    pub(crate) fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = base_url.into();
    }

    pub(crate) fn set_http_client(&mut self, client: Client) {
        self.http = client;
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn with_stream(req: &ChatCompletionRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            stream: Some(stream),
            ..req.clone()
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<WireErrorEnvelope>(&body) {
            Ok(envelope) => {
                let code = envelope.error.code.map(|code| match code {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                });
                ApiError::new(
                    self.provider_name,
                    status,
                    envelope.error.message,
                    envelope.error.error_type,
                    code,
                )
                .into_error()
            }
            Err(_) => ApiError::new(self.provider_name, status, body, None, None).into_error(),
        }
    }

    fn translate_response(&self, wire: WireResponse) -> ChatCompletionResponse {
        let mut metadata = ProviderMetadata::new();
        if let Some(fingerprint) = wire.system_fingerprint {
            metadata.insert(
                format!("{}_system_fingerprint", self.provider_name),
                JsonValue::String(fingerprint),
            );
        }

        let choices = wire
            .choices
            .into_iter()
            .enumerate()
            .map(|(position, choice)| ChatCompletionChoice {
                index: choice.index.unwrap_or(position as u32),
                message: Message {
                    role: parse_role(choice.message.role.as_deref()),
                    content: choice.message.content.unwrap_or_default(),
                    name: None,
                    tool_call_id: None,
                    tool_calls: choice.message.tool_calls,
                },
                finish_reason: choice.finish_reason,
                logprobs: choice.logprobs,
            })
            .collect();

        ChatCompletionResponse {
            id: wire.id,
            object: wire.object.unwrap_or_else(|| "chat.completion".to_string()),
            created: wire.created.unwrap_or_else(epoch_now),
            model: wire.model,
            choices,
            usage: wire.usage.map(Usage::from).unwrap_or_default(),
            provider_metadata: metadata,
        }
    }

    pub(crate) async fn create_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        req.validate()?;

        debug!(model = %req.model, messages = req.messages.len(), "chat completion request");

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&Self::with_stream(req, false))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body = response.text().await?;
        let wire: WireResponse = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(format!("chat completion body: {err}")))?;

        Ok(self.translate_response(wire))
    }

    pub(crate) async fn create_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        req.validate()?;

        debug!(model = %req.model, "chat completion stream request");

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&Self::with_stream(req, true))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let source: ByteSource = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(LlmError::from))
            .boxed();

        Ok(Box::new(SseChunkStream::new(source)))
    }
}

// ============================================================================
// Streaming (dialect B: SSE terminated by a sentinel)
// ============================================================================

/// Stream of canonical chunks over an OpenAI-style SSE body.
///
/// `data: [DONE]` signals end-of-stream; malformed payloads are skipped.
pub(crate) struct SseChunkStream {
    reader: Option<SseReader>,
    done: bool,
}

impl SseChunkStream {
    pub(crate) fn new(source: ByteSource) -> Self {
        Self {
            reader: Some(SseReader::new(source)),
            done: false,
        }
    }

    fn translate_chunk(wire: WireChunk) -> ChatCompletionChunk {
        let choices = wire
            .choices
            .into_iter()
            .enumerate()
            .map(|(position, choice)| ChunkChoice {
                index: choice.index.unwrap_or(position as u32),
                delta: choice.delta.map(|delta| Message {
                    role: parse_role(delta.role.as_deref()),
                    content: delta.content.unwrap_or_default(),
                    name: None,
                    tool_call_id: None,
                    tool_calls: None,
                }),
                finish_reason: choice.finish_reason,
            })
            .collect();

        ChatCompletionChunk {
            id: wire.id.unwrap_or_default(),
            object: wire
                .object
                .unwrap_or_else(|| "chat.completion.chunk".to_string()),
            created: wire.created.unwrap_or_else(epoch_now),
            model: wire.model.unwrap_or_default(),
            choices,
            usage: wire.usage.map(Usage::from),
            provider_metadata: ProviderMetadata::new(),
        }
    }
}

#[async_trait::async_trait]
impl ChatCompletionStream for SseChunkStream {
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>> {
        if self.reader.is_none() {
            return Err(LlmError::StreamClosed);
        }
        if self.done {
            return Ok(None);
        }

        loop {
            let next = match self.reader.as_mut() {
                Some(reader) => reader.next_event().await?,
                None => return Err(LlmError::StreamClosed),
            };
            match next {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == DONE_SENTINEL {
                        self.done = true;
                        return Ok(None);
                    }
                    match serde_json::from_str::<WireChunk>(data) {
                        Ok(wire) => return Ok(Some(Self::translate_chunk(wire))),
                        // Malformed payloads are skipped, not fatal.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::byte_source_from;

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role(Some("system")), Role::System);
        assert_eq!(parse_role(Some("user")), Role::User);
        assert_eq!(parse_role(Some("assistant")), Role::Assistant);
        assert_eq!(parse_role(Some("tool")), Role::Tool);
        assert_eq!(parse_role(None), Role::Assistant);
        assert_eq!(parse_role(Some("weird")), Role::Assistant);
    }

    #[test]
    fn test_translate_response_maps_fields() {
        let client = OpenAiCompatibleClient::new("openai", "k", "https://api.openai.com/v1")
            .expect("client");
        let wire: WireResponse = serde_json::from_str(
            r#"{
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-4o",
                "system_fingerprint": "fp_1",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hi there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}
            }"#,
        )
        .unwrap();

        let resp = client.translate_response(wire);
        assert_eq!(resp.id, "chatcmpl-1");
        assert_eq!(resp.content(), "hi there");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.total_tokens, 9);
        assert_eq!(
            resp.provider_metadata["openai_system_fingerprint"],
            serde_json::json!("fp_1")
        );
    }

    #[tokio::test]
    async fn test_stream_done_sentinel_terminates() {
        let body: &[u8] = b"data: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\ndata: [DONE]\n\n";
        let mut stream = SseChunkStream::new(byte_source_from(vec![body]));

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.id, "c1");
        assert_eq!(first.delta_content(), "Hello");

        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(second.delta_content(), " world");

        assert!(stream.recv().await.unwrap().is_none());
        // End-of-stream is stable across repeated reads.
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_payloads() {
        let body: &[u8] =
            b"data: not json\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: [DONE]\n\n";
        let mut stream = SseChunkStream::new(byte_source_from(vec![body]));
        let chunk = stream.recv().await.unwrap().unwrap();
        assert_eq!(chunk.delta_content(), "ok");
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_terminal_chunk_carries_finish_and_usage() {
        let body: &[u8] = b"data: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5,\"total_tokens\":8}}\n\ndata: [DONE]\n\n";
        let mut stream = SseChunkStream::new(byte_source_from(vec![body]));
        let chunk = stream.recv().await.unwrap().unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunk.usage.unwrap().total_tokens, 8);
    }

    #[tokio::test]
    async fn test_stream_recv_after_close_fails() {
        let body: &[u8] = b"data: [DONE]\n\n";
        let mut stream = SseChunkStream::new(byte_source_from(vec![body]));
        stream.close().await.unwrap();
        assert!(matches!(stream.recv().await, Err(LlmError::StreamClosed)));
        // Close is idempotent.
        stream.close().await.unwrap();
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_eof_without_sentinel_ends_cleanly() {
        let body: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n";
        let mut stream = SseChunkStream::new(byte_source_from(vec![body]));
        assert_eq!(stream.recv().await.unwrap().unwrap().delta_content(), "x");
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_completion_validates_request() {
        let client =
            OpenAiCompatibleClient::new("openai", "k", "https://api.openai.com/v1").unwrap();
        let empty_model = ChatCompletionRequest::new("", vec![Message::user("hi")]);
        assert!(matches!(
            client.create_completion(&empty_model).await,
            Err(LlmError::EmptyModel)
        ));
        let empty_messages = ChatCompletionRequest::new("gpt-4o", vec![]);
        assert!(matches!(
            client.create_completion_stream(&empty_messages).await,
            Err(LlmError::EmptyMessages)
        ));
    }
}
