//! Ollama adapter for locally hosted models.
//!
//! No auth; the default timeout is 60 seconds to accommodate local cold
//! starts. Knobs live in an `options` sub-object with Ollama's names
//! (`num_predict` instead of `max_tokens`). Ollama does not assign response
//! ids, so a local one is synthesized. Streaming is newline-delimited JSON:
//! one object per line, with a `done` flag marking the terminal chunk that
//! carries the aggregated token counts.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{ApiError, LlmError, Result};
use crate::provider::{BoxChatStream, ChatCompletionStream, Provider};
use crate::providers::openai_compatible::{default_http_client, parse_role};
use crate::streaming::{ByteSource, JsonLinesReader};
use crate::types::{
    epoch_now, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, Message, ProviderMetadata, Usage,
};

/// Default Ollama host.
const OLLAMA_API_BASE: &str = "http://localhost:11434";

/// Local models can take a while to load.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Options>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

/// Generation options, Ollama naming.
#[derive(Debug, Default, Serialize)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    /// Ollama's equivalent of max_tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

impl Options {
    fn from_request(req: &ChatCompletionRequest) -> Option<Self> {
        if req.max_tokens.is_none()
            && req.temperature.is_none()
            && req.top_p.is_none()
            && req.stop.is_none()
        {
            return None;
        }
        Some(Self {
            temperature: req.temperature,
            top_p: req.top_p,
            num_predict: req.max_tokens,
            stop: req.stop.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    #[serde(default)]
    created_at: Option<String>,
    message: WireMessage,
    done: bool,
    #[serde(default)]
    total_duration: Option<i64>,
    #[serde(default)]
    load_duration: Option<i64>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_duration: Option<i64>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    eval_duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Provider
// ============================================================================

/// Ollama backend adapter.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    /// Create an adapter against the default localhost endpoint.
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: default_http_client(DEFAULT_TIMEOUT)?,
            base_url: OLLAMA_API_BASE.to_string(),
        })
    }

    /// Point at a different Ollama host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Inject a custom HTTP client.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Current base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn build_request(req: &ChatCompletionRequest, stream: bool) -> ChatRequest {
        ChatRequest {
            model: req.model.clone(),
            messages: req
                .messages
                .iter()
                .map(|msg| WireMessage {
                    role: msg.role.as_str().to_string(),
                    content: msg.content.clone(),
                })
                .collect(),
            stream,
            options: Options::from_request(req),
        }
    }

    fn timing_metadata(wire: &ChatResponse) -> ProviderMetadata {
        let mut metadata = ProviderMetadata::new();
        if let Some(created_at) = &wire.created_at {
            metadata.insert(
                "ollama_created_at".to_string(),
                JsonValue::String(created_at.clone()),
            );
        }
        for (key, value) in [
            ("ollama_total_duration", wire.total_duration),
            ("ollama_load_duration", wire.load_duration),
            ("ollama_prompt_eval_duration", wire.prompt_eval_duration),
            ("ollama_eval_duration", wire.eval_duration),
        ] {
            if let Some(value) = value {
                metadata.insert(key.to_string(), JsonValue::from(value));
            }
        }
        metadata
    }

    fn translate_response(wire: ChatResponse) -> ChatCompletionResponse {
        let metadata = Self::timing_metadata(&wire);
        let usage = Usage::new(
            wire.prompt_eval_count.unwrap_or(0),
            wire.eval_count.unwrap_or(0),
        );
        ChatCompletionResponse {
            id: format!("ollama-{}", epoch_now()),
            object: "chat.completion".to_string(),
            created: epoch_now(),
            model: wire.model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Message {
                    role: parse_role(Some(wire.message.role.as_str())),
                    content: wire.message.content,
                    name: None,
                    tool_call_id: None,
                    tool_calls: None,
                },
                finish_reason: wire.done.then(|| "stop".to_string()),
                logprobs: None,
            }],
            usage,
            provider_metadata: metadata,
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(wire) => ApiError::new("ollama", status, wire.error, None, None).into_error(),
            Err(_) => ApiError::new("ollama", status, body, None, None).into_error(),
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        req.validate()?;

        debug!(model = %req.model, messages = req.messages.len(), "ollama chat request");

        let response = self
            .http
            .post(self.endpoint())
            .json(&Self::build_request(req, false))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body = response.text().await?;
        let wire: ChatResponse = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(format!("ollama chat body: {err}")))?;

        Ok(Self::translate_response(wire))
    }

    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        req.validate()?;

        debug!(model = %req.model, "ollama chat stream request");

        let response = self
            .http
            .post(self.endpoint())
            .json(&Self::build_request(req, true))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let source: ByteSource = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(LlmError::from))
            .boxed();

        Ok(Box::new(OllamaStream::new(source)))
    }
}

// ============================================================================
// Streaming (dialect A: newline-delimited JSON)
// ============================================================================

/// Stream of canonical chunks over an Ollama NDJSON body.
///
/// Every line is one chunk; `done: true` marks the terminal chunk carrying
/// usage. End-of-stream is the closure of the underlying body.
pub(crate) struct OllamaStream {
    reader: Option<JsonLinesReader<ChatResponse>>,
    stream_id: String,
}

impl OllamaStream {
    pub(crate) fn new(source: ByteSource) -> Self {
        Self {
            reader: Some(JsonLinesReader::new(source)),
            stream_id: format!("ollama-stream-{}", epoch_now()),
        }
    }

    fn translate_chunk(&self, wire: ChatResponse) -> ChatCompletionChunk {
        let usage = if wire.done && wire.eval_count.unwrap_or(0) > 0 {
            Some(Usage::new(
                wire.prompt_eval_count.unwrap_or(0),
                wire.eval_count.unwrap_or(0),
            ))
        } else {
            None
        };
        let metadata = OllamaProvider::timing_metadata(&wire);

        ChatCompletionChunk {
            id: self.stream_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: epoch_now(),
            model: wire.model,
            choices: vec![ChunkChoice {
                index: 0,
                delta: Some(Message {
                    role: parse_role(Some(wire.message.role.as_str())),
                    content: wire.message.content,
                    name: None,
                    tool_call_id: None,
                    tool_calls: None,
                }),
                finish_reason: wire.done.then(|| "stop".to_string()),
            }],
            usage,
            provider_metadata: metadata,
        }
    }
}

#[async_trait]
impl ChatCompletionStream for OllamaStream {
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>> {
        let next = match self.reader.as_mut() {
            Some(reader) => reader.next().await?,
            None => return Err(LlmError::StreamClosed),
        };
        match next {
            Some(wire) => Ok(Some(self.translate_chunk(wire))),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
