//! Anthropic Messages API adapter.
//!
//! Anthropic separates the system prompt from the message list: request
//! translation extracts the last system message into the top-level `system`
//! field and drops earlier ones. `max_tokens` is mandatory on this API, so a
//! default of 4096 is supplied when the caller left it unset.
//!
//! Responses carry multi-block content. The canonical `content` is the
//! concatenation of text blocks; the full block list survives under the
//! `anthropic_content` metadata key, and the stop reason under
//! `anthropic_stop_reason`, so callers can recover vendor-native structure.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{ApiError, LlmError, Result};
use crate::provider::{BoxChatStream, ChatCompletionStream, Provider};
use crate::providers::openai_compatible::default_http_client;
use crate::streaming::{ByteSource, SseReader};
use crate::types::{
    epoch_now, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, Message, ProviderMetadata, Role, ToolCall, ToolFunction,
    Usage,
};

/// Anthropic API base URL.
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

/// Required protocol-version header value.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// The Messages API requires max_tokens; used when the caller omits it.
const DEFAULT_MAX_TOKENS: u32 = 4096;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

/// Content is a plain string or an array of typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl ContentBlock {
    fn tool_result(tool_use_id: String, content: String) -> Self {
        Self {
            kind: "tool_result".to_string(),
            text: None,
            id: None,
            name: None,
            input: None,
            tool_use_id: Some(tool_use_id),
            content: Some(content),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: JsonValue,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    message: String,
}

/// Typed SSE events of the Messages streaming protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: StartMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaBlock },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaData,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    /// content_block_start/stop, ping, and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    id: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct DeltaBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaData {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

// ============================================================================
// Provider
// ============================================================================

/// Anthropic backend adapter.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    http: Client,
    api_key: String,
    base_url: String,
    api_version: String,
}

impl AnthropicProvider {
    /// Create an adapter with the given API key and default endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: default_http_client(DEFAULT_TIMEOUT)?,
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_BASE.to_string(),
            api_version: ANTHROPIC_API_VERSION.to_string(),
        })
    }

    /// Override the base URL (proxies, Anthropic-compatible servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Inject a custom HTTP client.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Override the protocol-version header.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key: HeaderValue = self
            .api_key
            .parse()
            .map_err(|_| LlmError::InvalidConfiguration("API key is not a valid header value".to_string()))?;
        let version: HeaderValue = self
            .api_version
            .parse()
            .map_err(|_| LlmError::InvalidConfiguration("API version is not a valid header value".to_string()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", version);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Translate canonical messages to the Anthropic shape.
    ///
    /// The last system message becomes the top-level system field, earlier
    /// ones are dropped; tool results become `tool_result` content blocks on
    /// a user turn.
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut wire = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system = Some(msg.content.clone()),
                Role::User => wire.push(WireMessage {
                    role: "user",
                    content: WireContent::Text(msg.content.clone()),
                }),
                Role::Assistant => wire.push(WireMessage {
                    role: "assistant",
                    content: WireContent::Text(msg.content.clone()),
                }),
                Role::Tool => {
                    let content = match &msg.tool_call_id {
                        Some(id) => WireContent::Blocks(vec![ContentBlock::tool_result(
                            id.clone(),
                            msg.content.clone(),
                        )]),
                        None => WireContent::Text(msg.content.clone()),
                    };
                    wire.push(WireMessage {
                        role: "user",
                        content,
                    });
                }
            }
        }

        (system, wire)
    }

    fn convert_tools(req: &ChatCompletionRequest) -> Option<Vec<AnthropicTool>> {
        req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    input_schema: tool.function.parameters.clone(),
                })
                .collect()
        })
    }

    fn build_request(req: &ChatCompletionRequest, stream: bool) -> MessagesRequest {
        let (system, messages) = Self::convert_messages(&req.messages);
        MessagesRequest {
            model: req.model.clone(),
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            stream: stream.then_some(true),
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: req.stop.clone(),
            tools: Self::convert_tools(req),
            tool_choice: req.tool_choice.clone(),
        }
    }

    fn translate_response(wire: MessagesResponse) -> ChatCompletionResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in &wire.content {
            match block.kind.as_str() {
                "text" => {
                    if let Some(text) = &block.text {
                        content.push_str(text);
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name), Some(input)) =
                        (&block.id, &block.name, &block.input)
                    {
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            kind: "function".to_string(),
                            function: ToolFunction {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        });
                    }
                }
                other => debug!(block_type = other, "unmapped content block"),
            }
        }

        let mut metadata = ProviderMetadata::new();
        if let Some(reason) = &wire.stop_reason {
            metadata.insert(
                "anthropic_stop_reason".to_string(),
                JsonValue::String(reason.clone()),
            );
        }
        if let Ok(blocks) = serde_json::to_value(&wire.content) {
            metadata.insert("anthropic_content".to_string(), blocks);
        }

        ChatCompletionResponse {
            id: wire.id,
            object: "chat.completion".to_string(),
            created: epoch_now(),
            model: wire.model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content,
                    name: None,
                    tool_call_id: None,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: wire.stop_reason,
                logprobs: None,
            }],
            usage: Usage::new(wire.usage.input_tokens, wire.usage.output_tokens),
            provider_metadata: metadata,
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => ApiError::new(
                "anthropic",
                status,
                envelope.error.message,
                envelope.error.kind,
                None,
            )
            .into_error(),
            Err(_) => ApiError::new("anthropic", status, body, None, None).into_error(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        req.validate()?;

        debug!(model = %req.model, messages = req.messages.len(), "messages request");

        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers()?)
            .json(&Self::build_request(req, false))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body = response.text().await?;
        let wire: MessagesResponse = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(format!("messages body: {err}")))?;

        Ok(Self::translate_response(wire))
    }

    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        req.validate()?;

        debug!(model = %req.model, "messages stream request");

        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers()?)
            .header(ACCEPT, "text/event-stream")
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

        Ok(Box::new(AnthropicStream::new(source)))
    }
}

// ============================================================================
// Streaming (dialect C: event-typed SSE state machine)
// ============================================================================

/// Stream over the Messages streaming protocol.
///
/// `message_start` captures the message id and model carried on every later
/// chunk; `message_stop` emits a final metadata-only chunk after which reads
/// report end-of-stream. Unknown event types are skipped.
pub(crate) struct AnthropicStream {
    reader: Option<SseReader>,
    message_id: String,
    model: String,
    done: bool,
}

impl AnthropicStream {
    pub(crate) fn new(source: ByteSource) -> Self {
        Self {
            reader: Some(SseReader::new(source)),
            message_id: String::new(),
            model: String::new(),
            done: false,
        }
    }

    fn chunk(&self, choices: Vec<ChunkChoice>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.message_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: epoch_now(),
            model: self.model.clone(),
            choices,
            usage,
            provider_metadata: ProviderMetadata::new(),
        }
    }

    fn metadata_chunk(&self, event: &str, raw: Option<JsonValue>) -> ChatCompletionChunk {
        let mut chunk = self.chunk(Vec::new(), None);
        chunk
            .provider_metadata
            .insert("anthropic_event".to_string(), JsonValue::String(event.to_string()));
        if let Some(raw) = raw {
            chunk
                .provider_metadata
                .insert("anthropic_raw".to_string(), raw);
        }
        chunk
    }
}

#[async_trait]
impl ChatCompletionStream for AnthropicStream {
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
            let Some(event) = next else {
                self.done = true;
                return Ok(None);
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            // The tagged payload is authoritative; the `event:` line merely
            // repeats it.
            let Ok(parsed) = serde_json::from_str::<StreamEvent>(data) else {
                continue;
            };

            match parsed {
                StreamEvent::MessageStart { message } => {
                    self.message_id = message.id;
                    self.model = message.model;
                    let raw = serde_json::from_str::<JsonValue>(data).ok();
                    return Ok(Some(self.metadata_chunk("message_start", raw)));
                }
                StreamEvent::ContentBlockDelta { delta } => {
                    if delta.kind == "text_delta" {
                        if let Some(text) = delta.text {
                            let choice = ChunkChoice {
                                index: 0,
                                delta: Some(Message::assistant(text)),
                                finish_reason: None,
                            };
                            return Ok(Some(self.chunk(vec![choice], None)));
                        }
                    }
                }
                StreamEvent::MessageDelta { delta, usage } => {
                    let usage = usage.map(|u| Usage::new(0, u.output_tokens));
                    let choices = match delta.stop_reason {
                        Some(reason) => vec![ChunkChoice {
                            index: 0,
                            delta: None,
                            finish_reason: Some(reason),
                        }],
                        None => Vec::new(),
                    };
                    return Ok(Some(self.chunk(choices, usage)));
                }
                StreamEvent::MessageStop => {
                    self.done = true;
                    return Ok(Some(self.metadata_chunk("message_stop", None)));
                }
                StreamEvent::Error { error } => {
                    return Err(ApiError::new(
                        "anthropic",
                        200,
                        error.message,
                        error.kind,
                        None,
                    )
                    .into_error());
                }
                StreamEvent::Other => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
