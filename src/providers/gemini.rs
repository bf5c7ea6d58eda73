//! Google Gemini adapter over the generativelanguage REST API.
//!
//! System messages map to `systemInstruction` (last one wins, matching the
//! Anthropic-class split) and the assistant role maps to Gemini's `model`
//! role. Streaming uses `:streamGenerateContent?alt=sse`, which yields
//! standard `data:` lines, one `GenerateContentResponse` each, with no
//! terminating sentinel.
//!
//! Token counts from Gemini are unreliable; when `usageMetadata` is missing
//! the adapter estimates at roughly four characters per token and flags the
//! estimate with `gemini_usage_estimated` in provider metadata.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{ApiError, LlmError, Result};
use crate::provider::{BoxChatStream, ChatCompletionStream, Provider};
use crate::providers::openai_compatible::default_http_client;
use crate::streaming::{ByteSource, SseReader};
use crate::types::{
    epoch_now, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, Message, ProviderMetadata, Role, Usage,
};

/// Gemini REST API base URL.
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Rough token estimate used when the API omits usage metadata.
const CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl Candidate {
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|content| {
                content
                    .parts
                    .iter()
                    .map(|part| part.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    message: String,
    #[serde(default)]
    status: Option<String>,
}

// ============================================================================
// Provider
// ============================================================================

/// Google Gemini backend adapter.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    /// Create an adapter with the given API key and default endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: default_http_client(DEFAULT_TIMEOUT)?,
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
        })
    }

    /// Override the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Inject a custom HTTP client.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    fn endpoint(&self, model: &str, action: &str, sse: bool) -> String {
        let alt = if sse { "alt=sse&" } else { "" };
        format!(
            "{}/models/{}:{}?{}key={}",
            self.base_url, model, action, alt, self.api_key
        )
    }

    fn build_request(req: &ChatCompletionRequest) -> GenerateContentRequest {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => {
                    system_instruction = Some(Content {
                        parts: vec![Part {
                            text: msg.content.clone(),
                        }],
                        role: None,
                    });
                }
                Role::Assistant => contents.push(Content {
                    parts: vec![Part {
                        text: msg.content.clone(),
                    }],
                    role: Some("model".to_string()),
                }),
                Role::User | Role::Tool => contents.push(Content {
                    parts: vec![Part {
                        text: msg.content.clone(),
                    }],
                    role: Some("user".to_string()),
                }),
            }
        }

        let generation_config = if req.max_tokens.is_none()
            && req.temperature.is_none()
            && req.top_p.is_none()
            && req.stop.is_none()
        {
            None
        } else {
            Some(GenerationConfig {
                max_output_tokens: req.max_tokens,
                temperature: req.temperature,
                top_p: req.top_p,
                stop_sequences: req.stop.clone(),
            })
        };

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }

    fn estimate_tokens(text_chars: usize) -> u32 {
        (text_chars / CHARS_PER_TOKEN) as u32
    }

    /// Usage from the API when available, else a flagged estimate.
    fn resolve_usage(
        usage_metadata: Option<UsageMetadata>,
        req: &ChatCompletionRequest,
        completion_text: &str,
        metadata: &mut ProviderMetadata,
    ) -> Usage {
        match usage_metadata {
            Some(wire) if wire.total_token_count > 0 => Usage {
                prompt_tokens: wire.prompt_token_count,
                completion_tokens: wire.candidates_token_count,
                total_tokens: wire.total_token_count,
            },
            _ => {
                let prompt_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
                metadata.insert(
                    "gemini_usage_estimated".to_string(),
                    JsonValue::Bool(true),
                );
                Usage::new(
                    Self::estimate_tokens(prompt_chars),
                    Self::estimate_tokens(completion_text.len()),
                )
            }
        }
    }

    fn translate_response(
        wire: GenerateContentResponse,
        req: &ChatCompletionRequest,
    ) -> ChatCompletionResponse {
        let mut metadata = ProviderMetadata::new();
        let candidates = wire.candidates.unwrap_or_default();

        let choices: Vec<ChatCompletionChoice> = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| ChatCompletionChoice {
                index: index as u32,
                message: Message::assistant(candidate.text()),
                finish_reason: candidate.finish_reason.clone(),
                logprobs: None,
            })
            .collect();

        let completion_text = choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = Self::resolve_usage(wire.usage_metadata, req, &completion_text, &mut metadata);

        ChatCompletionResponse {
            id: format!("gemini-{}", epoch_now()),
            object: "chat.completion".to_string(),
            created: epoch_now(),
            model: req.model.clone(),
            choices,
            usage,
            provider_metadata: metadata,
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => ApiError::new(
                "gemini",
                status,
                envelope.error.message,
                envelope.error.status,
                envelope.error.code.map(|code| code.to_string()),
            )
            .into_error(),
            Err(_) => ApiError::new("gemini", status, body, None, None).into_error(),
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        req.validate()?;

        debug!(model = %req.model, messages = req.messages.len(), "gemini generate request");

        let response = self
            .http
            .post(self.endpoint(&req.model, "generateContent", false))
            .json(&Self::build_request(req))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body = response.text().await?;
        let wire: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(format!("gemini body: {err}")))?;

        Ok(Self::translate_response(wire, req))
    }

    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        req.validate()?;

        debug!(model = %req.model, "gemini stream request");

        let response = self
            .http
            .post(self.endpoint(&req.model, "streamGenerateContent", true))
            .header(ACCEPT, "text/event-stream")
            .json(&Self::build_request(req))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let source: ByteSource = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(LlmError::from))
            .boxed();

        Ok(Box::new(GeminiStream::new(req.model.clone(), source)))
    }
}

// ============================================================================
// Streaming (SSE, no sentinel: EOF terminates)
// ============================================================================

pub(crate) struct GeminiStream {
    reader: Option<SseReader>,
    stream_id: String,
    model: String,
}

impl GeminiStream {
    pub(crate) fn new(model: String, source: ByteSource) -> Self {
        Self {
            reader: Some(SseReader::new(source)),
            stream_id: format!("gemini-{}", epoch_now()),
            model,
        }
    }

    fn translate_chunk(&self, wire: GenerateContentResponse) -> ChatCompletionChunk {
        let candidates = wire.candidates.unwrap_or_default();
        let choices = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| ChunkChoice {
                index: index as u32,
                delta: Some(Message::assistant(candidate.text())),
                finish_reason: candidate.finish_reason.clone(),
            })
            .collect();

        let usage = wire
            .usage_metadata
            .filter(|u| u.total_token_count > 0)
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            });

        ChatCompletionChunk {
            id: self.stream_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: epoch_now(),
            model: self.model.clone(),
            choices,
            usage,
            provider_metadata: ProviderMetadata::new(),
        }
    }
}

#[async_trait]
impl ChatCompletionStream for GeminiStream {
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>> {
        if self.reader.is_none() {
            return Err(LlmError::StreamClosed);
        }

        loop {
            let next = match self.reader.as_mut() {
                Some(reader) => reader.next_event().await?,
                None => return Err(LlmError::StreamClosed),
            };
            let Some(event) = next else {
                return Ok(None);
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<GenerateContentResponse>(data) {
                Ok(wire) => return Ok(Some(self.translate_chunk(wire))),
                Err(_) => continue,
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

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::new(
            "gemini-2.5-flash",
            vec![Message::system("be terse"), Message::user("hello there")],
        )
    }

    #[test]
    fn test_endpoint_includes_key_and_alt() {
        let provider = GeminiProvider::new("test-key").unwrap();
        let url = provider.endpoint("gemini-2.5-flash", "generateContent", false);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent?key=test-key"
        );
        let stream_url = provider.endpoint("gemini-2.5-flash", "streamGenerateContent", true);
        assert!(stream_url.contains("streamGenerateContent?alt=sse&key=test-key"));
    }

    #[test]
    fn test_build_request_roles() {
        let req = ChatCompletionRequest::new(
            "gemini-2.5-flash",
            vec![
                Message::system("sys"),
                Message::user("u1"),
                Message::assistant("a1"),
            ],
        );
        let wire = GeminiProvider::build_request(&req);
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "sys");
        let contents = json["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_generation_config_camel_case() {
        let mut req = request();
        req.max_tokens = Some(64);
        req.temperature = Some(0.5);
        let wire = GeminiProvider::build_request(&req);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(json["generationConfig"]["temperature"], 0.5);
    }

    #[test]
    fn test_translate_uses_reported_usage() {
        let wire: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "hi"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5
                }
            }"#,
        )
        .unwrap();

        let resp = GeminiProvider::translate_response(wire, &request());
        assert_eq!(resp.content(), "hi");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("STOP"));
        assert_eq!(resp.usage.total_tokens, 5);
        assert!(!resp.provider_metadata.contains_key("gemini_usage_estimated"));
    }

    #[test]
    fn test_translate_estimates_usage_when_missing() {
        let wire: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "twelve chars"}]}}]}"#,
        )
        .unwrap();

        let req = request();
        let resp = GeminiProvider::translate_response(wire, &req);
        // "be terse" + "hello there" = 19 chars -> 4 tokens; 12 chars -> 3.
        assert_eq!(resp.usage.prompt_tokens, 4);
        assert_eq!(resp.usage.completion_tokens, 3);
        assert_eq!(
            resp.provider_metadata["gemini_usage_estimated"],
            serde_json::json!(true)
        );
    }

    #[tokio::test]
    async fn test_stream_translates_candidates() {
        let body: &[u8] = b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":2,\"candidatesTokenCount\":1,\"totalTokenCount\":3}}\n\n";
        let mut stream = GeminiStream::new("gemini-2.5-flash".to_string(), byte_source_from(vec![body]));

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.delta_content(), "Hel");
        assert_eq!(first.model, "gemini-2.5-flash");

        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(second.delta_content(), "lo");
        assert_eq!(second.choices[0].finish_reason.as_deref(), Some("STOP"));
        assert_eq!(second.usage.unwrap().total_tokens, 3);

        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_close_contract() {
        let mut stream = GeminiStream::new("m".to_string(), byte_source_from(vec![b"data: {}\n\n"]));
        stream.close().await.unwrap();
        assert!(matches!(stream.recv().await, Err(LlmError::StreamClosed)));
        stream.close().await.unwrap();
    }
}
