//! Canonical request, response and streaming types.
//!
//! These are the lingua franca of the crate: callers build a
//! [`ChatCompletionRequest`] once and run it against any adapter. Optional
//! sampling knobs are `Option<T>` so "vendor default" stays distinguishable
//! from an explicit value; serialization omits absent fields to keep that
//! distinction on the wire.
//!
//! Vendor fields with no canonical home travel in [`ProviderMetadata`], a
//! string-keyed bag namespaced per provider (`anthropic_*`, `ollama_*`, ...).
//! Removing the bag never changes the behavior of a caller that ignores it.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{LlmError, Result};

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System directive, preserved across memory pruning.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool/function result.
    Tool,
}

impl Role {
    /// String form as used on every supported wire dialect.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool function call requested by the model. Passed through verbatim;
/// the crate never executes tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call.
    pub id: String,

    /// Tool kind, `"function"` for every current vendor.
    #[serde(rename = "type")]
    pub kind: String,

    /// The function being called.
    pub function: ToolFunction,
}

/// Function name plus its JSON-encoded argument string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolSpec,
}

/// Tool specification: name, description and a JSON Schema for parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

/// A chat message. Immutable once appended to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    /// UTF-8 text content. Empty is legal (e.g. a delta carrying only a
    /// role switch).
    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Set on tool-role messages to link them to the originating call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls made by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a tool result message responding to `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// Request for a chat completion against any backend.
///
/// Absent knobs mean "vendor default"; adapters must never substitute zero
/// for absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,

    pub messages: Vec<Message>,

    /// Maximum output tokens; must be ≥ 1 when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, i32>>,

    /// Opaque end-user tag forwarded to vendors that accept one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Tool-choice directive, forwarded verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<JsonValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    /// Create a request with just a model and messages.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Validate request-side invariants shared by every adapter.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(LlmError::EmptyModel);
        }
        if self.messages.is_empty() {
            return Err(LlmError::EmptyMessages);
        }
        if let Some(max) = self.max_tokens {
            if max == 0 {
                return Err(LlmError::InvalidRequest(
                    "max_tokens must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Aggregated token usage for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage from prompt/completion counts, deriving the total.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Vendor-specific fields preserved losslessly alongside the canonical view.
pub type ProviderMetadata = HashMap<String, JsonValue>;

/// A single completion choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: u32,

    pub message: Message,

    pub finish_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<JsonValue>,
}

/// Fully materialized response to a chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,

    /// Object kind, `"chat.completion"` for every adapter.
    pub object: String,

    /// Creation time in epoch seconds.
    pub created: i64,

    /// Model id echoed back by the vendor.
    pub model: String,

    pub choices: Vec<ChatCompletionChoice>,

    pub usage: Usage,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provider_metadata: ProviderMetadata,
}

impl ChatCompletionResponse {
    /// Content of the first choice, or `""` when there are no choices.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

/// A single choice on a streaming chunk: a delta, a finish reason, or both
/// on the terminal chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,

    pub finish_reason: Option<String>,
}

/// Streaming analogue of [`ChatCompletionResponse`].
///
/// Metadata-only chunks (empty `choices`) are legal; Anthropic's
/// `message_start`/`message_stop` events surface this way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,

    /// Object kind, `"chat.completion.chunk"`.
    pub object: String,

    pub created: i64,

    pub model: String,

    pub choices: Vec<ChunkChoice>,

    /// Usage, usually only on the terminal chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provider_metadata: ProviderMetadata,
}

impl ChatCompletionChunk {
    /// Delta content of the first choice, or `""`.
    pub fn delta_content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .map(|d| d.content.as_str())
            .unwrap_or("")
    }
}

/// Current time in epoch seconds, for synthesized `created` fields.
pub(crate) fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_value(Role::System).unwrap(), "system");
        assert_eq!(serde_json::to_value(Role::Tool).unwrap(), "tool");
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::system("be brief");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "be brief");

        let msg = Message::tool_result("call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_message_serialization_omits_absent_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_request_serialization_omits_absent_knobs() {
        let req = ChatCompletionRequest::new("gpt-4o", vec![Message::user("hi")]);
        let json = serde_json::to_value(&req).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("model"));
        assert!(obj.contains_key("messages"));
        assert!(!obj.contains_key("max_tokens"));
        assert!(!obj.contains_key("temperature"));
        assert!(!obj.contains_key("stream"));
    }

    #[test]
    fn test_request_explicit_zero_temperature_survives() {
        let mut req = ChatCompletionRequest::new("m", vec![Message::user("hi")]);
        req.temperature = Some(0.0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["temperature"], 0.0);
    }

    #[test]
    fn test_request_validate() {
        let ok = ChatCompletionRequest::new("m", vec![Message::user("hi")]);
        assert!(ok.validate().is_ok());

        let no_model = ChatCompletionRequest::new("", vec![Message::user("hi")]);
        assert!(matches!(no_model.validate(), Err(LlmError::EmptyModel)));

        let no_messages = ChatCompletionRequest::new("m", vec![]);
        assert!(matches!(
            no_messages.validate(),
            Err(LlmError::EmptyMessages)
        ));

        let mut zero_max = ChatCompletionRequest::new("m", vec![Message::user("hi")]);
        zero_max.max_tokens = Some(0);
        assert!(matches!(
            zero_max.validate(),
            Err(LlmError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_usage_new_derives_total() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_response_content_helper() {
        let resp = ChatCompletionResponse {
            id: "r1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Message::assistant("hello"),
                finish_reason: Some("stop".to_string()),
                logprobs: None,
            }],
            usage: Usage::default(),
            provider_metadata: ProviderMetadata::new(),
        };
        assert_eq!(resp.content(), "hello");

        let empty = ChatCompletionResponse {
            choices: vec![],
            ..resp
        };
        assert_eq!(empty.content(), "");
    }

    #[test]
    fn test_chunk_metadata_omitted_when_empty() {
        let chunk = ChatCompletionChunk {
            id: "c1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![],
            usage: None,
            provider_metadata: ProviderMetadata::new(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert!(!json.as_object().unwrap().contains_key("provider_metadata"));
        assert!(!json.as_object().unwrap().contains_key("usage"));
    }

    #[test]
    fn test_tool_call_roundtrip() {
        let call = ToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: ToolFunction {
                name: "get_weather".to_string(),
                arguments: r#"{"city":"Paris"}"#.to_string(),
            },
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        let back: ToolCall = serde_json::from_value(json).unwrap();
        assert_eq!(back, call);
    }
}
