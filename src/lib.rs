//! unillm — one contract for many chat-completion backends.
//!
//! A caller builds a [`ChatCompletionRequest`] once against the canonical
//! types and runs it against any configured backend: OpenAI, Anthropic,
//! Google Gemini, AWS Bedrock (behind the `bedrock` feature), X.AI Grok, or
//! a self-hosted Ollama. Responses come back fully materialized or as a
//! normalized stream of [`ChatCompletionChunk`]s, regardless of whether the
//! vendor speaks newline-delimited JSON, sentinel-terminated SSE, or
//! Anthropic's event-typed SSE.
//!
//! Third-party backends implement the [`Provider`] trait and plug in via
//! [`ClientConfig::custom_provider`]. Optional extras: a conversation
//! [`MemoryManager`] persisting per-session history in any
//! [`KeyValueStore`], and an [`ObservabilityHook`] with correlated
//! before/after callbacks and stream wrapping.
//!
//! # Example
//!
//! ```no_run
//! use unillm::{
//!     ChatClient, ChatCompletionRequest, ChatCompletionStream, ClientConfig, Message,
//!     ProviderName,
//! };
//!
//! # async fn run() -> unillm::Result<()> {
//! let client = ChatClient::new(ClientConfig::for_provider(
//!     ProviderName::OpenAi,
//!     std::env::var("OPENAI_API_KEY").unwrap_or_default(),
//! ))
//! .await?;
//!
//! let req = ChatCompletionRequest::new("gpt-4o-mini", vec![Message::user("Hello!")]);
//! let resp = client.create_chat_completion(&req).await?;
//! println!("{}", resp.content());
//!
//! let mut stream = client.create_chat_completion_stream(&req).await?;
//! while let Some(chunk) = stream.recv().await? {
//!     print!("{}", chunk.delta_content());
//! }
//! stream.close().await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate never retries; transient-failure policy belongs to the
//! injectable `reqwest::Client`.

pub mod client;
pub mod error;
pub mod memory;
pub mod observability;
pub mod provider;
pub mod providers;
pub(crate) mod streaming;
pub mod types;

pub use client::{ChatClient, ClientConfig, ProviderName};
pub use error::{ApiError, LlmError, Result};
pub use memory::{
    ConversationMemory, InMemoryStore, KeyValueStore, MemoryConfig, MemoryManager,
};
pub use observability::{call_span, LlmCallInfo, ObservabilityHook};
pub use provider::{BoxChatStream, ChatCompletionStream, Provider};
pub use providers::anthropic::AnthropicProvider;
#[cfg(feature = "bedrock")]
pub use providers::bedrock::BedrockProvider;
pub use providers::gemini::GeminiProvider;
pub use providers::mock::MockProvider;
pub use providers::ollama::OllamaProvider;
pub use providers::openai::OpenAiProvider;
pub use providers::xai::XaiProvider;
pub use types::{
    ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChunkChoice, Message, ProviderMetadata, Role, Tool, ToolCall, ToolFunction, ToolSpec, Usage,
};
