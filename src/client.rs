//! Client facade: the single object a caller constructs.
//!
//! Dispatches to the configured backend adapter, interposes the
//! observability hook, and integrates the conversation memory manager. The
//! facade owns its adapter (closing the facade closes the adapter) and is
//! safe for concurrent use; its fields are immutable after construction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{warn, Instrument};

use crate::error::{LlmError, Result};
use crate::memory::{ConversationMemory, KeyValueStore, MemoryConfig, MemoryManager};
use crate::observability::{call_span, LlmCallInfo, ObservabilityHook};
use crate::provider::{BoxChatStream, ChatCompletionStream, Provider};
use crate::providers::anthropic::AnthropicProvider;
use crate::providers::gemini::GeminiProvider;
use crate::providers::ollama::OllamaProvider;
use crate::providers::openai::OpenAiProvider;
use crate::providers::xai::XaiProvider;
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Message};

/// Built-in backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    OpenAi,
    Anthropic,
    Bedrock,
    Ollama,
    Gemini,
    Xai,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::OpenAi => "openai",
            ProviderName::Anthropic => "anthropic",
            ProviderName::Bedrock => "bedrock",
            ProviderName::Ollama => "ollama",
            ProviderName::Gemini => "gemini",
            ProviderName::Xai => "xai",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for building a [`ChatClient`].
///
/// `custom_provider` takes precedence over the provider-name enum even when
/// both are set, letting third-party backends plug in without a registry.
#[derive(Default)]
pub struct ClientConfig {
    /// Built-in adapter selector.
    pub provider: Option<ProviderName>,

    /// API key for key-backed vendors. Ollama and Bedrock do not use one.
    pub api_key: Option<String>,

    /// Base URL override for HTTP-backed vendors.
    pub base_url: Option<String>,

    /// AWS region (Bedrock only).
    pub region: Option<String>,

    /// Injected HTTP transport; adapters build a default with a per-vendor
    /// timeout when absent. Retry/backoff policy lives here, not in the
    /// crate.
    pub http_client: Option<reqwest::Client>,

    /// Third-party backend, used verbatim when present.
    pub custom_provider: Option<Box<dyn Provider>>,

    /// Key/value store enabling conversation memory.
    pub kv_store: Option<Arc<dyn KeyValueStore>>,

    /// Memory tuning; defaults apply when a store is set and this is not.
    pub memory: Option<MemoryConfig>,

    /// Observability hook invoked around every call.
    pub hook: Option<Arc<dyn ObservabilityHook>>,

    /// Vendor-specific future options; unrecognized keys are ignored.
    pub extra: HashMap<String, JsonValue>,
}

impl ClientConfig {
    /// Config for a built-in provider with an API key.
    pub fn for_provider(provider: ProviderName, api_key: impl Into<String>) -> Self {
        Self {
            provider: Some(provider),
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    fn require_api_key(&self) -> Result<String> {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(LlmError::EmptyApiKey),
        }
    }
}

/// The unified chat client.
pub struct ChatClient {
    provider: Box<dyn Provider>,
    memory: Option<MemoryManager>,
    hook: Option<Arc<dyn ObservabilityHook>>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("provider", &self.provider.name())
            .field("memory", &self.memory.is_some())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl ChatClient {
    /// Resolve the adapter and build a client.
    ///
    /// Fails with [`LlmError::UnsupportedProvider`] when no adapter can be
    /// resolved and [`LlmError::EmptyApiKey`] when the chosen built-in
    /// requires a key and none is present.
    pub async fn new(mut config: ClientConfig) -> Result<Self> {
        let provider: Box<dyn Provider> = match config.custom_provider.take() {
            Some(custom) => custom,
            None => match config.provider {
                Some(ProviderName::OpenAi) => {
                    let mut p = OpenAiProvider::new(config.require_api_key()?)?;
                    if let Some(url) = &config.base_url {
                        p = p.with_base_url(url);
                    }
                    if let Some(http) = &config.http_client {
                        p = p.with_http_client(http.clone());
                    }
                    Box::new(p)
                }
                Some(ProviderName::Anthropic) => {
                    let mut p = AnthropicProvider::new(config.require_api_key()?)?;
                    if let Some(url) = &config.base_url {
                        p = p.with_base_url(url);
                    }
                    if let Some(http) = &config.http_client {
                        p = p.with_http_client(http.clone());
                    }
                    Box::new(p)
                }
                Some(ProviderName::Xai) => {
                    let mut p = XaiProvider::new(config.require_api_key()?)?;
                    if let Some(url) = &config.base_url {
                        p = p.with_base_url(url);
                    }
                    if let Some(http) = &config.http_client {
                        p = p.with_http_client(http.clone());
                    }
                    Box::new(p)
                }
                Some(ProviderName::Gemini) => {
                    let mut p = GeminiProvider::new(config.require_api_key()?)?;
                    if let Some(url) = &config.base_url {
                        p = p.with_base_url(url);
                    }
                    if let Some(http) = &config.http_client {
                        p = p.with_http_client(http.clone());
                    }
                    Box::new(p)
                }
                Some(ProviderName::Ollama) => {
                    let mut p = OllamaProvider::new()?;
                    if let Some(url) = &config.base_url {
                        p = p.with_base_url(url);
                    }
                    if let Some(http) = &config.http_client {
                        p = p.with_http_client(http.clone());
                    }
                    Box::new(p)
                }
                Some(ProviderName::Bedrock) => Self::build_bedrock(&config).await?,
                None => {
                    return Err(LlmError::UnsupportedProvider(
                        "no provider configured".to_string(),
                    ))
                }
            },
        };

        let memory = config
            .kv_store
            .take()
            .map(|store| MemoryManager::new(store, config.memory.take().unwrap_or_default()));

        Ok(Self {
            provider,
            memory,
            hook: config.hook,
        })
    }

    #[cfg(feature = "bedrock")]
    async fn build_bedrock(config: &ClientConfig) -> Result<Box<dyn Provider>> {
        use crate::providers::bedrock::BedrockProvider;
        Ok(Box::new(BedrockProvider::new(config.region.clone()).await?))
    }

    #[cfg(not(feature = "bedrock"))]
    async fn build_bedrock(_config: &ClientConfig) -> Result<Box<dyn Provider>> {
        Err(LlmError::UnsupportedProvider(
            "bedrock (crate built without the `bedrock` feature)".to_string(),
        ))
    }

    /// The underlying adapter.
    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    /// The memory manager, when a key/value store was configured.
    pub fn memory(&self) -> Option<&MemoryManager> {
        self.memory.as_ref()
    }

    /// Whether conversation memory is configured.
    pub fn has_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// Close the client, releasing the adapter's resources.
    pub async fn close(&self) -> Result<()> {
        self.provider.close().await
    }

    /// Create a chat completion, running the observability hook around the
    /// adapter call.
    pub async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let info = LlmCallInfo::begin(self.provider.name());
        let span = call_span(&info);

        async {
            if let Some(hook) = &self.hook {
                hook.before_request(&info, req).await;
            }

            let result = self.provider.create_chat_completion(req).await;

            if let Some(hook) = &self.hook {
                hook.after_response(&info, req, result.as_ref().ok(), result.as_ref().err())
                    .await;
            }

            result
        }
        .instrument(span)
        .await
    }

    /// Create a streaming chat completion.
    ///
    /// On stream-construction failure the hook's `after_response` fires with
    /// the error; on success the hook may wrap the stream instead.
    pub async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        let info = LlmCallInfo::begin(self.provider.name());
        let span = call_span(&info);

        async {
            if let Some(hook) = &self.hook {
                hook.before_request(&info, req).await;
            }

            match self.provider.create_chat_completion_stream(req).await {
                Ok(stream) => Ok(match &self.hook {
                    Some(hook) => hook.wrap_stream(&info, req, stream),
                    None => stream,
                }),
                Err(err) => {
                    if let Some(hook) = &self.hook {
                        hook.after_response(&info, req, None, Some(&err)).await;
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Chat completion over the stored history of `session_id`.
    ///
    /// Prepends the stored messages, calls [`Self::create_chat_completion`]
    /// (so hooks fire), then appends the request messages and the first
    /// choice's reply to the session. A memory-save failure is logged and
    /// ignored so it cannot mask the successful completion. Without memory
    /// configured this degrades to a plain completion.
    pub async fn create_chat_completion_with_memory(
        &self,
        session_id: &str,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let Some(memory) = &self.memory else {
            return self.create_chat_completion(req).await;
        };

        let conversation = memory.load_conversation(session_id).await?;
        let mut merged = req.clone();
        merged.messages = conversation
            .messages
            .into_iter()
            .chain(req.messages.iter().cloned())
            .collect();

        let response = self.create_chat_completion(&merged).await?;

        if let Some(choice) = response.choices.first() {
            let mut to_save = req.messages.clone();
            to_save.push(choice.message.clone());
            if let Err(err) = memory.append_messages(session_id, to_save).await {
                warn!(session_id, error = %err, "failed to save conversation to memory");
            }
        }

        Ok(response)
    }

    /// Streaming chat completion over the stored history of `session_id`.
    ///
    /// The returned stream is wrapped in a splitter that assembles the
    /// assistant reply as chunks arrive and appends it to the session at
    /// end-of-stream, or at close if content was buffered. The save runs at
    /// most once per stream; failures are logged and ignored.
    pub async fn create_chat_completion_stream_with_memory(
        &self,
        session_id: &str,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        let Some(memory) = &self.memory else {
            return self.create_chat_completion_stream(req).await;
        };

        let conversation = memory.load_conversation(session_id).await?;
        let mut merged = req.clone();
        merged.messages = conversation
            .messages
            .into_iter()
            .chain(req.messages.iter().cloned())
            .collect();

        let stream = self.create_chat_completion_stream(&merged).await?;

        Ok(Box::new(MemorySplitStream {
            inner: stream,
            memory: memory.clone(),
            session_id: session_id.to_string(),
            req_messages: req.messages.clone(),
            buffer: String::new(),
            saved: false,
        }))
    }

    /// Load a conversation from memory.
    pub async fn load_conversation(&self, session_id: &str) -> Result<ConversationMemory> {
        self.require_memory()?.load_conversation(session_id).await
    }

    /// Save a conversation to memory.
    pub async fn save_conversation(&self, conversation: ConversationMemory) -> Result<()> {
        self.require_memory()?.save_conversation(conversation).await
    }

    /// Append a message to a session.
    pub async fn append_message(&self, session_id: &str, message: Message) -> Result<()> {
        self.require_memory()?
            .append_message(session_id, message)
            .await
    }

    /// Messages stored for a session.
    pub async fn get_conversation_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.require_memory()?.get_messages(session_id).await
    }

    /// Overwrite a session with a single system message.
    pub async fn create_conversation_with_system_message(
        &self,
        session_id: &str,
        system_message: impl Into<String>,
    ) -> Result<()> {
        self.require_memory()?
            .create_conversation_with_system_message(session_id, system_message)
            .await
    }

    /// Delete a session from memory.
    pub async fn delete_conversation(&self, session_id: &str) -> Result<()> {
        self.require_memory()?.delete_conversation(session_id).await
    }

    fn require_memory(&self) -> Result<&MemoryManager> {
        self.memory.as_ref().ok_or(LlmError::MemoryNotConfigured)
    }
}

/// Stream decorator that captures the assembled assistant reply for memory.
struct MemorySplitStream {
    inner: BoxChatStream,
    memory: MemoryManager,
    session_id: String,
    req_messages: Vec<Message>,
    buffer: String,
    saved: bool,
}

impl MemorySplitStream {
    async fn save_buffered(&mut self) {
        if self.saved || self.buffer.is_empty() {
            return;
        }
        self.saved = true;

        let mut messages = self.req_messages.clone();
        messages.push(Message::assistant(std::mem::take(&mut self.buffer)));
        if let Err(err) = self.memory.append_messages(&self.session_id, messages).await {
            warn!(session_id = %self.session_id, error = %err, "failed to save streamed reply to memory");
        }
    }
}

#[async_trait::async_trait]
impl ChatCompletionStream for MemorySplitStream {
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>> {
        match self.inner.recv().await {
            Ok(Some(chunk)) => {
                self.buffer.push_str(chunk.delta_content());
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.save_buffered().await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.save_buffered().await;
        self.inner.close().await
    }
}
