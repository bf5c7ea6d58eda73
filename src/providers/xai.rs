//! X.AI Grok adapter.
//!
//! The X.AI API is OpenAI-compatible, so this wraps the shared core with the
//! api.x.ai defaults.

use async_trait::async_trait;

use crate::error::Result;
use crate::provider::{BoxChatStream, Provider};
use crate::providers::openai_compatible::OpenAiCompatibleClient;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};

/// X.AI API base URL (includes /v1 for OpenAI compatibility).
const XAI_API_BASE: &str = "https://api.x.ai/v1";

/// X.AI Grok backend adapter.
#[derive(Debug, Clone)]
pub struct XaiProvider {
    inner: OpenAiCompatibleClient,
}

impl XaiProvider {
    /// Create an adapter with the given API key and default endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: OpenAiCompatibleClient::new("xai", api_key, XAI_API_BASE)?,
        })
    }

    /// Override the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.inner.set_base_url(base_url);
        self
    }

    /// Inject a custom HTTP client.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.inner.set_http_client(client);
        self
    }

    /// Current base URL.
    pub fn base_url(&self) -> &str {
        self.inner.base_url()
    }
}

#[async_trait]
impl Provider for XaiProvider {
    fn name(&self) -> &str {
        "xai"
    }

    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        self.inner.create_completion(req).await
    }

    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        self.inner.create_completion_stream(req).await
    }
}
