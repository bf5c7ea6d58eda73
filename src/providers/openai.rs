//! OpenAI chat-completions adapter.
//!
//! Thin wrapper over the shared OpenAI-compatible core with the
//! api.openai.com defaults. Anything OpenAI-dialect but differently hosted
//! (Azure deployments excepted) can be reached by overriding the base URL.

use async_trait::async_trait;

use crate::error::Result;
use crate::provider::{BoxChatStream, Provider};
use crate::providers::openai_compatible::OpenAiCompatibleClient;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};

/// OpenAI API base URL.
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI backend adapter.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    inner: OpenAiCompatibleClient,
}

impl OpenAiProvider {
    /// Create an adapter with the given API key and default endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: OpenAiCompatibleClient::new("openai", api_key, OPENAI_API_BASE)?,
        })
    }

    /// Override the base URL (proxies, gateways, compatible servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.inner.set_base_url(base_url);
        self
    }

    /// Inject a custom HTTP client (timeouts, retry middleware, proxies).
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
