//! Error types shared by every backend adapter and the client facade.
//!
//! The crate never retries: transient-failure handling belongs to the
//! injected `reqwest::Client` (or whatever transport wraps it). Every error
//! is surfaced to the caller unchanged, with vendor error bodies folded into
//! a single structured [`ApiError`].

use thiserror::Error;

/// Result type for all unillm operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Structured error response from a vendor API.
///
/// Carries vendor identity and the raw status so callers can branch on the
/// backend without string matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Provider that produced the error (e.g. "openai", "anthropic").
    pub provider: String,

    /// HTTP status code of the response.
    pub status: u16,

    /// Human-readable message from the vendor error body, or the raw body
    /// text when the body did not parse.
    pub message: String,

    /// Vendor error type, if the body carried one.
    pub error_type: Option<String>,

    /// Vendor error code, if the body carried one.
    pub code: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} (status: {}, type: {}, code: {})",
            self.provider,
            self.message,
            self.status,
            self.error_type.as_deref().unwrap_or("-"),
            self.code.as_deref().unwrap_or("-"),
        )
    }
}

impl ApiError {
    /// Create a new API error.
    pub fn new(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        error_type: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            status,
            message: message.into(),
            error_type,
            code,
        }
    }

    /// Classify this vendor error into the crate taxonomy.
    ///
    /// 429 splits into quota vs. rate limit on the vendor code, 401/403 map
    /// to authentication, 404 (or an explicit not-found type) to
    /// [`LlmError::ModelNotFound`]. Everything else stays a server error.
    pub fn into_error(self) -> LlmError {
        let lowered_code = self.code.as_deref().unwrap_or("").to_ascii_lowercase();
        let lowered_type = self
            .error_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();

        if lowered_code.contains("model_not_found") || lowered_type.contains("model_not_found") {
            return LlmError::ModelNotFound(self);
        }

        match self.status {
            401 | 403 => LlmError::Auth(self),
            429 => {
                if lowered_code.contains("quota") || lowered_type.contains("quota") {
                    LlmError::QuotaExceeded(self)
                } else {
                    LlmError::RateLimited(self)
                }
            }
            404 => LlmError::ModelNotFound(self),
            _ => LlmError::Api(self),
        }
    }
}

/// Errors produced by unillm operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The configured provider name has no built-in adapter.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Required configuration is missing or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The selected built-in adapter requires an API key and none was given.
    #[error("API key cannot be empty")]
    EmptyApiKey,

    /// The request carried no model id.
    #[error("model cannot be empty")]
    EmptyModel,

    /// The request carried no messages.
    #[error("messages cannot be empty")]
    EmptyMessages,

    /// Request-side validation failure other than the empty cases.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure (DNS, connect, TLS, mid-body I/O).
    #[error("network error: {0}")]
    Network(String),

    /// The transport gave up before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The vendor rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(ApiError),

    /// The vendor applied rate limiting (429 class).
    #[error("rate limit exceeded: {0}")]
    RateLimited(ApiError),

    /// The vendor reported an exhausted quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(ApiError),

    /// The vendor signalled an unknown model id.
    #[error("model not found: {0}")]
    ModelNotFound(ApiError),

    /// Non-success vendor response not otherwise categorized.
    #[error("server error: {0}")]
    Api(ApiError),

    /// The vendor returned success but the body failed to decode.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Operation on a stream that was already closed.
    #[error("stream is closed")]
    StreamClosed,

    /// A memory operation was requested but no key/value store is wired.
    #[error("memory not configured")]
    MemoryNotConfigured,

    /// Failure inside an SDK-backed adapter (Bedrock).
    #[error("provider error: {0}")]
    Provider(String),

    /// JSON (de)serialization failure outside a vendor response body.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::Network(format!("connection failed: {err}"))
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(provider: &str, status: u16, code: Option<&str>, error_type: Option<&str>) -> ApiError {
        ApiError::new(
            provider,
            status,
            "boom",
            error_type.map(str::to_string),
            code.map(str::to_string),
        )
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::new(
            "openai",
            429,
            "slow down",
            Some("rate_limit_error".to_string()),
            Some("rate_limited".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "[openai] slow down (status: 429, type: rate_limit_error, code: rate_limited)"
        );
    }

    #[test]
    fn test_api_error_display_missing_fields() {
        let err = api("ollama", 500, None, None);
        assert_eq!(
            err.to_string(),
            "[ollama] boom (status: 500, type: -, code: -)"
        );
    }

    #[test]
    fn test_classify_auth() {
        assert!(matches!(
            api("openai", 401, None, None).into_error(),
            LlmError::Auth(_)
        ));
        assert!(matches!(
            api("openai", 403, None, None).into_error(),
            LlmError::Auth(_)
        ));
    }

    #[test]
    fn test_classify_rate_limit_vs_quota() {
        assert!(matches!(
            api("openai", 429, None, None).into_error(),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            api("openai", 429, Some("insufficient_quota"), None).into_error(),
            LlmError::QuotaExceeded(_)
        ));
    }

    #[test]
    fn test_classify_model_not_found() {
        assert!(matches!(
            api("openai", 404, None, None).into_error(),
            LlmError::ModelNotFound(_)
        ));
        assert!(matches!(
            api("openai", 400, Some("model_not_found"), None).into_error(),
            LlmError::ModelNotFound(_)
        ));
    }

    #[test]
    fn test_classify_server_error_default() {
        assert!(matches!(
            api("xai", 500, None, None).into_error(),
            LlmError::Api(_)
        ));
        assert!(matches!(
            api("xai", 400, None, None).into_error(),
            LlmError::Api(_)
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(LlmError::EmptyApiKey.to_string(), "API key cannot be empty");
        assert_eq!(LlmError::EmptyModel.to_string(), "model cannot be empty");
        assert_eq!(LlmError::StreamClosed.to_string(), "stream is closed");
        assert_eq!(
            LlmError::UnsupportedProvider("hal9000".to_string()).to_string(),
            "unsupported provider: hal9000"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let err: LlmError = json_err.into();
        assert!(matches!(err, LlmError::Serialization(_)));
    }
}
