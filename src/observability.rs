//! Observability seam: per-call metadata and the hook capability.
//!
//! Hooks receive the request and response by reference for inspection only;
//! the client never relies on hook side effects. This keeps tracing, metrics
//! and structured logging out of the core without closing the door on them.

use std::time::SystemTime;

use async_trait::async_trait;
use rand::Rng;
use tracing::Span;

use crate::error::LlmError;
use crate::provider::BoxChatStream;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};

/// Metadata about one LLM call, issued by the client per call and carried
/// through every hook invocation for that call.
#[derive(Debug, Clone)]
pub struct LlmCallInfo {
    /// Correlation id: 16 hex characters from 8 random bytes. Stable across
    /// `before_request`/`after_response` for a single call, unique with
    /// overwhelming probability across concurrent calls.
    pub call_id: String,

    /// Provider name, e.g. "openai".
    pub provider: String,

    /// When the call started.
    pub start_time: SystemTime,
}

impl LlmCallInfo {
    pub(crate) fn begin(provider: &str) -> Self {
        Self {
            call_id: new_call_id(),
            provider: provider.to_string(),
            start_time: SystemTime::now(),
        }
    }
}

/// Generate a fresh correlation id.
pub(crate) fn new_call_id() -> String {
    use std::fmt::Write;

    let bytes: [u8; 8] = rand::rng().random();
    let mut id = String::with_capacity(16);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

/// Tracing span carrying the per-request logging context.
///
/// The client runs each call inside this span, so any `tracing` statement in
/// an adapter is automatically tagged with the call id and provider. With no
/// subscriber installed the span is a no-op.
pub fn call_span(info: &LlmCallInfo) -> Span {
    tracing::debug_span!("llm_call", call_id = %info.call_id, provider = %info.provider)
}

/// Observer of LLM calls made through the client.
///
/// Implementations add tracing, logging or metrics without modifying the
/// core. `before_request` happens-before the adapter call; the adapter call
/// happens-before `after_response` (synchronous calls and stream-construction
/// failures) or `wrap_stream` (stream successes).
#[async_trait]
pub trait ObservabilityHook: Send + Sync {
    /// Called before each LLM call. Must not mutate the request.
    async fn before_request(&self, info: &LlmCallInfo, req: &ChatCompletionRequest);

    /// Called after each synchronous call, on success and failure alike, and
    /// after a failed stream construction (with `resp` absent).
    async fn after_response(
        &self,
        info: &LlmCallInfo,
        req: &ChatCompletionRequest,
        resp: Option<&ChatCompletionResponse>,
        err: Option<&LlmError>,
    );

    /// Wrap a successfully constructed stream for observation.
    ///
    /// `after_response` does not fire for streaming successes; a wrapper that
    /// wants completion signaling must detect end-of-stream in `recv` or act
    /// in `close`.
    fn wrap_stream(
        &self,
        _info: &LlmCallInfo,
        _req: &ChatCompletionRequest,
        stream: BoxChatStream,
    ) -> BoxChatStream {
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_call_id_shape() {
        let id = new_call_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_call_ids_distinct() {
        let ids: HashSet<String> = (0..256).map(|_| new_call_id()).collect();
        assert_eq!(ids.len(), 256);
    }

    #[test]
    fn test_begin_records_provider() {
        let info = LlmCallInfo::begin("anthropic");
        assert_eq!(info.provider, "anthropic");
        assert_eq!(info.call_id.len(), 16);
    }
}
