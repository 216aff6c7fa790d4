//! Call request/result value objects and failure classification.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One chat message in a structured request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Parameters for one outbound model call. Value object, built per call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Target model; `None` means the provider's default.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    /// Nucleus sampling. Mutually exclusive with `temperature` downstream;
    /// when both are set, temperature wins and this is dropped.
    pub top_p: Option<f32>,
    pub max_tokens: u32,
    pub stop: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl CallRequest {
    /// Single-prompt shorthand: one user message.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            temperature: None,
            top_p: None,
            max_tokens: 4096,
            stop: None,
            messages: vec![ChatMessage::user(prompt)],
        }
    }

    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: None,
            temperature: None,
            top_p: None,
            max_tokens: 4096,
            stop: None,
            messages,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.stop = Some(stop.into());
        self
    }
}

/// Token accounting as reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Merge two optional `Usage` values, summing their token counts.
pub(crate) fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => Some(Usage {
            prompt_tokens: p.prompt_tokens + s.prompt_tokens,
            completion_tokens: p.completion_tokens + s.completion_tokens,
            total_tokens: p.total_tokens + s.total_tokens,
        }),
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

/// A completed model call. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub content: String,
    /// Model the provider actually resolved to.
    pub model: String,
    pub usage: Usage,
    pub duration: Duration,
    pub provider: String,
    /// Raw response payload, retained for diagnostics only.
    pub raw_response: String,
}

/// How a call failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429 or a quota message; retried on a short, fixed base delay.
    RateLimited,
    /// Timeout, reset, 5xx, or blank content; retried with growing delay.
    Transient,
    /// Admission-gate timeout. Surfaced to the caller as "overloaded";
    /// never retried by the transport policy.
    Overloaded,
    /// Everything else: auth, malformed request, unknown model. No retry.
    Fatal,
}

/// A classified outbound-call failure.
#[derive(Debug, Clone)]
pub struct CallFailure {
    pub message: String,
    pub provider: String,
    /// Machine error code from the response body, when present.
    pub code: Option<String>,
    pub http_status: Option<u16>,
    kind_override: Option<FailureKind>,
}

impl CallFailure {
    pub fn new(message: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            provider: provider.into(),
            code: None,
            http_status: None,
            kind_override: None,
        }
    }

    pub fn with_status(
        message: impl Into<String>,
        provider: impl Into<String>,
        code: Option<String>,
        http_status: u16,
    ) -> Self {
        Self {
            message: message.into(),
            provider: provider.into(),
            code,
            http_status: Some(http_status),
            kind_override: None,
        }
    }

    /// Admission-gate timeout, distinct from any transport failure.
    pub fn overloaded(provider: impl Into<String>, waited: Duration) -> Self {
        Self {
            message: format!(
                "call admission timed out after {}ms; the gateway is at capacity",
                waited.as_millis()
            ),
            provider: provider.into(),
            code: None,
            http_status: None,
            kind_override: Some(FailureKind::Overloaded),
        }
    }

    /// Force a specific classification regardless of message heuristics.
    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind_override = Some(kind);
        self
    }

    /// Classify this failure for the retry policy.
    pub fn kind(&self) -> FailureKind {
        if let Some(kind) = self.kind_override {
            return kind;
        }
        if self.http_status == Some(429) {
            return FailureKind::RateLimited;
        }
        let lower = self.message.to_ascii_lowercase();
        if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
            || lower.contains("throttl")
        {
            return FailureKind::RateLimited;
        }
        if matches!(self.http_status, Some(s) if s >= 500) {
            return FailureKind::Transient;
        }
        if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection reset")
            || lower.contains("could not connect")
            || lower.contains("empty response")
        {
            return FailureKind::Transient;
        }
        FailureKind::Fatal
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::RateLimited | FailureKind::Transient)
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.provider, self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {})", status)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (code {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for CallFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_classifies_as_rate_limited() {
        let failure = CallFailure::with_status("slow down", "gateway", None, 429);
        assert_eq!(failure.kind(), FailureKind::RateLimited);
        assert!(failure.is_retryable());
    }

    #[test]
    fn test_rate_limit_message_without_status() {
        let failure = CallFailure::new("quota exceeded for model", "openrouter");
        assert_eq!(failure.kind(), FailureKind::RateLimited);
    }

    #[test]
    fn test_5xx_and_timeout_are_transient() {
        assert_eq!(
            CallFailure::with_status("bad gateway", "openai", None, 502).kind(),
            FailureKind::Transient
        );
        assert_eq!(
            CallFailure::new("request timed out after 60s", "openai").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            CallFailure::new("empty response content", "openai").kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let failure = CallFailure::with_status("invalid api key", "gateway", None, 401);
        assert_eq!(failure.kind(), FailureKind::Fatal);
        assert!(!failure.is_retryable());
    }

    #[test]
    fn test_overloaded_is_never_retryable() {
        let failure = CallFailure::overloaded("gateway", Duration::from_secs(300));
        assert_eq!(failure.kind(), FailureKind::Overloaded);
        assert!(!failure.is_retryable());
        assert!(failure.message.contains("capacity"));
    }

    #[test]
    fn test_merge_usage_sums_counts() {
        let a = Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 };
        let b = Usage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 };
        let merged = merge_usage(Some(a), Some(b)).unwrap();
        assert_eq!(merged.total_tokens, 18);
        assert!(merge_usage(None, None).is_none());
    }

    #[test]
    fn test_display_carries_status_and_code() {
        let failure = CallFailure::with_status(
            "bad request",
            "openai",
            Some("invalid_request_error".to_string()),
            400,
        );
        let text = failure.to_string();
        assert!(text.contains("HTTP 400"));
        assert!(text.contains("invalid_request_error"));
        assert!(text.contains("[openai]"));
    }
}
