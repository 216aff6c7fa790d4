//! Text-generation backends behind one interface.
//!
//! Every provider speaks an OpenAI-compatible chat-completions dialect, so a
//! single HTTP implementation ([`ChatEndpoint`]) covers all of them; concrete
//! providers are configuration variants (name, base URL, credential source,
//! default model). Selection logic operates only on the [`Provider`] trait.
//!
//! Availability is a pure function of credential/configuration state. No
//! network probing: selection must stay cheap and side-effect free.

use super::models::{CallFailure, CallRequest, CallResult, FailureKind, Usage};
use super::parse::sanitize_api_response;
use atelier_adapters::Config;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// OpenRouter chat-completions URL.
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Direct OpenAI-compatible chat-completions URL.
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Generous read budget; a single generation can legitimately take minutes.
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// An external text-generation backend reachable over HTTP.
pub trait Provider: Send + Sync {
    /// Stable identity used in config and failure reports (e.g. "openrouter").
    fn name(&self) -> &str;
    /// Human-readable name for operator output.
    fn display_name(&self) -> &str;
    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;
    /// Whether this provider can be called right now. Pure function of
    /// credential state; never touches the network.
    fn is_available(&self) -> bool;
    fn execute<'a>(
        &'a self,
        request: &'a CallRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CallResult, CallFailure>> + Send + 'a>>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// Build the provider-specific JSON body for a call.
///
/// At most one of the sampling-parameter pair may be sent downstream; when
/// both are supplied, temperature wins and top_p is dropped.
pub(crate) fn build_request_body(request: &CallRequest, default_model: &str) -> serde_json::Value {
    let mut body = json!({
        "model": request.model.as_deref().unwrap_or(default_model),
        "messages": &request.messages,
        "max_tokens": request.max_tokens,
        "stream": false,
    });

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    } else if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(stop) = &request.stop {
        body["stop"] = json!(stop);
    }
    body
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    /// Content can be null in some API responses (e.g. refusal or upstream error).
    #[serde(default)]
    content: Option<String>,
}

/// Parse a successful chat-completions response into a `CallResult`.
pub(crate) fn parse_success_response(
    provider: &str,
    default_model: &str,
    body: &str,
    duration: Duration,
) -> Result<CallResult, CallFailure> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|err| {
        CallFailure::new(
            format!("malformed response: {} ({})", err, sanitize_api_response(body)),
            provider,
        )
    })?;

    let content = parsed
        .choices
        .first()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or_default();

    if content.trim().is_empty() {
        // Blank generations happen on overloaded upstreams; retryable.
        return Err(CallFailure::new("empty response content", provider));
    }

    Ok(CallResult {
        content: content.to_string(),
        model: parsed.model.unwrap_or_else(|| default_model.to_string()),
        usage: parsed.usage.unwrap_or_default(),
        duration,
        provider: provider.to_string(),
        raw_response: body.to_string(),
    })
}

/// Pull `error.message` / `error.code` out of an error response body.
fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return (None, None),
    };
    let message = value
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());
    let code = value.pointer("/error/code").map(|c| match c {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    (message, code)
}

/// One OpenAI-compatible chat-completions endpoint.
pub struct ChatEndpoint {
    name: String,
    display_name: String,
    base_url: Option<String>,
    default_model: String,
    credential: Option<String>,
    client: reqwest::Client,
}

impl ChatEndpoint {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        base_url: Option<String>,
        default_model: impl Into<String>,
        credential: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            name: name.into(),
            display_name: display_name.into(),
            base_url,
            default_model: default_model.into(),
            credential,
            client,
        })
    }

    async fn call(&self, request: &CallRequest) -> Result<CallResult, CallFailure> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| CallFailure::new("no base URL configured", self.name.as_str()))?;
        let credential = self
            .credential
            .as_deref()
            .ok_or_else(|| CallFailure::new("no credential configured", self.name.as_str()))?;

        let body = build_request_body(request, &self.default_model);
        let started = std::time::Instant::now();

        let response = self
            .client
            .post(base_url)
            .header("Authorization", format!("Bearer {}", credential))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| self.classify_network_error(err))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| self.classify_network_error(err))?;

        if !status.is_success() {
            let (message, code) = parse_error_body(&text);
            let message = message.unwrap_or_else(|| sanitize_api_response(&text));
            return Err(CallFailure::with_status(
                format!("API call failed: {}", message),
                self.name.as_str(),
                code,
                status.as_u16(),
            ));
        }

        parse_success_response(&self.name, &self.default_model, &text, started.elapsed())
    }

    fn classify_network_error(&self, err: reqwest::Error) -> CallFailure {
        let failure = CallFailure::new(format!("HTTP request failed: {}", err), self.name.as_str());
        if err.is_timeout() || err.is_connect() {
            failure.with_kind(FailureKind::Transient)
        } else {
            failure
        }
    }
}

impl Provider for ChatEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn is_available(&self) -> bool {
        self.base_url.is_some()
            && self.credential.as_deref().is_some_and(Config::credential_is_usable)
    }

    fn execute<'a>(
        &'a self,
        request: &'a CallRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CallResult, CallFailure>> + Send + 'a>> {
        Box::pin(self.call(request))
    }
}

/// Priority-ordered provider list with configured-preference selection.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    preferred: Option<String>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>, preferred: Option<String>) -> Self {
        Self { providers, preferred }
    }

    /// Build the standard provider chain from configuration.
    ///
    /// Priority order: the AI gateway (when a deployment points at one), then
    /// OpenRouter, then a direct OpenAI-compatible endpoint.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let gateway = ChatEndpoint::new(
            "gateway",
            "AI Gateway",
            config.gateway_base_url.clone(),
            config.gateway_model.clone().unwrap_or_else(|| "gemini-2.5-pro".to_string()),
            config.gateway_token(),
        )?;
        let openrouter = ChatEndpoint::new(
            "openrouter",
            "OpenRouter",
            Some(OPENROUTER_URL.to_string()),
            "openai/gpt-4o-mini",
            config.openrouter_api_key(),
        )?;
        let openai = ChatEndpoint::new(
            "openai",
            "OpenAI-compatible",
            Some(config.openai_base_url.clone().unwrap_or_else(|| OPENAI_URL.to_string())),
            "gpt-4o-mini",
            config.openai_api_key(),
        )?;

        Ok(Self::new(
            vec![Arc::new(gateway), Arc::new(openrouter), Arc::new(openai)],
            config.preferred_provider.clone(),
        ))
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn has_available(&self) -> bool {
        self.providers.iter().any(|p| p.is_available())
    }

    /// Pick the provider for the next call.
    ///
    /// The configured preference wins when available; otherwise the first
    /// available provider in priority order. When nothing is available the
    /// error is fatal and names the knobs to configure.
    pub fn select(&self) -> Result<Arc<dyn Provider>, CallFailure> {
        if let Some(name) = self.preferred.as_deref() {
            if let Some(provider) = self.by_name(name) {
                if provider.is_available() {
                    return Ok(provider);
                }
            }
            // Preference unavailable: fall through to the ordered scan, but
            // skip the already-rejected preference.
            for provider in &self.providers {
                if provider.name().eq_ignore_ascii_case(name) {
                    continue;
                }
                if provider.is_available() {
                    return Ok(Arc::clone(provider));
                }
            }
            return Err(self.no_provider_failure());
        }

        for provider in &self.providers {
            if provider.is_available() {
                return Ok(Arc::clone(provider));
            }
        }
        Err(self.no_provider_failure())
    }

    fn no_provider_failure(&self) -> CallFailure {
        CallFailure::new(
            "No AI provider is available. Configure one of:\n  \
             - AIGATEWAY_TOKEN and AIGATEWAY_BASE_URL (AI gateway)\n  \
             - OPENROUTER_API_KEY (OpenRouter)\n  \
             - OPENAI_API_KEY (OpenAI-compatible endpoint)",
            "registry",
        )
        .with_kind(FailureKind::Fatal)
    }

    /// Availability report for operator display.
    pub fn status_report(&self) -> String {
        let mut out = String::new();
        for provider in &self.providers {
            out.push_str(&format!(
                "- {} ({}): {} - default model: {}\n",
                provider.display_name(),
                provider.name(),
                if provider.is_available() { "available" } else { "unavailable" },
                provider.default_model(),
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::models::ChatMessage;

    struct FakeProvider {
        name: &'static str,
        available: bool,
    }

    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn display_name(&self) -> &str {
            self.name
        }
        fn default_model(&self) -> &str {
            "fake-model"
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn execute<'a>(
            &'a self,
            _request: &'a CallRequest,
        ) -> Pin<Box<dyn Future<Output = Result<CallResult, CallFailure>> + Send + 'a>> {
            Box::pin(async { Err(CallFailure::new("not wired", self.name)) })
        }
    }

    fn registry(
        specs: &[(&'static str, bool)],
        preferred: Option<&str>,
    ) -> ProviderRegistry {
        let providers: Vec<Arc<dyn Provider>> = specs
            .iter()
            .map(|(name, available)| {
                Arc::new(FakeProvider { name, available: *available }) as Arc<dyn Provider>
            })
            .collect();
        ProviderRegistry::new(providers, preferred.map(|s| s.to_string()))
    }

    #[test]
    fn test_select_skips_unavailable_prefixes() {
        let registry =
            registry(&[("gateway", false), ("openrouter", false), ("openai", true)], None);
        assert_eq!(registry.select().unwrap().name(), "openai");
    }

    #[test]
    fn test_select_honors_configured_preference() {
        let registry =
            registry(&[("gateway", true), ("openrouter", true)], Some("openrouter"));
        assert_eq!(registry.select().unwrap().name(), "openrouter");
    }

    #[test]
    fn test_unavailable_preference_falls_back_in_order() {
        let registry = registry(
            &[("gateway", true), ("openrouter", false), ("openai", true)],
            Some("openrouter"),
        );
        assert_eq!(registry.select().unwrap().name(), "gateway");
    }

    #[test]
    fn test_no_available_provider_is_fatal_and_actionable() {
        let registry = registry(&[("gateway", false), ("openai", false)], None);
        let failure = registry.select().unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Fatal);
        assert!(failure.message.contains("OPENAI_API_KEY"));
        assert!(failure.message.contains("AIGATEWAY_TOKEN"));
    }

    #[test]
    fn test_temperature_wins_over_top_p() {
        let request = CallRequest::from_prompt("hi").temperature(0.3).top_p(0.9);
        let body = build_request_body(&request, "default-model");
        assert_eq!(body["temperature"], 0.3);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_top_p_sent_when_temperature_absent() {
        let request = CallRequest::from_prompt("hi").top_p(0.9);
        let body = build_request_body(&request, "default-model");
        assert_eq!(body["top_p"], 0.9);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_body_defaults_model_and_disables_streaming() {
        let request = CallRequest::with_messages(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("generate"),
        ])
        .stop("END");
        let body = build_request_body(&request, "fallback-model");
        assert_eq!(body["model"], "fallback-model");
        assert_eq!(body["stream"], false);
        assert_eq!(body["stop"], "END");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_success_response_extracts_fields() {
        let body = r#"{
            "model": "gpt-4o-mini-2024",
            "choices": [{"message": {"content": "generated text"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        }"#;
        let result =
            parse_success_response("openai", "gpt-4o-mini", body, Duration::from_millis(900))
                .unwrap();
        assert_eq!(result.content, "generated text");
        assert_eq!(result.model, "gpt-4o-mini-2024");
        assert_eq!(result.usage.total_tokens, 16);
        assert_eq!(result.provider, "openai");
        assert!(result.raw_response.contains("generated text"));
    }

    #[test]
    fn test_blank_content_is_a_retryable_failure() {
        let body = r#"{"choices": [{"message": {"content": "   "}}]}"#;
        let failure =
            parse_success_response("openai", "m", body, Duration::from_millis(1)).unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Transient);
    }

    #[test]
    fn test_malformed_response_is_fatal() {
        let failure =
            parse_success_response("openai", "m", "not json", Duration::from_millis(1))
                .unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Fatal);
    }

    #[test]
    fn test_endpoint_without_credential_is_unavailable() {
        let endpoint = ChatEndpoint::new(
            "openai",
            "OpenAI-compatible",
            Some(OPENAI_URL.to_string()),
            "gpt-4o-mini",
            None,
        )
        .unwrap();
        assert!(!endpoint.is_available());

        let placeholder = ChatEndpoint::new(
            "openai",
            "OpenAI-compatible",
            Some(OPENAI_URL.to_string()),
            "gpt-4o-mini",
            Some("sk-placeholder-xyz".to_string()),
        )
        .unwrap();
        assert!(!placeholder.is_available());
    }
}
