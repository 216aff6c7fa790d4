//! Shared test doubles for the gateway modules.

use super::client::{RequestExecutor, RetryPolicy};
use super::gate::{AdmissionGate, GateLimits};
use super::models::{CallFailure, CallRequest, CallResult, Usage};
use super::provider::{Provider, ProviderRegistry};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provider double that replays a script of outcomes and records prompts.
pub(crate) struct ScriptedProvider {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<String, CallFailure>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub(crate) fn new(script: Vec<Result<String, CallFailure>>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts seen so far, one entry per call, messages joined.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }
    fn display_name(&self) -> &str {
        "Scripted"
    }
    fn default_model(&self) -> &str {
        "scripted-model"
    }
    fn is_available(&self) -> bool {
        true
    }
    fn execute<'a>(
        &'a self,
        request: &'a CallRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CallResult, CallFailure>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CallFailure::new("script exhausted", "scripted")));
        Box::pin(async move {
            next.map(|content| CallResult {
                content,
                model: "scripted-model".to_string(),
                usage: Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 },
                duration: Duration::from_millis(10),
                provider: "scripted".to_string(),
                raw_response: String::new(),
            })
        })
    }
}

/// Gate limits that never block in tests.
pub(crate) fn open_limits() -> GateLimits {
    GateLimits { requests_per_minute: 1000, max_concurrent: 4, min_interval: Duration::ZERO }
}

/// Executor over a single scripted provider with an unconstrained gate.
pub(crate) fn executor_for(provider: Arc<ScriptedProvider>) -> RequestExecutor {
    RequestExecutor::new(
        Arc::new(AdmissionGate::new(open_limits())),
        ProviderRegistry::new(vec![provider as Arc<dyn Provider>], None),
        RetryPolicy::default(),
        Duration::from_secs(5),
    )
}
