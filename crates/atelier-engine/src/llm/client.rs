//! Request execution with admission control and bounded retry.
//!
//! Every outbound attempt — first try or retry — goes through the admission
//! gate, and the permit is released when the attempt ends whatever happened.
//! Failures are classified, not thrown through: the retry loop consumes
//! [`FailureKind`] values and decides explicitly. Transport retries here are
//! independent of the content-level retry loop in `compliance.rs`.

use super::gate::{AdmissionGate, GateLimits};
use super::models::{CallFailure, CallRequest, CallResult, FailureKind};
use super::parse::parse_retry_after;
use super::provider::ProviderRegistry;
use atelier_adapters::Config;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay for rate-limit errors. Fixed: the window clears on its own.
    pub rate_limit_base: Duration,
    /// Base delay for other transient errors; scales with the attempt number.
    pub transient_base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_base: Duration::from_millis(2000),
            transient_base: Duration::from_millis(2000),
            cap: Duration::from_millis(15_000),
        }
    }
}

impl RetryPolicy {
    /// Deterministic backoff for attempt `n` (1-based): `min(base · 2^(n−1), cap)`.
    pub fn backoff_delay(&self, attempt: u32, kind: FailureKind) -> Duration {
        let base_ms = match kind {
            FailureKind::RateLimited => self.rate_limit_base.as_millis() as u64,
            _ => self.transient_base.as_millis() as u64 * attempt.max(1) as u64,
        };
        // Exponent capped so the shift can't overflow.
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        let delay_ms = base_ms.saturating_mul(factor).min(self.cap.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    /// Add up to 25% random jitter on top of a computed delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        delay + delay.mul_f64(jitter)
    }
}

/// Executes calls against the selected provider under admission control.
pub struct RequestExecutor {
    gate: Arc<AdmissionGate>,
    registry: ProviderRegistry,
    policy: RetryPolicy,
    acquire_timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        gate: Arc<AdmissionGate>,
        registry: ProviderRegistry,
        policy: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self { gate, registry, policy, acquire_timeout }
    }

    /// Build the executor, gate, and provider chain from configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let gate = Arc::new(AdmissionGate::new(GateLimits {
            requests_per_minute: config.requests_per_minute,
            max_concurrent: config.max_concurrent as usize,
            min_interval: Duration::from_millis(config.min_interval_ms),
        }));
        let registry = ProviderRegistry::from_config(config)?;
        let policy = RetryPolicy { max_attempts: config.max_attempts, ..RetryPolicy::default() };
        Ok(Self::new(gate, registry, policy, Duration::from_millis(config.acquire_timeout_ms)))
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Execute one call with bounded retry.
    ///
    /// Classification:
    /// - rate-limit / transient failures retry with backoff + jitter;
    /// - fatal failures propagate immediately;
    /// - admission timeout surfaces as `Overloaded` and is never retried here.
    ///
    /// Cancel-safe: dropping the future mid-backoff or mid-acquire releases
    /// any held permit.
    pub async fn execute(&self, request: &CallRequest) -> Result<CallResult, CallFailure> {
        let provider = self.registry.select()?;
        let mut last_failure: Option<CallFailure> = None;

        for attempt in 1..=self.policy.max_attempts {
            let permit = match self.gate.acquire(self.acquire_timeout).await {
                Ok(permit) => permit,
                Err(timeout) => {
                    return Err(CallFailure::overloaded(provider.name(), timeout.waited))
                }
            };

            let outcome = provider.execute(request).await;
            drop(permit);

            let failure = match outcome {
                Ok(result) => return Ok(result),
                Err(failure) => failure,
            };

            let kind = failure.kind();
            if !failure.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(failure);
            }

            let delay = self.retry_delay(&failure, attempt, kind);
            last_failure = Some(failure);
            tokio::time::sleep(delay).await;
        }

        // The loop always returns; this is the defensive exhaustion case.
        Err(last_failure.unwrap_or_else(|| {
            CallFailure::new("retries exhausted with no recorded failure", provider.name())
        }))
    }

    fn retry_delay(&self, failure: &CallFailure, attempt: u32, kind: FailureKind) -> Duration {
        if kind == FailureKind::RateLimited {
            // Honor an explicit retry-after hint when the provider sent one.
            if let Some(secs) = parse_retry_after(&failure.message) {
                return Duration::from_secs(secs);
            }
        }
        self.policy.jittered(self.policy.backoff_delay(attempt, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Provider;
    use crate::llm::testutil::{executor_for, open_limits, ScriptedProvider};

    fn executor_with(
        provider: Arc<ScriptedProvider>,
        limits: GateLimits,
        acquire_timeout_ms: u64,
    ) -> RequestExecutor {
        RequestExecutor::new(
            Arc::new(AdmissionGate::new(limits)),
            ProviderRegistry::new(vec![provider as Arc<dyn Provider>], None),
            RetryPolicy::default(),
            Duration::from_millis(acquire_timeout_ms),
        )
    }

    fn transient(msg: &str) -> CallFailure {
        CallFailure::new(msg, "scripted").with_kind(FailureKind::Transient)
    }

    #[test]
    fn test_backoff_is_monotone_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=8 {
            for kind in [FailureKind::RateLimited, FailureKind::Transient] {
                let delay = policy.backoff_delay(attempt, kind);
                assert!(delay <= policy.cap);
                if kind == FailureKind::Transient {
                    assert!(delay >= previous, "attempt {} regressed", attempt);
                }
            }
            previous = policy.backoff_delay(attempt, FailureKind::Transient);
        }
    }

    #[test]
    fn test_jitter_stays_under_a_quarter_extra() {
        let policy = RetryPolicy::default();
        let base = policy.backoff_delay(6, FailureKind::Transient);
        for _ in 0..200 {
            let jittered = policy.jittered(base);
            assert!(jittered >= base);
            assert!(jittered < base.mul_f64(1.25));
            assert!(jittered < policy.cap.mul_f64(1.25));
        }
    }

    #[test]
    fn test_rate_limit_base_is_fixed_and_shorter_early() {
        let policy = RetryPolicy::default();
        // By attempt 2, the transient delay outgrows the rate-limit delay.
        assert!(
            policy.backoff_delay(2, FailureKind::RateLimited)
                < policy.backoff_delay(2, FailureKind::Transient)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_until_success() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(transient("timed out")),
            Err(transient("connection reset")),
            Ok("generated".to_string()),
        ]));
        let executor = executor_for(Arc::clone(&provider));

        let result = executor.execute(&CallRequest::from_prompt("go")).await.unwrap();
        assert_eq!(result.content, "generated");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_propagates_without_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(CallFailure::with_status(
            "invalid api key",
            "scripted",
            None,
            401,
        ))]));
        let executor = executor_for(Arc::clone(&provider));

        let failure = executor.execute(&CallRequest::from_prompt("go")).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Fatal);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(CallFailure::with_status("rate limited", "scripted", None, 429)),
            Err(CallFailure::with_status("rate limited", "scripted", None, 429)),
            Err(CallFailure::with_status("rate limited again", "scripted", None, 429)),
        ]));
        let executor = executor_for(Arc::clone(&provider));

        let failure = executor.execute(&CallRequest::from_prompt("go")).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::RateLimited);
        assert!(failure.message.contains("again"));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_timeout_is_overloaded_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("never reached".to_string())]));
        let limits = GateLimits {
            requests_per_minute: 1000,
            max_concurrent: 1,
            min_interval: Duration::ZERO,
        };
        let gate = Arc::new(AdmissionGate::new(limits));
        let executor = RequestExecutor::new(
            Arc::clone(&gate),
            ProviderRegistry::new(vec![Arc::clone(&provider) as Arc<dyn Provider>], None),
            RetryPolicy::default(),
            Duration::from_millis(100),
        );

        // Occupy the only slot so the executor's acquire times out.
        let _held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let failure = executor.execute(&CallRequest::from_prompt("go")).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Overloaded);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_reacquires_the_gate() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(transient("timed out")),
            Ok("ok".to_string()),
        ]));
        // One concurrency slot: the second attempt could only proceed if the
        // first attempt's permit was released.
        let limits = GateLimits {
            requests_per_minute: 1000,
            max_concurrent: 1,
            min_interval: Duration::ZERO,
        };
        let executor = executor_with(Arc::clone(&provider), limits, 5000);

        let result = executor.execute(&CallRequest::from_prompt("go")).await.unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_provider_available_fails_fast() {
        let executor = RequestExecutor::new(
            Arc::new(AdmissionGate::new(open_limits())),
            ProviderRegistry::new(Vec::new(), None),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        let failure = executor.execute(&CallRequest::from_prompt("go")).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Fatal);
    }
}
