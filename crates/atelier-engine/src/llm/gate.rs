//! Admission control for outbound model calls.
//!
//! One gate instance is shared by every job in the process: the constraint it
//! models (the provider-side request budget) is global. Three independent
//! limits compose, and all must be satisfied before a call goes out:
//!
//! 1. a counting semaphore bounding simultaneous in-flight calls;
//! 2. a fixed 60-second request window with lazy reset;
//! 3. a minimum spacing between consecutive grants, to smooth bursts even
//!    while window capacity remains.
//!
//! `acquire` sleeps (cancel-safely, bounded by the caller's timeout) when the
//! window is exhausted or spacing hasn't elapsed, instead of failing fast.
//! The returned permit releases on drop, so capacity survives errors and
//! cancellation on every path.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Rolling window length for the request budget.
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GateLimits {
    /// Grants allowed per window.
    pub requests_per_minute: u32,
    /// Simultaneous in-flight calls.
    pub max_concurrent: usize,
    /// Minimum delay since the previous grant.
    pub min_interval: Duration,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            max_concurrent: 3,
            min_interval: Duration::from_millis(2000),
        }
    }
}

/// Failure to acquire admission within the caller's timeout.
///
/// Distinct from any transport failure: the caller may retry later, but the
/// executor's transport retry policy never retries this.
#[derive(Debug, Clone)]
pub struct AdmissionTimeout {
    pub waited: Duration,
}

impl std::fmt::Display for AdmissionTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "admission not granted within {}ms", self.waited.as_millis())
    }
}

impl std::error::Error for AdmissionTimeout {}

/// Held for the duration of one outbound call. Dropping it releases the
/// concurrency slot exactly once.
#[must_use = "dropping the permit immediately releases admission"]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
    last_grant: Option<Instant>,
}

/// Process-wide admission gate. Cheap to share via `Arc`.
pub struct AdmissionGate {
    limits: GateLimits,
    semaphore: Arc<Semaphore>,
    window: Mutex<WindowState>,
}

impl AdmissionGate {
    pub fn new(limits: GateLimits) -> Self {
        let semaphore = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        Self {
            limits,
            semaphore,
            window: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
                last_grant: None,
            }),
        }
    }

    /// Wait for admission, giving up after `timeout`.
    ///
    /// Cancel-safe: dropping the future mid-wait leaks nothing, and a permit
    /// granted but unused is released when dropped.
    pub async fn acquire(&self, timeout: Duration) -> Result<AdmissionPermit, AdmissionTimeout> {
        let deadline = Instant::now() + timeout;

        // Concurrency slot first; window and spacing checks happen while the
        // slot is held so a granted call can start immediately.
        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => return Err(AdmissionTimeout { waited: timeout }),
        };

        loop {
            let wait = {
                let mut state = self.window.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();

                // Lazy window reset: the first acquire past the boundary
                // zeroes the counter. No background timer.
                if now.duration_since(state.window_start) >= WINDOW {
                    state.window_start = now;
                    state.count = 0;
                }

                if state.count >= self.limits.requests_per_minute {
                    // Window exhausted: sleep until the boundary.
                    WINDOW - now.duration_since(state.window_start)
                } else {
                    let spacing = state
                        .last_grant
                        .map(|last| {
                            self.limits.min_interval.saturating_sub(now.duration_since(last))
                        })
                        .unwrap_or(Duration::ZERO);
                    if spacing.is_zero() {
                        state.count += 1;
                        state.last_grant = Some(now);
                        return Ok(AdmissionPermit { _permit: permit });
                    }
                    spacing
                }
            };

            if Instant::now() + wait > deadline {
                // Permit drops here, releasing the concurrency slot.
                return Err(AdmissionTimeout { waited: timeout });
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Snapshot of the gate for operator display.
    pub fn status(&self) -> String {
        let state = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let in_flight = self.limits.max_concurrent - self.semaphore.available_permits();
        format!(
            "window: {}/{}, in-flight: {}/{}",
            state.count, self.limits.requests_per_minute, in_flight, self.limits.max_concurrent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(rpm: u32, concurrent: usize, interval_ms: u64) -> AdmissionGate {
        AdmissionGate::new(GateLimits {
            requests_per_minute: rpm,
            max_concurrent: concurrent,
            min_interval: Duration::from_millis(interval_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let gate = gate(30, 3, 0);
        let permit = gate.acquire(Duration::from_secs(5)).await.unwrap();
        drop(permit);
        gate.acquire(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_is_never_exceeded() {
        let gate = gate(30, 2, 0);
        let _a = gate.acquire(Duration::from_secs(1)).await.unwrap();
        let _b = gate.acquire(Duration::from_secs(1)).await.unwrap();

        // Third caller times out while both permits are held.
        let denied = gate.acquire(Duration::from_millis(100)).await;
        assert!(denied.is_err());

        drop(_a);
        gate.acquire(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_window_waits_for_boundary() {
        let gate = gate(2, 3, 0);
        drop(gate.acquire(Duration::from_secs(120)).await.unwrap());
        drop(gate.acquire(Duration::from_secs(120)).await.unwrap());

        let before = Instant::now();
        drop(gate.acquire(Duration::from_secs(120)).await.unwrap());
        let elapsed = Instant::now().duration_since(before);

        // Third grant happens no earlier than the window boundary.
        assert!(elapsed >= Duration::from_secs(59), "granted after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_counter_resets_lazily() {
        let gate = gate(1, 3, 0);
        drop(gate.acquire(Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        // No background timer ran; the next acquire itself resets the window.
        gate.acquire(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_spacing_between_grants() {
        let gate = gate(30, 3, 2000);
        let before = Instant::now();
        drop(gate.acquire(Duration::from_secs(10)).await.unwrap());
        drop(gate.acquire(Duration::from_secs(10)).await.unwrap());
        let elapsed = Instant::now().duration_since(before);
        assert!(elapsed >= Duration::from_millis(2000), "grants {:?} apart", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_window_wait_fails() {
        let gate = gate(1, 3, 0);
        drop(gate.acquire(Duration::from_secs(1)).await.unwrap());

        let denied = gate.acquire(Duration::from_secs(5)).await;
        assert!(denied.is_err());

        // The failed wait must not leak the concurrency slot.
        tokio::time::advance(Duration::from_secs(61)).await;
        gate.acquire(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_releases_slot() {
        let gate = Arc::new(gate(30, 1, 0));
        let _held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        drop(_held);
        gate.acquire(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_counts() {
        let gate = gate(30, 3, 0);
        let _permit = gate.acquire(Duration::from_secs(1)).await.unwrap();
        let status = gate.status();
        assert!(status.contains("1/30"));
        assert!(status.contains("1/3"));
    }
}
