//! Per-job repair history.
//!
//! `SessionMemory` lives for one job execution and is discarded afterwards.
//! It is append-only: the repair loop records every attempt (successful or
//! not) and consults the history to avoid repeating fixes that already
//! failed, and to skip re-patching a shared build manifest it has patched
//! once before. It also tracks error signatures across rounds so a caller can
//! stop a loop that keeps hitting the same wall.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Cap on retained attempts; older entries are dropped first.
const MAX_HISTORY: usize = 10;

/// Same signature seen this many times in a row means the loop is stuck.
const MAX_SAME_ERROR_TOLERANCE: u32 = 2;

/// Rounds after which an all-failure history means the loop is stuck.
const ALL_FAILED_THRESHOLD: usize = 3;

/// One recorded repair attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub round: u32,
    pub path: String,
    /// Short description of the fix that was tried.
    pub strategy: String,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only repair history for a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMemory {
    job_id: Uuid,
    history: Vec<RepairAttempt>,
    repaired_paths: HashSet<String>,
    signature_counts: HashMap<String, u32>,
    last_signature: Option<String>,
    consecutive_same_error: u32,
}

impl SessionMemory {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            history: Vec::new(),
            repaired_paths: HashSet::new(),
            signature_counts: HashMap::new(),
            last_signature: None,
            consecutive_same_error: 0,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Record an attempt, successful or not.
    pub fn record_attempt(
        &mut self,
        round: u32,
        path: impl Into<String>,
        strategy: impl Into<String>,
        succeeded: bool,
        failure_reason: Option<String>,
    ) {
        let path = path.into();
        if succeeded {
            self.repaired_paths.insert(path.clone());
        }
        self.history.push(RepairAttempt {
            round,
            path,
            strategy: strategy.into(),
            succeeded,
            failure_reason,
            at: Utc::now(),
        });
        while self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
    }

    /// Whether this path was already successfully repaired this job.
    pub fn has_repaired(&self, path: &str) -> bool {
        self.repaired_paths.contains(path)
    }

    pub fn attempts_for<'a, 'b>(
        &'a self,
        path: &'b str,
    ) -> impl Iterator<Item = &'a RepairAttempt> + use<'a, 'b> {
        self.history.iter().filter(move |a| a.path == path)
    }

    /// Strategies that were tried for this path and failed.
    pub fn failed_strategies_for(&self, path: &str) -> Vec<&str> {
        self.attempts_for(path)
            .filter(|a| !a.succeeded)
            .map(|a| a.strategy.as_str())
            .collect()
    }

    /// Record the error signature of a round.
    ///
    /// Returns `true` when the same signature has now repeated enough times in
    /// a row that further repair rounds are unlikely to make progress.
    pub fn record_error_signature(&mut self, signature: &str) -> bool {
        if signature.trim().is_empty() {
            self.last_signature = None;
            self.consecutive_same_error = 0;
            return false;
        }

        *self.signature_counts.entry(signature.to_string()).or_insert(0) += 1;

        if self.last_signature.as_deref() == Some(signature) {
            self.consecutive_same_error += 1;
        } else {
            self.last_signature = Some(signature.to_string());
            self.consecutive_same_error = 1;
        }

        self.consecutive_same_error >= MAX_SAME_ERROR_TOLERANCE
    }

    /// Whether the repair loop should stop: same error repeating, or several
    /// rounds with nothing fixed at all.
    pub fn should_terminate(&self) -> bool {
        if self.consecutive_same_error >= MAX_SAME_ERROR_TOLERANCE {
            return true;
        }
        self.history.len() >= ALL_FAILED_THRESHOLD
            && self.history.iter().all(|a| !a.succeeded)
    }

    /// Compact history summary for inclusion in repair prompts.
    pub fn prompt_context(&self) -> String {
        if self.history.is_empty() {
            return "(first repair, no history)".to_string();
        }
        let mut out = String::new();
        for attempt in &self.history {
            let outcome = if attempt.succeeded {
                "ok".to_string()
            } else {
                format!(
                    "failed{}",
                    attempt
                        .failure_reason
                        .as_deref()
                        .map(|r| format!(": {}", r))
                        .unwrap_or_default()
                )
            };
            out.push_str(&format!(
                "- round {} {}: {} -> {}\n",
                attempt.round, attempt.path, attempt.strategy, outcome
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SessionMemory {
        SessionMemory::new(Uuid::new_v4())
    }

    #[test]
    fn test_successful_attempt_marks_path_repaired() {
        let mut mem = memory();
        mem.record_attempt(1, "pom.xml", "add dependency", true, None);
        assert!(mem.has_repaired("pom.xml"));
        assert!(!mem.has_repaired("src/App.java"));
    }

    #[test]
    fn test_failed_attempt_does_not_mark_path_repaired() {
        let mut mem = memory();
        mem.record_attempt(1, "pom.xml", "add dependency", false, Some("still broken".into()));
        assert!(!mem.has_repaired("pom.xml"));
        assert_eq!(mem.failed_strategies_for("pom.xml"), vec!["add dependency"]);
    }

    #[test]
    fn test_history_is_capped() {
        let mut mem = memory();
        for round in 0..20 {
            mem.record_attempt(round, format!("f{}.java", round), "fix", false, None);
        }
        assert_eq!(mem.attempts_for("f19.java").count(), 1);
        assert_eq!(mem.attempts_for("f0.java").count(), 0);
    }

    #[test]
    fn test_repeated_signature_trips_after_tolerance() {
        let mut mem = memory();
        assert!(!mem.record_error_signature("symbol not found:Widget"));
        assert!(mem.record_error_signature("symbol not found:Widget"));
        assert!(mem.should_terminate());
    }

    #[test]
    fn test_different_signatures_reset_the_repeat_counter() {
        let mut mem = memory();
        assert!(!mem.record_error_signature("a"));
        assert!(!mem.record_error_signature("b"));
        assert!(!mem.record_error_signature("a"));
        assert!(!mem.should_terminate());
    }

    #[test]
    fn test_all_failed_rounds_terminate() {
        let mut mem = memory();
        for round in 0..3 {
            mem.record_attempt(round, "src/App.java", "rewrite imports", false, None);
        }
        assert!(mem.should_terminate());
    }

    #[test]
    fn test_mixed_outcomes_do_not_terminate() {
        let mut mem = memory();
        mem.record_attempt(1, "src/App.java", "rewrite imports", false, None);
        mem.record_attempt(1, "src/Other.java", "add import", true, None);
        mem.record_attempt(2, "src/App.java", "fix types", false, None);
        assert!(!mem.should_terminate());
    }

    #[test]
    fn test_prompt_context_mentions_failed_strategy() {
        let mut mem = memory();
        mem.record_attempt(1, "src/App.java", "add import java.util.List", false, Some("same error".into()));
        let context = mem.prompt_context();
        assert!(context.contains("add import java.util.List"));
        assert!(context.contains("failed"));
    }

    #[test]
    fn test_empty_memory_prompt_context() {
        assert!(memory().prompt_context().contains("first repair"));
    }
}
