//! Compliance-gated generation.
//!
//! Runs a sequence of generation steps, feeds the combined output to an
//! external compliance check, and retries the whole sequence with an injected
//! violation hint when the check fails — up to a bounded attempt count. This
//! is the only retry in the core driven by a *content* judgment; transport
//! retries inside the executor never touch the attempt counter here.

use super::client::RequestExecutor;
use super::models::{merge_usage, CallFailure, CallRequest, Usage};
use atelier_core::{ComplianceReport, LogEntry, ProgressSink};

/// Violations quoted in a correction hint before the list is cut off.
const MAX_VIOLATIONS_IN_HINT: usize = 10;

const ROLE: &str = "compliance";

/// A named unit of generation work.
///
/// Steps run in order; each sees the outputs of the steps before it and, on a
/// retry attempt, the violation hint from the failed compliance check.
pub trait GenerationStep: Send + Sync {
    fn name(&self) -> &str;

    /// Build the call for this step given prior-step outputs and an optional
    /// correction hint.
    fn request(&self, prior: &[StepOutput], violation_hint: Option<&str>) -> CallRequest;

    /// Cheap local repair of structural-format problems in this step's raw
    /// output (e.g. prepending a required document header). Applied before
    /// compliance checking; does not consume a compliance attempt.
    fn patch_output(&self, raw: String) -> String {
        raw
    }
}

/// Output of one completed generation step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step: String,
    pub content: String,
}

/// Terminal result of a compliance-gated run. Always a value, never an error:
/// callers decide what a failure means for the job.
#[derive(Debug)]
pub enum ComplianceOutcome {
    Success {
        outputs: Vec<StepOutput>,
        /// Attempt the run succeeded on (1-based).
        attempts: u32,
        usage: Option<Usage>,
    },
    Failure {
        violations: Vec<String>,
        attempts: u32,
    },
}

impl ComplianceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ComplianceOutcome::Success { .. })
    }
}

/// Format a bounded violation list as a correction hint for the next attempt.
fn violation_hint(violations: &[String]) -> String {
    let mut hint = String::from(
        "## Prior attempt failed compliance (must fix)\n",
    );
    for violation in violations.iter().take(MAX_VIOLATIONS_IN_HINT) {
        hint.push_str("- ");
        hint.push_str(violation);
        hint.push('\n');
    }
    if violations.len() > MAX_VIOLATIONS_IN_HINT {
        hint.push_str(&format!("(+{} more)\n", violations.len() - MAX_VIOLATIONS_IN_HINT));
    }
    hint.push_str("Regenerate the output with every violation above corrected.");
    hint
}

/// Run `steps` under a compliance gate, retrying with a correction hint.
///
/// Transport failures (executor exhaustion, no provider) abort the run and
/// surface as the error; compliance failures are part of the normal outcome.
pub async fn run_with_compliance(
    executor: &RequestExecutor,
    steps: &[Box<dyn GenerationStep>],
    check: impl Fn(&[StepOutput]) -> ComplianceReport,
    max_attempts: u32,
    sink: &dyn ProgressSink,
) -> Result<ComplianceOutcome, CallFailure> {
    let max_attempts = max_attempts.max(1);
    let mut hint: Option<String> = None;
    let mut usage: Option<Usage> = None;
    let mut last_violations: Vec<String> = Vec::new();

    for attempt in 1..=max_attempts {
        sink.accept(LogEntry::info(
            ROLE,
            format!("generation attempt {}/{}", attempt, max_attempts),
        ));

        let mut outputs: Vec<StepOutput> = Vec::with_capacity(steps.len());
        for step in steps {
            let request = step.request(&outputs, hint.as_deref());
            let result = executor.execute(&request).await?;
            usage = merge_usage(usage.take(), Some(result.usage.clone()));
            let content = step.patch_output(result.content);
            outputs.push(StepOutput { step: step.name().to_string(), content });
        }

        let report = check(&outputs);
        if report.passed {
            sink.accept(LogEntry::success(
                ROLE,
                format!("compliance passed on attempt {}", attempt),
            ));
            return Ok(ComplianceOutcome::Success { outputs, attempts: attempt, usage });
        }

        sink.accept(LogEntry::warn(
            ROLE,
            format!(
                "compliance failed on attempt {} ({} violations)",
                attempt,
                report.violations.len()
            ),
        ));
        hint = Some(violation_hint(&report.violations));
        last_violations = report.violations;
    }

    sink.accept(LogEntry::error(
        ROLE,
        format!("compliance still failing after {} attempts", max_attempts),
    ));
    Ok(ComplianceOutcome::Failure { violations: last_violations, attempts: max_attempts })
}
