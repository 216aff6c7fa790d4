//! Self-healing repair of failing artifacts.
//!
//! Takes artifacts that failed external validation together with their
//! diagnostic output, decides per artifact whether the failure class is worth
//! an automated fix, and asks the model for a corrected version — with the
//! job's repair history in the prompt so failed strategies are not repeated.
//! Fixed content is sanitized and structurally checked before it becomes a
//! new artifact version; a broken fix is recorded as a failed attempt, never
//! persisted. One unfixable artifact never aborts the rest of the round.

use super::client::RequestExecutor;
use super::models::CallRequest;
use super::parse::{
    has_balanced_delimiters, has_type_declaration, is_build_manifest, is_valid_manifest,
    strip_markdown_fences, trim_to_declaration_span, truncate_str,
};
use atelier_core::{Artifact, LogEntry, ProgressSink, SessionMemory, ValidationReport};
use regex::{Regex, RegexSet};
use std::collections::HashMap;
use std::sync::OnceLock;

const ROLE: &str = "repair";

/// Sampling settings for fix generation. Low temperature: we want the
/// smallest stable edit, not creativity.
const FIX_TEMPERATURE: f32 = 0.1;
const FIX_MAX_TOKENS: u32 = 8000;

/// Caps on prompt material so a fix request stays focused.
const MAX_DIAGNOSTIC_CHARS: usize = 4000;
const MAX_SYMBOL_INDEX_CHARS: usize = 2000;

/// Diagnostic patterns worth an automated fix attempt.
fn auto_fixable_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"cannot find symbol",
            r"incompatible types",
            r"method .* cannot be applied",
            r"package .* does not exist",
            r"cannot access class",
            r"non-static .* cannot be referenced",
            r"unreported exception",
            r"missing return statement",
            r";' expected",
            r"'\)' expected",
            r"'\{' expected",
            r"illegal start of expression",
            r"class .* is public, should be declared",
            // Dependency-resolution failures, fixable through the manifest.
            r"could not resolve dependencies",
            r"the following artifacts could not be resolved",
            r"non-resolvable parent",
            r"failed to read artifact descriptor",
            r"could not find artifact",
            r"could not transfer artifact",
        ])
        .expect("auto-fixable pattern set is valid")
    })
}

/// Environment/resource failures no generated patch can repair.
const NON_FIXABLE_PATTERNS: &[&str] = &[
    "outofmemoryerror",
    "stackoverflowerror",
    "could not find or load main class",
    "unsupportedclassversionerror",
    "access denied",
    "permission denied",
    "operation not permitted",
    "connection refused",
    "network is unreachable",
    "unknown host",
    "timed out",
];

/// Per-artifact triage decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    AutoFixable,
    /// Matched a known non-recoverable pattern; carries the matched pattern.
    NonFixable(String),
    /// Matched neither curated set; treated as not auto-fixable.
    Unrecognized,
}

/// Triage a diagnostic. Non-fixable patterns take precedence.
pub fn classify_diagnostic(diagnostic: &str) -> Classification {
    let lower = diagnostic.to_ascii_lowercase();
    for pattern in NON_FIXABLE_PATTERNS {
        if lower.contains(pattern) {
            return Classification::NonFixable((*pattern).to_string());
        }
    }
    if auto_fixable_patterns().is_match(&lower) {
        Classification::AutoFixable
    } else {
        Classification::Unrecognized
    }
}

/// Coarse error family, used only for aggregation and attempt ordering.
pub fn error_type(diagnostic: &str) -> &'static str {
    let lower = diagnostic.to_ascii_lowercase();
    if lower.contains("cannot find symbol")
        || (lower.contains("package") && lower.contains("does not exist"))
    {
        "symbol not found"
    } else if lower.contains("incompatible types") || lower.contains("cannot be converted") {
        "type mismatch"
    } else if lower.contains("method") && lower.contains("cannot be applied") {
        "method signature"
    } else if lower.contains(";' expected") || lower.contains("illegal start") {
        "syntax error"
    } else if lower.contains("unreported exception") {
        "exception handling"
    } else if lower.contains("missing return") {
        "missing return"
    } else if lower.contains("could not resolve") || lower.contains("could not find artifact") {
        "dependency resolution"
    } else {
        "other"
    }
}

/// Per-artifact entry in the repair report.
#[derive(Debug, Clone)]
pub struct ArtifactReport {
    pub path: String,
    pub reason: String,
    /// Raw diagnostic, kept for manual review.
    pub diagnostic: Option<String>,
}

/// Structured result of one repair round.
///
/// Always returned as a value: callers distinguish partial progress from
/// total failure by inspecting the lists, not by catching errors.
#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub fixed: Vec<Artifact>,
    /// Recognized non-recoverable failures (environment, resources) plus
    /// diagnostics matching no known fixable pattern.
    pub unfixable: Vec<ArtifactReport>,
    /// Attempted fixes that failed: transport errors or structurally broken
    /// model output that was rejected before persisting.
    pub failed: Vec<ArtifactReport>,
    /// Manifest artifacts skipped because this job already patched them once.
    pub skipped: Vec<String>,
    /// Most frequent classified error family across the round.
    pub core_issue: Option<String>,
    pub summary: String,
}

impl RepairOutcome {
    pub fn fixed_any(&self) -> bool {
        !self.fixed.is_empty()
    }

    /// "Cannot fix": nothing was repaired this round.
    pub fn is_total_failure(&self) -> bool {
        self.fixed.is_empty()
    }
}

fn type_declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:class|interface|enum|record)\s+(\w+)").unwrap())
}

/// Best-effort compacted index of type names declared across the project.
///
/// Used to steer import/type fixes toward symbols that actually exist.
/// Returns `None` when nothing useful can be extracted; repair proceeds
/// without an index rather than failing.
pub fn build_symbol_index(project: &[Artifact]) -> Option<String> {
    let mut names: Vec<String> = Vec::new();
    for artifact in project {
        for caps in type_declaration_regex().captures_iter(&artifact.content) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        return None;
    }
    Some(truncate_str(&names.join(", "), MAX_SYMBOL_INDEX_CHARS))
}

/// Resolve the diagnostic text for one artifact: its attached output first,
/// then whatever the round's validation reports say about its file.
fn diagnostic_for(artifact: &Artifact, reports: &[ValidationReport]) -> String {
    if let Some(diag) = &artifact.diagnostic {
        if !diag.trim().is_empty() {
            return diag.clone();
        }
    }
    let mut out = String::new();
    for report in reports {
        out.push_str(&report.lines_for_file(artifact.file_name()));
    }
    out
}

fn build_fix_prompt(
    artifact: &Artifact,
    diagnostic: &str,
    symbol_index: Option<&str>,
    memory: &SessionMemory,
) -> String {
    let failed = memory.failed_strategies_for(&artifact.path);
    let history = if failed.is_empty() {
        "(first repair, no history)".to_string()
    } else {
        failed.iter().map(|s| format!("- {}\n", s)).collect()
    };

    format!(
        "## Repair history for this file (do NOT repeat these failed fixes)\n{history}\n\
         ## Known project types\n{index}\n\
         ## Current file: {path}\n{content}\n\
         ## Validation errors\n{diagnostic}\n\
         ## Task\n\
         Fix the errors above. Output only the complete corrected file, no explanation.",
        history = history,
        index = symbol_index.unwrap_or("(no symbol index available)"),
        path = artifact.path,
        content = artifact.content,
        diagnostic = truncate_str(diagnostic, MAX_DIAGNOSTIC_CHARS),
    )
}

/// Sanitize model output and check elementary structure for the artifact kind.
fn sanitize_fix(path: &str, raw: &str) -> Result<String, String> {
    if is_build_manifest(path) {
        let cleaned = strip_markdown_fences(raw).to_string();
        if is_valid_manifest(path, &cleaned) {
            Ok(cleaned)
        } else {
            Err("repaired manifest failed envelope check".to_string())
        }
    } else {
        let cleaned = trim_to_declaration_span(raw);
        if cleaned.is_empty() {
            return Err("repaired source was empty after sanitization".to_string());
        }
        if !cleaned.contains('{') || !has_balanced_delimiters(&cleaned) {
            return Err("repaired source has unbalanced block delimiters".to_string());
        }
        if !has_type_declaration(&cleaned) {
            return Err("repaired source has no top-level declaration".to_string());
        }
        Ok(cleaned)
    }
}

/// Run one repair round over the failing artifacts.
///
/// `project` is the full artifact set of the job, used only to build the
/// best-effort symbol index. Every attempt — fixed, failed, or rejected — is
/// appended to `memory` so later rounds see it.
pub async fn repair(
    executor: &RequestExecutor,
    project: &[Artifact],
    failing: &[Artifact],
    reports: &[ValidationReport],
    memory: &mut SessionMemory,
    sink: &dyn ProgressSink,
) -> RepairOutcome {
    let mut outcome = RepairOutcome::default();
    if failing.is_empty() {
        outcome.summary = "repair complete: nothing to fix".to_string();
        return outcome;
    }

    let round = failing.iter().map(|a| a.round).max().unwrap_or(1);
    sink.accept(LogEntry::info(
        ROLE,
        format!("analyzing {} failing artifact(s), round {}", failing.len(), round),
    ));

    // Aggregate error families first; the dominant one is the round's "core
    // issue" and drives nothing but ordering and reporting.
    let diagnostics: Vec<String> =
        failing.iter().map(|a| diagnostic_for(a, reports)).collect();
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for diag in &diagnostics {
        *counts.entry(error_type(diag)).or_insert(0) += 1;
    }
    outcome.core_issue = counts
        .iter()
        .max_by_key(|&(_, count)| *count)
        .map(|(family, _)| (*family).to_string());
    if let Some(core) = &outcome.core_issue {
        sink.accept(LogEntry::info(ROLE, format!("core issue: {}", core)));
    }

    // Application code before shared manifests, so a speculative manifest
    // patch never masks the real error.
    let mut order: Vec<usize> = (0..failing.len()).collect();
    order.sort_by_key(|&i| is_build_manifest(&failing[i].path));

    let symbol_index = build_symbol_index(project);

    for index in order {
        let artifact = &failing[index];
        let diagnostic = &diagnostics[index];

        if is_build_manifest(&artifact.path) && memory.has_repaired(&artifact.path) {
            sink.accept(LogEntry::warn(
                ROLE,
                format!("{} already patched this job, skipping", artifact.path),
            ));
            outcome.skipped.push(artifact.path.clone());
            continue;
        }

        match classify_diagnostic(diagnostic) {
            Classification::NonFixable(pattern) => {
                sink.accept(LogEntry::warn(
                    ROLE,
                    format!("{} is not auto-fixable ({})", artifact.path, pattern),
                ));
                outcome.unfixable.push(ArtifactReport {
                    path: artifact.path.clone(),
                    reason: format!("non-recoverable failure: {}", pattern),
                    diagnostic: Some(diagnostic.clone()),
                });
                continue;
            }
            Classification::Unrecognized => {
                outcome.unfixable.push(ArtifactReport {
                    path: artifact.path.clone(),
                    reason: "diagnostic matches no known fixable pattern".to_string(),
                    diagnostic: Some(diagnostic.clone()),
                });
                continue;
            }
            Classification::AutoFixable => {}
        }

        sink.accept(LogEntry::info(ROLE, format!("repairing {}", artifact.path)));
        let strategy = format!("llm fix: {}", error_type(diagnostic));
        let prompt = build_fix_prompt(artifact, diagnostic, symbol_index.as_deref(), memory);
        let request = CallRequest::from_prompt(prompt)
            .temperature(FIX_TEMPERATURE)
            .max_tokens(FIX_MAX_TOKENS);

        let raw = match executor.execute(&request).await {
            Ok(result) => result.content,
            Err(failure) => {
                let reason = format!("fix request failed: {}", failure);
                sink.accept(LogEntry::error(ROLE, format!("{}: {}", artifact.path, reason)));
                memory.record_attempt(round, &artifact.path, &strategy, false, Some(reason.clone()));
                outcome.failed.push(ArtifactReport {
                    path: artifact.path.clone(),
                    reason,
                    diagnostic: Some(diagnostic.clone()),
                });
                continue;
            }
        };

        match sanitize_fix(&artifact.path, &raw) {
            Ok(content) => {
                let fixed = artifact.repaired(content);
                memory.record_attempt(round, &artifact.path, &strategy, true, None);
                sink.accept(LogEntry::success(
                    ROLE,
                    format!("{} repaired (v{})", artifact.path, fixed.version),
                ));
                outcome.fixed.push(fixed);
            }
            Err(reason) => {
                sink.accept(LogEntry::warn(ROLE, format!("{}: {}", artifact.path, reason)));
                memory.record_attempt(round, &artifact.path, &strategy, false, Some(reason.clone()));
                outcome.failed.push(ArtifactReport {
                    path: artifact.path.clone(),
                    reason,
                    diagnostic: Some(diagnostic.clone()),
                });
            }
        }
    }

    // Record the round's error signature so a stuck loop can be detected.
    let mut paths: Vec<&str> = failing.iter().map(|a| a.path.as_str()).collect();
    paths.sort_unstable();
    let signature = format!(
        "{}|{}",
        outcome.core_issue.as_deref().unwrap_or("unknown"),
        paths.join(",")
    );
    if memory.record_error_signature(&signature) {
        sink.accept(LogEntry::warn(ROLE, "same failure repeating across rounds"));
    }

    outcome.summary = format!(
        "repair complete: {} fixed, {} failed, {} unfixable, {} skipped",
        outcome.fixed.len(),
        outcome.failed.len(),
        outcome.unfixable.len(),
        outcome.skipped.len()
    );
    sink.accept(LogEntry::info(ROLE, outcome.summary.clone()));
    outcome
}
