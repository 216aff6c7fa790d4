//! Validator and compiler output, parsed best-effort.
//!
//! The core treats external validators and build tools as opaque text
//! producers. A [`ValidationReport`] keeps the raw text verbatim and extracts
//! discrete `(file, line, severity, message)` records where the output matches
//! common compiler shapes. Parsing failures never matter: an empty `parsed`
//! list is a valid report.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    fn parse(text: &str) -> Severity {
        match text.to_ascii_lowercase().as_str() {
            "warning" | "warn" => Severity::Warning,
            "note" | "info" => Severity::Note,
            _ => Severity::Error,
        }
    }
}

/// One discrete diagnostic record extracted from raw tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDiagnostic {
    pub file: String,
    pub line: u32,
    pub severity: Severity,
    pub message: String,
}

/// Raw diagnostic output plus whatever records could be extracted from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub raw: String,
    pub parsed: Vec<ParsedDiagnostic>,
}

// `path/File.ext:12: error: message` (clang/javac style, optional column).
fn line_style() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*([^\s:\[\]]+\.\w+):(\d+)(?::\d+)?:\s*(error|warning|note|info)?:?\s*(.+)$")
            .unwrap()
    })
}

// `[ERROR] path/File.ext:[12,5] message` (build-tool style).
fn bracket_style() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\[(ERROR|WARNING|INFO)\]\s+([^\s\[\]]+\.\w+):\[(\d+),\d+\]\s*(.+)$")
            .unwrap()
    })
}

impl ValidationReport {
    /// Wrap raw tool output, extracting discrete records where possible.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut parsed = Vec::new();

        for caps in line_style().captures_iter(&raw) {
            let line = caps[2].parse().unwrap_or(0);
            parsed.push(ParsedDiagnostic {
                file: caps[1].to_string(),
                line,
                severity: caps
                    .get(3)
                    .map(|m| Severity::parse(m.as_str()))
                    .unwrap_or(Severity::Error),
                message: caps[4].trim().to_string(),
            });
        }

        for caps in bracket_style().captures_iter(&raw) {
            let line = caps[3].parse().unwrap_or(0);
            parsed.push(ParsedDiagnostic {
                file: caps[2].to_string(),
                line,
                severity: Severity::parse(&caps[1]),
                message: caps[4].trim().to_string(),
            });
        }

        Self { raw, parsed }
    }

    /// Diagnostic lines relevant to one file, rebuilt from raw output.
    ///
    /// Falls back to raw-line scanning when structured parsing found nothing,
    /// so a file's errors are never silently lost to an unknown tool format.
    pub fn lines_for_file(&self, file_name: &str) -> String {
        let mut out = String::new();
        for diag in &self.parsed {
            if diag.file.contains(file_name) {
                out.push_str(&format!(
                    "{}:{}: {:?}: {}\n",
                    diag.file, diag.line, diag.severity, diag.message
                ));
            }
        }
        if out.is_empty() {
            for line in self.raw.lines() {
                if line.contains(file_name) {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out
    }

    pub fn has_errors(&self) -> bool {
        self.parsed.iter().any(|d| d.severity == Severity::Error) || !self.raw.trim().is_empty()
    }
}

/// Outcome of an external compliance/structural check over generated output.
///
/// Produced by collaborator code (contract/schema/source checkers); the core
/// only reads `passed` and forwards `violations` into correction hints.
#[derive(Debug, Clone, Default)]
pub struct ComplianceReport {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl ComplianceReport {
    pub fn pass() -> Self {
        Self { passed: true, violations: Vec::new() }
    }

    pub fn fail(violations: Vec<String>) -> Self {
        Self { passed: false, violations }
    }
}
