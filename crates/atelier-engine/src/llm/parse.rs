//! Text sanitization heuristics for model output.
//!
//! Models wrap code in prose, markdown fences, and trailing commentary. These
//! helpers cut generated text down to the plausible artifact span and check
//! elementary well-formedness before anything is persisted. All pure
//! functions, deliberately free of network or retry concerns.

/// Maximum length for response content quoted in error messages.
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Tokens that can open a source artifact. Used to discard leading prose.
const DECLARATION_TOKENS: &[&str] = &[
    "package ",
    "import ",
    "public ",
    "class ",
    "interface ",
    "enum ",
    "record ",
    "@",
    "<?xml",
    "<project",
];

/// Strip markdown code fences from a response
pub(crate) fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the fence header line (```java, ```xml, or bare ```).
        match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        }
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Trim to the span between the first declaration token and the last
/// closing-structure token, discarding prose the model wrapped around it.
pub(crate) fn trim_to_declaration_span(text: &str) -> String {
    let text = strip_markdown_fences(text);

    let start = DECLARATION_TOKENS
        .iter()
        .filter_map(|token| text.find(token))
        .min()
        .unwrap_or(0);
    let trimmed = &text[start..];

    // Cut anything after the last closing delimiter so trailing explanations
    // ("This fix adds the missing import...") never reach disk.
    let end = trimmed.rfind(['}', '>']).map(|idx| idx + 1).unwrap_or(trimmed.len());
    trimmed[..end].trim().to_string()
}

/// Whether nested block delimiters are balanced (never negative, ends at 0).
pub(crate) fn has_balanced_delimiters(text: &str) -> bool {
    let mut depth: i32 = 0;
    for c in text.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Whether the text contains a top-level type declaration.
pub(crate) fn has_type_declaration(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start();
        ["class ", "interface ", "enum ", "record "].iter().any(|kw| {
            line.starts_with(kw)
                || line.starts_with(&format!("public {}", kw))
                || line.starts_with(&format!("public final {}", kw))
                || line.starts_with(&format!("abstract {}", kw))
                || line.starts_with(&format!("public abstract {}", kw))
        })
    })
}

/// Whether a path names a shared build manifest rather than ordinary source.
pub(crate) fn is_build_manifest(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.eq_ignore_ascii_case("pom.xml")
        || name.eq_ignore_ascii_case("build.gradle")
        || name.eq_ignore_ascii_case("build.gradle.kts")
}

/// Elementary envelope check for a repaired build manifest.
pub(crate) fn is_valid_manifest(path: &str, content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return false;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.eq_ignore_ascii_case("pom.xml") {
        trimmed.starts_with('<') && trimmed.contains("<project") && trimmed.contains("</project>")
    } else {
        has_balanced_delimiters(trimmed)
    }
}

/// Extract a retry-after hint (seconds) from a rate-limit response body.
pub(crate) fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    let after_retry = &text_lower[pos..];
    for word in after_retry.split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

/// Truncate a string for inclusion in error messages or progress logs.
pub(crate) fn truncate_str(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}…", truncated)
}

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] =
        &["api_key", "apikey", "secret", "password", "credential", "bearer", "sk-"];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }
    truncated
}
