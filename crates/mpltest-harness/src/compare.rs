//! Output comparison.
//!
//! Two modes, selected by the expected text itself:
//!
//! - `scan`: the captured stdout must satisfy the expected pattern as a
//!   whole-output match. Whitespace tokens in the pattern (`\n` escapes and
//!   `\s*`) span arbitrary whitespace including newlines, because cases print
//!   structured numeric sequences whose exact spacing is not significant.
//! - checksum: when the expected text carries a `Checksum=0x<hex>` payload,
//!   the comparator extracts the digest the program printed and compares the
//!   hex verbatim. The digest is an opaque oracle computed inside the test
//!   program; the harness never recomputes or validates it.

use anyhow::{Context, Result};
use regex::Regex;

/// What a case's stdout is judged against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutcome {
    /// `scan` pattern text, uncompiled.
    Pattern(String),
    /// Hex payload of an expected `Checksum=0x<hex>` line, without the `0x`.
    Checksum(String),
}

impl ExpectedOutcome {
    /// Classifies expected text: a `Checksum=0x<hex>` payload selects
    /// checksum mode, anything else is a scan pattern.
    pub fn from_expected_text(text: &str) -> ExpectedOutcome {
        match checksum_payload(text) {
            Some(hex) => ExpectedOutcome::Checksum(hex.to_string()),
            None => ExpectedOutcome::Pattern(text.trim_end().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Mismatch { expected: String, actual: String },
}

/// Judges captured stdout against the expected outcome.
///
/// An `Err` here means the expected pattern itself does not compile — a
/// defect in the test corpus, distinct from a test failure.
pub fn compare_output(expected: &ExpectedOutcome, stdout: &str) -> Result<Comparison> {
    let actual = normalize_line_endings(stdout);
    match expected {
        ExpectedOutcome::Pattern(pattern) => {
            let re = compile_scan_pattern(pattern)?;
            if re.is_match(&actual) {
                Ok(Comparison::Match)
            } else {
                Ok(Comparison::Mismatch {
                    expected: pattern.clone(),
                    actual,
                })
            }
        }
        ExpectedOutcome::Checksum(hex) => {
            let printed = checksum_payload(&actual);
            // Exact string equality on the hex payload: no case folding, no
            // zero-padding normalization.
            if printed == Some(hex.as_str()) {
                Ok(Comparison::Match)
            } else {
                Ok(Comparison::Mismatch {
                    expected: format!("Checksum=0x{hex}"),
                    actual: match printed {
                        Some(p) => format!("Checksum=0x{p}"),
                        None => "<no checksum line in output>".to_string(),
                    },
                })
            }
        }
    }
}

/// Compiles a `scan` pattern eagerly so corpus-authoring defects surface
/// before any subprocess is spawned.
pub fn compile_scan_pattern(pattern: &str) -> Result<Regex> {
    let rewritten = rewrite_whitespace_tokens(pattern);
    Regex::new(&format!(r"^(?s:{rewritten})\s*$"))
        .with_context(|| format!("invalid expected pattern: {pattern:?}"))
}

/// Rewrites the pattern's whitespace tokens (`\n` escapes, `\s*`) to `\s*`
/// so expected `0\n` accepts `"0\n"`, `"0\r\n"`, and `"0   \n"` alike.
fn rewrite_whitespace_tokens(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix(r"\s*") {
            out.push_str(r"\s*");
            rest = after;
        } else if let Some(after) = tail.strip_prefix(r"\n") {
            out.push_str(r"\s*");
            rest = after;
        } else {
            // Any other escape passes through to the regex engine as is.
            let mut chars = tail.chars();
            out.push(chars.next().expect("leading backslash"));
            if let Some(c) = chars.next() {
                out.push(c);
                rest = &tail[1 + c.len_utf8()..];
            } else {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}

fn checksum_payload(text: &str) -> Option<&str> {
    // Last occurrence wins: fuzz cases print a start flag first and the
    // digest line at the end.
    let marker = "Checksum=0x";
    let pos = text.rfind(marker)?;
    let hex = &text[pos + marker.len()..];
    let end = hex
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(hex.len());
    if end == 0 {
        return None;
    }
    Some(&hex[..end])
}
