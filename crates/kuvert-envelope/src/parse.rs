// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! JSON extraction from raw model output.
//!
//! Models wrap envelopes in prose, markdown fences, or trailing commentary;
//! the strategies here are ordered from cheapest to most invasive and the
//! first one that yields a JSON object wins.  Nothing in this module mutates
//! envelope *content* — syntax repair only touches characters that can never
//! be part of a valid JSON document.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("empty response text")]
    Empty,
    /// Unbalanced braces or an odd quote count: the model ran out of output
    /// tokens mid-envelope.  Callers retry with a larger completion budget
    /// instead of attempting repair.
    #[error("response text appears truncated mid-JSON")]
    Truncated,
    #[error("could not extract a JSON object from the response")]
    NoJson,
}

/// Extract the envelope JSON object from raw model output.
pub fn extract_json(text: &str) -> Result<Value, ParseFailure> {
    let original = text.trim();
    if original.is_empty() {
        return Err(ParseFailure::Empty);
    }

    // Strategy 1: the whole text is the object.
    if let Some(obj) = parse_object(original) {
        return Ok(obj);
    }

    // Strategy 2: fenced code blocks (```json … ```, ``` … ```, `…`).
    if let Some(obj) = from_code_blocks(original) {
        debug!("envelope extracted from code block");
        return Ok(obj);
    }

    // Strategy 3: outermost balanced-brace span.
    if let Some(obj) = from_balanced_braces(original) {
        debug!("envelope extracted via brace scan");
        return Ok(obj);
    }

    // Strategy 4: drop prose lines outside the first '{' / last '}'.
    let trimmed = trim_prose_lines(original);
    if let Some(obj) = parse_object(&trimmed) {
        debug!("envelope extracted after line trimming");
        return Ok(obj);
    }

    // Strategy 5: common syntax slips (trailing commas, single quotes,
    // unquoted keys, comments).
    if let Some(obj) = parse_object(&repair_syntax(&trimmed)) {
        debug!("envelope extracted after syntax repair");
        return Ok(obj);
    }

    // All strategies failed.  Distinguish a truncated envelope (retryable
    // with more output tokens) from text that never contained one.
    if looks_truncated(original) {
        Err(ParseFailure::Truncated)
    } else {
        Err(ParseFailure::NoJson)
    }
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(m)) => Some(Value::Object(m)),
        _ => None,
    }
}

fn from_code_blocks(text: &str) -> Option<Value> {
    // (?s) so fenced bodies may span lines; non-greedy so multiple fences
    // in one response are each tried.
    let patterns = [
        r"(?s)```json\s*\n(.*?)\n\s*```",
        r"(?s)```\s*\n(.*?)\n\s*```",
        r"`([^`]+)`",
    ];
    for pat in patterns {
        let re = Regex::new(pat).expect("static regex");
        for caps in re.captures_iter(text) {
            if let Some(obj) = parse_object(caps.get(1)?.as_str()) {
                return Some(obj);
            }
        }
    }
    None
}

/// Scan for the first balanced `{…}` span and try to parse it.
fn from_balanced_braces(text: &str) -> Option<Value> {
    let mut depth = 0i32;
    let mut start = None;
    for (i, c) in text.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Some(obj) = parse_object(&text[s..=i]) {
                            return Some(obj);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop leading lines before the first one starting with `{` and trailing
/// lines after the last one ending with `}`.
fn trim_prose_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim_start().starts_with('{'))
        .unwrap_or(0);
    let end = lines
        .iter()
        .rposition(|l| l.trim_end().ends_with('}'))
        .map(|i| i + 1)
        .unwrap_or(lines.len());
    if start < end {
        lines[start..end].join("\n")
    } else {
        text.to_string()
    }
}

/// Fix the syntax slips models actually make: trailing commas, `//` and
/// `/* */` comments, single-quoted strings, unquoted keys.
fn repair_syntax(text: &str) -> String {
    let mut out = text.to_string();
    let rules: [(&str, &str); 5] = [
        (r"//[^\n]*\n", "\n"),
        (r"(?s)/\*.*?\*/", ""),
        (r",(\s*[}\]])", "$1"),
        (r#"'([^']*)'"#, "\"$1\""),
        (r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#, "$1\"$2\":"),
    ];
    for (pat, rep) in rules {
        let re = Regex::new(pat).expect("static regex");
        out = re.replace_all(&out, rep).into_owned();
    }
    out
}

/// Heuristic truncation check: unbalanced braces/brackets outside strings,
/// or an unterminated string at end of text.
pub fn looks_truncated(text: &str) -> bool {
    let mut brace = 0i64;
    let mut bracket = 0i64;
    let mut in_string = false;
    let mut escaped = false;
    let mut saw_open = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                brace += 1;
                saw_open = true;
            }
            '}' => brace -= 1,
            '[' => {
                bracket += 1;
                saw_open = true;
            }
            ']' => bracket -= 1,
            _ => {}
        }
    }
    saw_open && (in_string || brace > 0 || bracket > 0)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
