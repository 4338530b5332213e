//! Tolerant extraction of JSON from model replies.
//!
//! Models wrap JSON in prose, markdown fences or Python-literal quoting. The
//! parser tries a fixed cascade of strategies and returns the first
//! candidate that decodes to an object or array:
//!
//! 1. the whole reply,
//! 2. each fenced code block,
//! 3. the first balanced `{...}` span,
//! 4. the first balanced `[...]` span,
//! 5. each line on its own.
//!
//! Every candidate is also retried after a quote repair that rewrites
//! single-quoted keys and values to double quotes.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

const SAMPLE_CHARS: usize = 200;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence regex is valid")
});

/// A successfully extracted JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub value: Value,
    /// Compact re-serialization of `value`. This is what gets stored as the
    /// assistant turn.
    pub canonical: String,
    pub strategy: Strategy,
}

/// Extraction strategy that produced a [`Parsed`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Fenced,
    BalancedObject,
    BalancedArray,
    LineByLine,
}

impl Strategy {
    const ORDER: [Strategy; 5] = [
        Strategy::Direct,
        Strategy::Fenced,
        Strategy::BalancedObject,
        Strategy::BalancedArray,
        Strategy::LineByLine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Direct => "direct parse",
            Strategy::Fenced => "fenced code block",
            Strategy::BalancedObject => "balanced object scan",
            Strategy::BalancedArray => "balanced array scan",
            Strategy::LineByLine => "line-by-line",
        }
    }
}

/// Structured parse failure listing every attempted strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub attempts: Vec<String>,
    pub sample: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "failed to extract JSON from the response")?;
        writeln!(f, "attempted strategies:")?;
        for attempt in &self.attempts {
            writeln!(f, "  - {attempt}")?;
        }
        write!(f, "response sample: {:?}", self.sample)
    }
}

impl std::error::Error for ParseError {}

/// Extracts the first JSON object or array from `raw`.
pub fn parse_response(raw: &str) -> Result<Parsed, ParseError> {
    let text = raw.trim();
    let mut attempts = Vec::new();

    if text.is_empty() {
        attempts.push("direct parse: response is empty".to_string());
    } else {
        for strategy in Strategy::ORDER {
            let candidates = candidates(strategy, text);
            if candidates.is_empty() {
                attempts.push(format!("{}: no candidates", strategy.as_str()));
                continue;
            }
            let mut last_error = None;
            for candidate in &candidates {
                match decode_candidate(candidate) {
                    Ok(value) => {
                        let canonical = serde_json::to_string(&value)
                            .unwrap_or_else(|_| candidate.trim().to_string());
                        return Ok(Parsed {
                            value,
                            canonical,
                            strategy,
                        });
                    }
                    Err(err) => last_error = Some(err),
                }
            }
            attempts.push(format!(
                "{}: {} candidate(s), last error: {}",
                strategy.as_str(),
                candidates.len(),
                last_error.unwrap_or_default()
            ));
        }
    }

    Err(ParseError {
        attempts,
        sample: text.chars().take(SAMPLE_CHARS).collect(),
    })
}

fn candidates(strategy: Strategy, text: &str) -> Vec<String> {
    match strategy {
        Strategy::Direct => vec![text.to_string()],
        Strategy::Fenced => FENCE_RE
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|block| !block.is_empty())
            .collect(),
        Strategy::BalancedObject => balanced_spans(text, '{', '}'),
        Strategy::BalancedArray => balanced_spans(text, '[', ']'),
        Strategy::LineByLine => text
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{') || line.starts_with('['))
            .map(str::to_string)
            .collect(),
    }
}

/// Decodes a candidate strictly, then after quote repair. Only objects and
/// arrays are accepted.
fn decode_candidate(candidate: &str) -> Result<Value, String> {
    let strict = serde_json::from_str::<Value>(candidate);
    let err = match strict {
        Ok(value) if is_structured(&value) => return Ok(value),
        Ok(_) => "not an object or array".to_string(),
        Err(err) => err.to_string(),
    };

    let repaired = repair_quotes(candidate);
    if repaired != candidate {
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            if is_structured(&value) {
                return Ok(value);
            }
        }
    }
    Err(err)
}

fn is_structured(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

/// Rewrites Python-literal style JSON (`{'a': 'b', 'ok': True,}`) into strict
/// JSON: single-quoted strings become double-quoted, `True`/`False`/`None`
/// become JSON literals and trailing commas are dropped. String contents are
/// never touched.
fn repair_quotes(candidate: &str) -> String {
    let chars: Vec<char> = candidate.chars().collect();
    let mut out = String::with_capacity(candidate.len());
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        match ch {
            '"' | '\'' => {
                let (literal, next) = read_string(&chars, idx);
                out.push_str(&literal);
                idx = next;
            }
            ',' => {
                let next = chars[idx + 1..]
                    .iter()
                    .find(|c| !c.is_whitespace())
                    .copied();
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(',');
                }
                idx += 1;
            }
            c if c.is_ascii_alphabetic() => {
                let start = idx;
                while idx < chars.len() && (chars[idx].is_ascii_alphanumeric() || chars[idx] == '_') {
                    idx += 1;
                }
                let word: String = chars[start..idx].iter().collect();
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            _ => {
                out.push(ch);
                idx += 1;
            }
        }
    }
    out
}

/// Reads the string literal opening at `start` and returns it re-quoted with
/// double quotes, plus the index just past its closing delimiter.
fn read_string(chars: &[char], start: usize) -> (String, usize) {
    let delim = chars[start];
    let mut out = String::from('"');
    let mut idx = start + 1;
    while idx < chars.len() {
        let ch = chars[idx];
        if ch == '\\' && idx + 1 < chars.len() {
            let next = chars[idx + 1];
            if delim == '\'' && next == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(next);
            }
            idx += 2;
            continue;
        }
        if ch == delim {
            out.push('"');
            return (out, idx + 1);
        }
        if ch == '"' {
            out.push_str("\\\"");
        } else {
            out.push(ch);
        }
        idx += 1;
    }
    // unterminated literal
    (chars[start..].iter().collect(), chars.len())
}

/// Returns every balanced `open ... close` span, in order of its opening
/// bracket, in a single pass. Brackets inside single- or double-quoted
/// strings are ignored; a quote only opens a string where a JSON value or
/// key may start, so apostrophes in prose do not hide later brackets.
fn balanced_spans(text: &str, open: char, close: char) -> Vec<String> {
    let mut starts: Vec<usize> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev: Option<char> = None;
    for (idx, ch) in text.char_indices() {
        if let Some(delim) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == delim {
                quote = None;
                prev = Some(ch);
            }
            continue;
        }
        match ch {
            '"' | '\'' if !starts.is_empty() && matches!(prev, Some('{' | '[' | ',' | ':')) => {
                quote = Some(ch);
            }
            c if c == open => starts.push(idx),
            c if c == close => {
                if let Some(start) = starts.pop() {
                    spans.push((start, idx + c.len_utf8()));
                }
            }
            _ => {}
        }
        if !ch.is_whitespace() {
            prev = Some(ch);
        }
    }
    spans.sort_unstable_by_key(|&(start, _)| start);
    spans
        .into_iter()
        .map(|(start, end)| text[start..end].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json_directly() {
        let parsed = parse_response("{\n  \"tool\": \"bash\",\n  \"command\": \"ls\"\n}").expect("parse");
        assert_eq!(parsed.strategy, Strategy::Direct);
        assert_eq!(parsed.value, json!({"tool": "bash", "command": "ls"}));
        assert!(!parsed.canonical.contains('\n'));
        assert!(!parsed.canonical.contains(": "));
    }

    #[test]
    fn canonical_form_reparses_to_the_same_value() {
        let value = json!([{"tool": "finish", "summary": "done \"quoted\"", "goal_success": true}]);
        let text = serde_json::to_string_pretty(&value).expect("serialize");
        let parsed = parse_response(&text).expect("parse");
        assert_eq!(parsed.value, value);
        let again = parse_response(&parsed.canonical).expect("reparse");
        assert_eq!(again.value, value);
    }

    #[test]
    fn extracts_json_from_fenced_block_surrounded_by_prose() {
        let raw = "Sure! Here is the plan:\n```json\n{\"tool\": \"bash\", \"command\": \"uptime\"}\n```\nLet me know.";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(parsed.strategy, Strategy::Fenced);
        assert_eq!(parsed.value["command"], "uptime");
    }

    #[test]
    fn extracts_first_balanced_object_from_prose() {
        let raw = "I'll check disk usage {\"tool\": \"bash\", \"command\": \"echo '{x}'\"} then continue";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(parsed.strategy, Strategy::BalancedObject);
        assert_eq!(parsed.value["command"], "echo '{x}'");
    }

    #[test]
    fn nested_objects_are_tried_when_the_outer_one_is_not_json() {
        let raw = "Plan {next: {\"tool\": \"bash\", \"command\": \"ls\"}} ok";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(parsed.strategy, Strategy::BalancedObject);
        assert_eq!(parsed.value["command"], "ls");
    }

    #[test]
    fn unclosed_braces_and_apostrophes_do_not_hide_a_later_object() {
        let mut raw = "{ I'll try again ".to_string();
        raw.push_str(&"{".repeat(20_000));
        raw.push_str("{\"tool\": \"finish\", \"summary\": \"ok\"}");
        let parsed = parse_response(&raw).expect("parse");
        assert_eq!(parsed.strategy, Strategy::BalancedObject);
        assert_eq!(parsed.value["summary"], "ok");
    }

    #[test]
    fn extracts_balanced_array_when_no_object_parses() {
        let raw = "actions: [1, 2, 3] end";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(parsed.strategy, Strategy::BalancedArray);
        assert_eq!(parsed.value, json!([1, 2, 3]));
    }

    #[test]
    fn concatenated_json_lines_yield_the_first_object() {
        let raw = "{\"tool\": \"bash\", \"command\": \"ls\"}\n{\"tool\": \"finish\", \"summary\": \"ok\"}";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(parsed.value["tool"], "bash");
    }

    #[test]
    fn repairs_python_literal_quoting() {
        let raw = "{'tool': 'finish', 'summary': 'it \"works\"', 'goal_success': True,}";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(
            parsed.value,
            json!({"tool": "finish", "summary": "it \"works\"", "goal_success": true})
        );
    }

    #[test]
    fn repair_keeps_apostrophes_inside_double_quoted_strings() {
        let raw = "{\"summary\": \"it's done\", 'tool': 'finish'}";
        let parsed = parse_response(raw).expect("parse");
        assert_eq!(parsed.value, json!({"summary": "it's done", "tool": "finish"}));
    }

    #[test]
    fn scalar_json_is_not_accepted() {
        let err = parse_response("42").expect_err("scalars rejected");
        assert!(err.attempts[0].contains("not an object or array"));
    }

    #[test]
    fn failure_lists_strategies_and_a_bounded_sample() {
        let raw = "I could not decide what to do. ".repeat(20);
        let err = parse_response(&raw).expect_err("no json");
        assert_eq!(err.attempts.len(), Strategy::ORDER.len());
        assert!(err.attempts.iter().any(|a| a.starts_with("fenced code block")));
        assert_eq!(err.sample.chars().count(), SAMPLE_CHARS);
        let rendered = err.to_string();
        assert!(rendered.contains("line-by-line"));
        assert!(rendered.contains("response sample"));
    }

    #[test]
    fn empty_response_is_an_error() {
        let err = parse_response("   \n").expect_err("empty");
        assert_eq!(err.attempts, vec!["direct parse: response is empty".to_string()]);
        assert!(err.sample.is_empty());
    }
}
