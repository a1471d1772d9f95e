//! Best-effort structural repair of model-generated JSON.
//!
//! The repair walks the text once, tracking string state and a stack of open
//! containers together with what each container expects next. It drops
//! trailing commas and stray closers, completes dangling keys, colons and
//! partial literals, then closes whatever is still open. Text that is already
//! valid JSON is returned untouched, and a repair that still does not parse
//! yields the original (trimmed) text so the parser reports the real error.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Key,
    Colon,
    Value,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Object(Phase),
    Array(Phase),
}

impl Frame {
    fn closer(self) -> char {
        match self {
            Frame::Object(_) => '}',
            Frame::Array(_) => ']',
        }
    }

    fn is_object(self) -> bool {
        matches!(self, Frame::Object(_))
    }
}

fn is_valid(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok()
}

/// Removes a surrounding markdown code fence (```` ```json ... ``` ````).
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn repair(text: &str) -> String {
    let trimmed = strip_code_fence(text);
    if is_valid(trimmed) {
        return trimmed.to_string();
    }
    let Some(start) = trimmed.find(['{', '[']) else {
        return trimmed.to_string();
    };
    let repaired = close_structure(&trimmed[start..]);
    if is_valid(&repaired) {
        repaired
    } else {
        trimmed.to_string()
    }
}

/// A value (string, scalar or container) has just started in the top frame.
fn value_started(stack: &mut [Frame]) {
    match stack.last_mut() {
        Some(Frame::Object(phase)) if *phase == Phase::Value => *phase = Phase::After,
        Some(Frame::Array(phase)) if *phase == Phase::Value => *phase = Phase::After,
        _ => {}
    }
}

fn string_closed(stack: &mut [Frame], was_key: bool) {
    if was_key {
        if let Some(Frame::Object(phase)) = stack.last_mut() {
            *phase = Phase::Colon;
        }
    }
}

fn drop_trailing_comma(out: &mut String) {
    let end = out.trim_end().len();
    out.truncate(end);
    if out.ends_with(',') {
        out.pop();
    }
}

/// Completes a partial `true`/`false`/`null` or a number cut off mid-exponent.
fn finish_scalar(out: &mut String, start: usize) {
    let token = out[start..].to_string();
    for literal in ["true", "false", "null"] {
        if literal.starts_with(token.as_str()) {
            out.truncate(start);
            out.push_str(literal);
            return;
        }
    }
    let kept = token.trim_end_matches(['.', '-', '+', 'e', 'E']).len();
    if kept == 0 {
        out.truncate(start);
        out.push_str("null");
    } else {
        out.truncate(start + kept);
    }
}

fn close_frame(out: &mut String, frame: Frame) {
    match frame {
        Frame::Object(Phase::Colon) => out.push_str(": null"),
        Frame::Object(Phase::Value) => {
            let end = out.trim_end().len();
            if out[..end].ends_with(':') {
                out.push_str(" null");
            } else {
                drop_trailing_comma(out);
            }
        }
        _ => drop_trailing_comma(out),
    }
    out.push(frame.closer());
}

fn close_structure(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 8);
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escaped = false;
    let mut scalar_start: Option<usize> = None;

    for ch in body.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                string_closed(&mut stack, string_is_key);
            }
            continue;
        }

        let scalar_char = ch.is_ascii_alphanumeric() || matches!(ch, '-' | '+' | '.');
        if !scalar_char {
            scalar_start = None;
        }

        match ch {
            '"' => {
                string_is_key = matches!(stack.last(), Some(Frame::Object(Phase::Key)));
                if !string_is_key {
                    value_started(&mut stack);
                }
                in_string = true;
                out.push(ch);
            }
            '{' | '[' => {
                value_started(&mut stack);
                stack.push(if ch == '{' { Frame::Object(Phase::Key) } else { Frame::Array(Phase::Value) });
                out.push(ch);
            }
            '}' | ']' => {
                let wants_object = ch == '}';
                if !stack.iter().any(|f| f.is_object() == wants_object) {
                    continue;
                }
                while let Some(frame) = stack.pop() {
                    close_frame(&mut out, frame);
                    if frame.is_object() == wants_object {
                        break;
                    }
                }
                if stack.is_empty() {
                    return out;
                }
            }
            ':' => {
                if let Some(Frame::Object(phase)) = stack.last_mut() {
                    *phase = Phase::Value;
                }
                out.push(ch);
            }
            ',' => {
                match stack.last_mut() {
                    Some(Frame::Object(phase)) => *phase = Phase::Key,
                    Some(Frame::Array(phase)) => *phase = Phase::Value,
                    None => {}
                }
                out.push(ch);
            }
            c if c.is_whitespace() => out.push(c),
            c => {
                if scalar_char && scalar_start.is_none() {
                    scalar_start = Some(out.len());
                    value_started(&mut stack);
                }
                out.push(c);
            }
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        string_closed(&mut stack, string_is_key);
    } else if let Some(start) = scalar_start {
        finish_scalar(&mut out, start);
    }
    while let Some(frame) = stack.pop() {
        close_frame(&mut out, frame);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repaired_value(text: &str) -> Value {
        let out = repair(text);
        serde_json::from_str(&out).unwrap_or_else(|e| panic!("repair of {:?} gave {:?}: {}", text, out, e))
    }

    #[test]
    fn malformed_fixtures_recover_intent() {
        let fixtures = [
            (r#"{"a": 1,}"#, json!({"a": 1})),
            (r#"{"a": [1, 2,], "b": "x",}"#, json!({"a": [1, 2], "b": "x"})),
            (r#"{"callSummary": "Customer asked about a refu"#, json!({"callSummary": "Customer asked about a refu"})),
            (r#"{"a": {"b": [1, 2"#, json!({"a": {"b": [1, 2]}})),
            (r#"{"a": 1, "b":"#, json!({"a": 1, "b": null})),
            (r#"{"a": 1, "b""#, json!({"a": 1, "b": null})),
            (r#"{"a": 1, "#, json!({"a": 1})),
            (r#"{"ok": tr"#, json!({"ok": true})),
            (r#"{"n": 12."#, json!({"n": 12})),
            (r#"{"a": [1, 2}"#, json!({"a": [1, 2]})),
            (r#"{"a": "line\"#, json!({"a": "line"})),
            (r#"{"a": 1}} trailing"#, json!({"a": 1})),
            ("```json\n{\"a\": 1}\n```", json!({"a": 1})),
            (r#"Here you go: {"a": "x"}"#, json!({"a": "x"})),
        ];
        for (input, expected) in fixtures {
            assert_eq!(repaired_value(input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn valid_json_is_untouched() {
        let text = r#"{"a": "keep , commas }", "b": [1, {"c": null}]}"#;
        assert_eq!(repair(text), text);
    }

    #[test]
    fn braces_inside_strings_do_not_count() {
        assert_eq!(repaired_value(r#"{"a": "x}y]z", "b": "{"#), json!({"a": "x}y]z", "b": "{"}));
    }

    #[test]
    fn hopeless_text_is_returned_as_is() {
        assert_eq!(repair("  no json here "), "no json here");
        assert_eq!(repair("{\"a\" 1 2 3"), "{\"a\" 1 2 3");
    }

    #[test]
    fn strips_fences_without_language() {
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence(" plain "), "plain");
    }
}
