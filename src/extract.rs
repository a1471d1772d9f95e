use log::debug;
use regex::Regex;
use serde_json::Value;
use std::str::Chars;
use std::sync::OnceLock;

use crate::errors::ExtractError;
use crate::repair::repair;

/// A recovered key/payload pair from one line of inference output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    pub composite_key: String,
    pub text: String,
}

/// Key and payload pulled out of a line; either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pub key: Option<String>,
    pub text: Option<String>,
}

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""key"\s*:\s*"([^"]+)""#).expect("valid key regex"))
}

fn response_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""response"\s*:"#).expect("valid response regex"))
}

fn part_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)"parts"\s*:\s*\[\s*\{\s*"text"\s*:\s*"((?:\\.|[^"\\])*)""#)
            .expect("valid part regex")
    })
}

/// Same as `part_regex` but the string literal may run to the end of the line.
fn open_part_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)"parts"\s*:\s*\[\s*\{\s*"text"\s*:\s*"((?:\\.|[^"\\])*)\\?$"#)
            .expect("valid open part regex")
    })
}

/// Strategy 1: the line is well-formed JSON in the prediction envelope.
pub fn decode_strict(line: &str) -> Result<Fields, serde_json::Error> {
    let obj: Value = serde_json::from_str(line)?;
    let key = obj.get("key").and_then(Value::as_str).map(str::to_string);
    let text = obj.pointer("/response/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Fields { key, text })
}

/// Strategy 2: pattern scrape of the key and the first response part's text from a damaged line.
///
/// The request echoed into the line carries its own `parts`, so the text is only
/// searched for after the `"response"` key. Lines without one are searched whole.
pub fn scrape(line: &str) -> Fields {
    let key = key_regex().captures(line).map(|c| c[1].to_string());
    let body = response_regex().find(line).map_or(line, |m| &line[m.end()..]);
    let text = part_regex().captures(body)
        .or_else(|| open_part_regex().captures(body))
        .map(|c| unescape_fragment(&c[1]));
    Fields { key, text }
}

/// Decodes the body of a JSON string literal, tolerating a truncated escape at the end.
pub fn unescape_fragment(raw: &str) -> String {
    if let Ok(s) = serde_json::from_str::<String>(&format!("\"{}\"", raw)) {
        return s;
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let Some(unit) = hex_unit(&mut chars) else { continue };
                match unit {
                    0xD800..=0xDBFF => {
                        let combined = low_surrogate(&mut chars)
                            .map(|low| 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00))
                            .and_then(char::from_u32);
                        out.push(combined.unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                    _ => out.push(char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER)),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn hex_unit(chars: &mut Chars<'_>) -> Option<u32> {
    let hex: String = chars.by_ref().take(4).collect();
    if hex.len() < 4 {
        return None;
    }
    u32::from_str_radix(&hex, 16).ok()
}

/// Consumes a `\uDC00`..`\uDFFF` escape if one comes next.
fn low_surrogate(chars: &mut Chars<'_>) -> Option<u32> {
    let mut ahead = chars.clone();
    if ahead.next() != Some('\\') || ahead.next() != Some('u') {
        return None;
    }
    let low = hex_unit(&mut ahead).filter(|unit| (0xDC00..=0xDFFF).contains(unit))?;
    *chars = ahead;
    Some(low)
}

/// Runs strict decoding, fills gaps by scraping, and repairs the payload.
pub fn extract(line: &str) -> Result<ExtractedEntry, ExtractError> {
    let (mut fields, strict_error) = match decode_strict(line) {
        Ok(fields) => (fields, None),
        Err(e) => {
            debug!("Strict decode failed, falling back to pattern scrape: {}", e);
            (Fields::default(), Some(e.to_string()))
        }
    };
    if fields.key.is_none() || fields.text.is_none() {
        let scraped = scrape(line);
        fields.key = fields.key.or(scraped.key);
        fields.text = fields.text.or(scraped.text);
    }
    match fields {
        Fields { key: Some(composite_key), text: Some(text) } => Ok(ExtractedEntry { composite_key, text: repair(&text) }),
        Fields { key, .. } => Err(ExtractError::MissingFields {
            key,
            reason: strict_error.unwrap_or_else(|| "no key or response text in line".to_string()),
        }),
    }
}
