//! Destination column layout and per-field type coercion.
//!
//! Columns are read from the parsed response or the matched lookup row with a
//! path: a leading `/` means a JSON pointer, anything else is a top-level key.
//! A value that is missing or null becomes a null column. A value that cannot
//! be coerced to the column's kind is left out of the row and reported as a
//! field-level error, so one bad field never costs the whole row.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

use crate::errors::ConfigError;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    String,
    Integer,
    Float,
    Bool,
    Timestamp,
    Json,
}

fn default_kind() -> ColumnKind { ColumnKind::Json }

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub path: String,
    #[serde(default = "default_kind")]
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, path: &str, kind: ColumnKind) -> Self {
        Self { name: name.to_string(), path: path.to_string(), kind }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RowLayout {
    /// Every response field, overlaid with every lookup attribute.
    #[serde(rename = "passthrough")]
    Passthrough,
    #[serde(rename = "mapped")]
    Mapped { response: Vec<ColumnSpec>, lookup: Vec<ColumnSpec> },
}

impl Default for RowLayout {
    /// The analyzed-transcript table.
    fn default() -> Self {
        use ColumnKind::*;
        RowLayout::Mapped {
            response: vec![
                ColumnSpec::new("call_summary", "/callSummary", String),
                ColumnSpec::new("call_sentiment_incoming", "/callSentiment/incoming", String),
                ColumnSpec::new("call_sentiment_outgoing", "/callSentiment/outgoing", String),
                ColumnSpec::new("call_sentiment_summary", "/callSentimentSummary", String),
                ColumnSpec::new("call_tone", "/callTone", String),
                ColumnSpec::new("language_code", "/languageCode", String),
                ColumnSpec::new("reason_for_call_summary", "/reasonForCall/summary", String),
                ColumnSpec::new("reason_for_call_intent", "/reasonForCall/intent", String),
                ColumnSpec::new("reason_for_call_inquiry_question", "/reasonForCall/inquiryQuestion", String),
                ColumnSpec::new("reason_for_call_product", "/reasonForCall/product", String),
                ColumnSpec::new("reason_for_call_product_category", "/reasonForCall/productCategory", String),
                ColumnSpec::new("agent_response_resolved", "/agentResponse/resolved", Bool),
                ColumnSpec::new("agent_response_summary", "/agentResponse/summary", String),
                ColumnSpec::new("agent_response_action", "/agentResponse/action", String),
                ColumnSpec::new("products", "/products", Json),
            ],
            lookup: vec![
                ColumnSpec::new("referenceId", "referenceId", String),
                ColumnSpec::new("interactionId", "interactionId", String),
                ColumnSpec::new("event_timestamp", "event_timestamp", Timestamp),
            ],
        }
    }
}

impl RowLayout {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let RowLayout::Mapped { response, lookup } = self {
            let mut seen = HashSet::new();
            for column in response.iter().chain(lookup.iter()) {
                if column.name.is_empty() || column.path.is_empty() {
                    return Err(ConfigError::InvalidParameter { name: "columns".to_string(), reason: "column name and path must be set".to_string() });
                }
                if !seen.insert(column.name.as_str()) {
                    return Err(ConfigError::InvalidParameter { name: "columns".to_string(), reason: format!("duplicate column '{}'", column.name) });
                }
            }
        }
        Ok(())
    }
}

/// A leading `/` makes `path` a JSON pointer into `fields`; otherwise it names a top-level field.
fn get_field<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    match path.strip_prefix('/') {
        Some(pointer) => {
            let (head, tail) = pointer.split_once('/').map_or((pointer, None), |(h, t)| (h, Some(t)));
            let head = head.replace("~1", "/").replace("~0", "~");
            let first = fields.get(&head)?;
            match tail {
                Some(rest) => first.pointer(&format!("/{}", rest)),
                None => Some(first),
            }
        }
        None => fields.get(path),
    }
}

/// Looks up `column` in `fields` and coerces it. `Ok(Value::Null)` for missing values.
pub fn extract_column(fields: &Map<String, Value>, column: &ColumnSpec) -> Result<Value, String> {
    match get_field(fields, &column.path) {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(value) => coerce(value, column.kind),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn coerce(value: &Value, kind: ColumnKind) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        ColumnKind::Json => Ok(value.clone()),
        ColumnKind::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("expected string, found {}", kind_name(other))),
        },
        ColumnKind::Integer => match value {
            Value::Number(n) => n.as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64).map(|f| f as i64))
                .map(Value::from)
                .ok_or_else(|| format!("{} is not an integer", n)),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| format!("'{}' is not an integer", s)),
            other => Err(format!("expected integer, found {}", kind_name(other))),
        },
        ColumnKind::Float => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed.and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("{} is not a finite number", value))
        }
        ColumnKind::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => Ok(Value::Bool(n.as_i64() == Some(1))),
            other => Err(format!("expected boolean, found {}", kind_name(other))),
        },
        ColumnKind::Timestamp => normalize_timestamp(value)
            .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .ok_or_else(|| format!("{} is not a recognizable timestamp", value)),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][ UTC]`, bare dates and epoch seconds.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            let naive = s.strip_suffix(" UTC").or_else(|| s.strip_suffix('Z')).unwrap_or(s);
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
                    return Some(ts.and_utc());
                }
            }
            if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
                return Some(ts.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(naive, "%Y-%m-%d").ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|ts| ts.and_utc())
        }
        _ => None,
    }
}
