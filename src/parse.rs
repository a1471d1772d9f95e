use serde_json::{Map, Value};

use crate::errors::ParseError;
use crate::extract::ExtractedEntry;

/// A decoded payload. `fields` is always a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub composite_key: String,
    pub fields: Map<String, Value>,
}

pub fn parse(entry: &ExtractedEntry) -> Result<ParsedResponse, ParseError> {
    let payload: Value = serde_json::from_str(&entry.text).map_err(|e| ParseError::Invalid(e.to_string()))?;
    match payload {
        Value::Object(fields) => Ok(ParsedResponse { composite_key: entry.composite_key.clone(), fields }),
        Value::Array(_) => Err(ParseError::NotAnObject { found: "array" }),
        Value::String(_) => Err(ParseError::NotAnObject { found: "string" }),
        Value::Number(_) => Err(ParseError::NotAnObject { found: "number" }),
        Value::Bool(_) => Err(ParseError::NotAnObject { found: "bool" }),
        Value::Null => Err(ParseError::NotAnObject { found: "null" }),
    }
}
