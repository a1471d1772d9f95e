use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::retry::{is_retryable_message, Classify};

/// Pipeline stage an [`ErrorRecord`] was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Extract,
    Parse,
    Join,
    Write,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStage::Extract => write!(f, "extract"),
            ErrorStage::Parse => write!(f, "parse"),
            ErrorStage::Join => write!(f, "join"),
            ErrorStage::Write => write!(f, "write"),
        }
    }
}

/// `Record` errors cost the row; `Field` errors only cost one coerced column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Record,
    Field,
}

/// One recovered failure. Appended to the tracker, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub stage: ErrorStage,
    pub key: Option<String>,
    pub reason: String,
    pub rows: usize,
    pub severity: Severity,
}

impl ErrorRecord {
    pub fn record(stage: ErrorStage, key: Option<&str>, reason: impl Into<String>) -> Self {
        Self { stage, key: key.map(str::to_string), reason: reason.into(), rows: 1, severity: Severity::Record }
    }

    pub fn batch(stage: ErrorStage, reason: impl Into<String>, rows: usize) -> Self {
        Self { stage, key: None, reason: reason.into(), rows, severity: Severity::Record }
    }

    pub fn field(stage: ErrorStage, key: &str, reason: impl Into<String>) -> Self {
        Self { stage, key: Some(key.to_string()), reason: reason.into(), rows: 0, severity: Severity::Field }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required parameters: {0:?}")]
    MissingParameters(Vec<String>),
    #[error("could not parse output location: {0}")]
    OutputLocation(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no prediction fragments (predictions*.jsonl) under '{container}/{prefix}' ({listed} objects listed)")]
    NoFragments { container: String, prefix: String, listed: usize },
    #[error("object store error: {message}")]
    Storage { message: String, retryable: bool },
    #[error("could not decode fragment '{name}': {reason}")]
    Decode { name: String, reason: String },
    #[error("i/o error reading results: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::NoFragments { .. } | FetchError::Decode { .. } => false,
            FetchError::Storage { message, retryable } => *retryable || is_retryable_message(message),
            FetchError::Io(e) => is_retryable_io(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("required field(s) not found: {reason}")]
    MissingFields { key: Option<String>, reason: String },
}

impl ExtractError {
    pub fn key(&self) -> Option<&str> {
        match self {
            ExtractError::MissingFields { key, .. } => key.as_deref(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error("expected object, got {found}")]
    NotAnObject { found: &'static str },
}

#[derive(Debug, Error, PartialEq)]
pub enum JoinError {
    #[error("could not decode composite key '{key}': {reason}")]
    KeyDecode { key: String, reason: String },
    #[error("no lookup rows for phone token")]
    NoCandidates,
    #[error("none of {candidates} lookup rows match interaction '{interaction_id}'")]
    NoInteractionMatch { interaction_id: String, candidates: usize },
    #[error("ambiguous match: {candidates} lookup rows qualify")]
    Ambiguous { candidates: usize },
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup source unavailable: {0}")]
    Unavailable(String),
    #[error("lookup query failed: {0}")]
    Query(String),
    #[error("lookup i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lookup data error: {0}")]
    Csv(#[from] csv::Error),
}

impl Classify for LookupError {
    fn is_retryable(&self) -> bool {
        match self {
            LookupError::Unavailable(_) => true,
            LookupError::Query(message) => is_retryable_message(message),
            LookupError::Io(e) => is_retryable_io(e),
            LookupError::Csv(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteErrorKind {
    RateLimited,
    Transient,
    Timeout,
    Schema,
    Permission,
    NotFound,
    Other,
}

impl fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteErrorKind::RateLimited => write!(f, "rate limited"),
            WriteErrorKind::Transient => write!(f, "transient"),
            WriteErrorKind::Timeout => write!(f, "timeout"),
            WriteErrorKind::Schema => write!(f, "schema"),
            WriteErrorKind::Permission => write!(f, "permission"),
            WriteErrorKind::NotFound => write!(f, "not found"),
            WriteErrorKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
}

impl WriteError {
    pub fn new(kind: WriteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Builds an error from a raw store message, inferring the kind from its wording.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if ["ratelimitexceeded", "rate limit", "429", "quota"].iter().any(|k| lower.contains(k)) {
            WriteErrorKind::RateLimited
        } else if ["timeout", "timed out", "deadline"].iter().any(|k| lower.contains(k)) {
            WriteErrorKind::Timeout
        } else if ["permission", "access denied", "forbidden", "403"].iter().any(|k| lower.contains(k)) {
            WriteErrorKind::Permission
        } else if ["not found", "notfound", "404"].iter().any(|k| lower.contains(k)) {
            WriteErrorKind::NotFound
        } else if ["schema", "no such field", "invalid"].iter().any(|k| lower.contains(k)) {
            WriteErrorKind::Schema
        } else if is_retryable_message(&lower) {
            WriteErrorKind::Transient
        } else {
            WriteErrorKind::Other
        };
        Self { kind, message }
    }

    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match error.kind() {
            ErrorKind::TimedOut => WriteErrorKind::Timeout,
            ErrorKind::Interrupted | ErrorKind::WouldBlock => WriteErrorKind::Transient,
            ErrorKind::PermissionDenied => WriteErrorKind::Permission,
            ErrorKind::NotFound => WriteErrorKind::NotFound,
            _ => WriteErrorKind::Other,
        };
        Self::new(kind, error.to_string())
    }
}

impl Classify for WriteError {
    fn is_retryable(&self) -> bool {
        match self.kind {
            WriteErrorKind::RateLimited | WriteErrorKind::Transient | WriteErrorKind::Timeout => true,
            WriteErrorKind::Schema | WriteErrorKind::Permission | WriteErrorKind::NotFound => false,
            WriteErrorKind::Other => is_retryable_message(&self.message),
        }
    }
}

/// Failures that stop an invocation before or between chunks.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("destination unavailable: {0}")]
    Destination(WriteError),
}

fn is_retryable_io(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_kinds_follow_store_wording() {
        assert_eq!(WriteError::from_message("rateLimitExceeded: slow down").kind, WriteErrorKind::RateLimited);
        assert_eq!(WriteError::from_message("HTTP 503 Service Unavailable").kind, WriteErrorKind::Transient);
        assert_eq!(WriteError::from_message("Deadline exceeded").kind, WriteErrorKind::Timeout);
        assert_eq!(WriteError::from_message("Permission denied on table").kind, WriteErrorKind::Permission);
        assert_eq!(WriteError::from_message("no such field: call_mood").kind, WriteErrorKind::Schema);
        assert_eq!(WriteError::from_message("something odd").kind, WriteErrorKind::Other);
    }

    #[test]
    fn typed_kinds_decide_retryability() {
        assert!(WriteError::new(WriteErrorKind::RateLimited, "x").is_retryable());
        assert!(!WriteError::new(WriteErrorKind::Permission, "503 but denied").is_retryable());
        assert!(WriteError::new(WriteErrorKind::Other, "backend unavailable").is_retryable());
        assert!(!WriteError::new(WriteErrorKind::Other, "bad row").is_retryable());
    }

    #[test]
    fn missing_fragments_are_not_retried() {
        let err = FetchError::NoFragments { container: "b".into(), prefix: "p".into(), listed: 0 };
        assert!(!err.is_retryable());
        let err = FetchError::Storage { message: "deadline exceeded".into(), retryable: false };
        assert!(err.is_retryable());
    }
}
