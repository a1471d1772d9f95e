use log::{debug, info, warn};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::coerce::{extract_column, RowLayout};
use crate::errors::{ErrorRecord, ErrorStage, JoinError, LookupError};
use crate::key::CompositeKey;
use crate::parse::ParsedResponse;
use crate::retry::RetryPolicy;

pub const PHONE_TOKEN_COLUMN: &str = "phone_number_token";
pub const INTERACTION_ID_COLUMN: &str = "interactionId";

/// A warehouse row describing one interaction for a phone token.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupRecord {
    pub phone_token: String,
    pub interaction_id: Option<String>,
    pub attributes: Map<String, Value>,
}

impl LookupRecord {
    /// Builds a record from a full row; the token and interaction columns stay in `attributes`.
    pub fn from_row(attributes: Map<String, Value>) -> Option<Self> {
        let phone_token = attributes.get(PHONE_TOKEN_COLUMN).and_then(Value::as_str)?.to_string();
        let interaction_id = attributes.get(INTERACTION_ID_COLUMN).and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Some(Self { phone_token, interaction_id, attributes })
    }
}

/// Batched resolution of phone tokens to warehouse rows.
pub trait LookupSource {
    fn fetch_by_phone_tokens(&self, tokens: &BTreeSet<String>) -> Result<Vec<LookupRecord>, LookupError>;
}

/// Lookup table exported as CSV with a `phone_number_token` column. Empty cells are null.
pub struct CsvLookupSource {
    by_token: HashMap<String, Vec<LookupRecord>>,
}

impl CsvLookupSource {
    pub fn open(path: &Path) -> Result<Self, LookupError> {
        if !path.exists() {
            return Err(LookupError::Unavailable(format!("lookup table file {} not found", path.display())));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        if !headers.iter().any(|h| h == PHONE_TOKEN_COLUMN) {
            return Err(LookupError::Query(format!("{} has no '{}' column", path.display(), PHONE_TOKEN_COLUMN)));
        }
        let mut by_token: HashMap<String, Vec<LookupRecord>> = HashMap::new();
        let mut skipped = 0;
        for result in reader.records() {
            let record = result?;
            let attributes: Map<String, Value> = headers.iter().zip(record.iter())
                .map(|(h, v)| (h.to_string(), if v.is_empty() { Value::Null } else { Value::String(v.to_string()) }))
                .collect();
            match LookupRecord::from_row(attributes) {
                Some(row) => by_token.entry(row.phone_token.clone()).or_default().push(row),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} lookup rows without a phone token in {}", skipped, path.display());
        }
        info!("Loaded lookup table {} ({} phone tokens)", path.display(), by_token.len());
        Ok(Self { by_token })
    }
}

impl LookupSource for CsvLookupSource {
    fn fetch_by_phone_tokens(&self, tokens: &BTreeSet<String>) -> Result<Vec<LookupRecord>, LookupError> {
        Ok(tokens.iter().filter_map(|t| self.by_token.get(t)).flatten().cloned().collect())
    }
}

/// In-memory lookup with injectable transient failures.
#[derive(Default)]
pub struct MemoryLookupSource {
    records: Vec<LookupRecord>,
    failures_left: Cell<u32>,
    calls: Cell<usize>,
}

impl MemoryLookupSource {
    pub fn new(records: Vec<LookupRecord>) -> Self {
        Self { records, ..Self::default() }
    }

    /// The next `n` calls fail with a retryable error.
    pub fn fail_next(self, n: u32) -> Self {
        self.failures_left.set(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl LookupSource for MemoryLookupSource {
    fn fetch_by_phone_tokens(&self, tokens: &BTreeSet<String>) -> Result<Vec<LookupRecord>, LookupError> {
        self.calls.set(self.calls.get() + 1);
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(LookupError::Unavailable("simulated warehouse outage".to_string()));
        }
        Ok(self.records.iter().filter(|r| tokens.contains(&r.phone_token)).cloned().collect())
    }
}

/// Picks the single lookup row for `key`, or explains why there is none.
///
/// A lone candidate is taken as is. The interaction id only breaks ties between
/// several rows sharing a phone token.
pub fn select_candidate<'r>(
    key: &CompositeKey,
    candidates: &[&'r LookupRecord],
) -> Result<&'r LookupRecord, JoinError> {
    match (candidates, &key.interaction_id) {
        ([], _) => Err(JoinError::NoCandidates),
        ([only], _) => Ok(*only),
        (many, None) => Err(JoinError::Ambiguous { candidates: many.len() }),
        (many, Some(interaction_id)) => {
            let matching: Vec<&LookupRecord> = many.iter().copied()
                .filter(|c| c.interaction_id.as_deref() == Some(interaction_id.as_str()))
                .collect();
            match matching.as_slice() {
                [only] => Ok(*only),
                [] => Err(JoinError::NoInteractionMatch {
                    interaction_id: interaction_id.clone(),
                    candidates: many.len(),
                }),
                tied => Err(JoinError::Ambiguous { candidates: tied.len() }),
            }
        }
    }
}

/// Identifiers stamped onto every row of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMetadata {
    pub processed_at: String,
    pub workflow_id: String,
    pub execution_id: Option<String>,
    pub batch_id: Option<String>,
    pub include_columns: bool,
}

/// One enriched row for the destination store.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    /// Stable across re-runs; lets the store deduplicate at-least-once appends.
    pub row_id: String,
    pub composite_key: String,
    pub fields: Map<String, Value>,
}

pub fn generate_row_id(workflow_id: &str, composite_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(b":");
    hasher.update(composite_key.as_bytes());
    format!("row-sha256-{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Default)]
pub struct JoinOutcome {
    pub rows: Vec<OutputRow>,
    pub errors: Vec<ErrorRecord>,
}

pub struct RecordJoiner<'a> {
    layout: &'a RowLayout,
    metadata: &'a RowMetadata,
    policy: &'a RetryPolicy,
}

impl<'a> RecordJoiner<'a> {
    pub fn new(layout: &'a RowLayout, metadata: &'a RowMetadata, policy: &'a RetryPolicy) -> Self {
        Self { layout, metadata, policy }
    }

    /// Resolves every response against one batched lookup. Only a failed lookup is an `Err`.
    pub fn join(&self, responses: Vec<ParsedResponse>, lookup: &dyn LookupSource) -> Result<JoinOutcome, LookupError> {
        let mut outcome = JoinOutcome::default();
        let mut decoded = Vec::with_capacity(responses.len());
        for response in responses {
            match CompositeKey::decode(&response.composite_key) {
                Ok(key) => decoded.push((key, response)),
                Err(e) => outcome.errors.push(ErrorRecord::record(ErrorStage::Join, Some(&response.composite_key), e.to_string())),
            }
        }
        if decoded.is_empty() {
            return Ok(outcome);
        }

        let tokens: BTreeSet<String> = decoded.iter().map(|(key, _)| key.phone_token.clone()).collect();
        info!("Fetching interaction details for {} phone tokens...", tokens.len());
        let records = self.policy.run("lookup fetch", || lookup.fetch_by_phone_tokens(&tokens))?;
        let mut by_token: HashMap<&str, Vec<&LookupRecord>> = HashMap::new();
        for record in &records {
            by_token.entry(record.phone_token.as_str()).or_default().push(record);
        }

        for (key, response) in decoded {
            let candidates = by_token.get(key.phone_token.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            match select_candidate(&key, candidates) {
                Ok(matched) => {
                    let row = self.build_row(&key, response, matched, &mut outcome.errors);
                    outcome.rows.push(row);
                }
                Err(e) => {
                    debug!("Dropping '{}': {}", response.composite_key, e);
                    outcome.errors.push(ErrorRecord::record(ErrorStage::Join, Some(&response.composite_key), e.to_string()));
                }
            }
        }
        info!("Built {} rows, {} join errors", outcome.rows.len(), outcome.errors.len());
        Ok(outcome)
    }

    fn build_row(&self, key: &CompositeKey, response: ParsedResponse, matched: &LookupRecord, errors: &mut Vec<ErrorRecord>) -> OutputRow {
        let mut fields = Map::new();
        fields.insert(PHONE_TOKEN_COLUMN.to_string(), Value::String(key.phone_token.clone()));
        match self.layout {
            RowLayout::Passthrough => {
                fields.extend(response.fields);
                for (name, value) in &matched.attributes {
                    fields.insert(name.clone(), value.clone());
                }
            }
            RowLayout::Mapped { response: response_columns, lookup: lookup_columns } => {
                let sources = [(&response.fields, response_columns), (&matched.attributes, lookup_columns)];
                for (source, columns) in sources {
                    for column in columns {
                        match extract_column(source, column) {
                            Ok(value) => { fields.insert(column.name.clone(), value); }
                            Err(reason) => errors.push(ErrorRecord::field(
                                ErrorStage::Join,
                                &response.composite_key,
                                format!("column '{}' omitted: {}", column.name, reason),
                            )),
                        }
                    }
                }
            }
        }
        let row_id = generate_row_id(&self.metadata.workflow_id, &response.composite_key);
        if self.metadata.include_columns {
            fields.insert("row_id".to_string(), Value::String(row_id.clone()));
            fields.insert("processed_at".to_string(), Value::String(self.metadata.processed_at.clone()));
            fields.insert("workflow_id".to_string(), Value::String(self.metadata.workflow_id.clone()));
            if let Some(id) = &self.metadata.execution_id {
                fields.insert("execution_id".to_string(), Value::String(id.clone()));
            }
            if let Some(id) = &self.metadata.batch_id {
                fields.insert("batch_id".to_string(), Value::String(id.clone()));
            }
        }
        OutputRow { row_id, composite_key: response.composite_key, fields }
    }
}
