use log::{debug, error, info, warn};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::errors::{ErrorRecord, ErrorStage, WriteError, WriteErrorKind};
use crate::join::OutputRow;
use crate::retry::RetryPolicy;

/// A row the store refused; `index` is relative to the slice passed to `insert_rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    pub index: usize,
    pub error: WriteError,
}

/// Rows not listed in `rejected` are confirmed written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertReport {
    pub rejected: Vec<RowRejection>,
}

/// The table that receives output rows.
pub trait DestinationStore {
    /// Fails when the table cannot receive rows at all.
    fn verify(&mut self) -> Result<(), WriteError>;
    fn insert_rows(&mut self, rows: &[OutputRow]) -> Result<InsertReport, WriteError>;
}

/// `failed_batches` holds one error per group of rows a batch lost: fatal
/// rejections and rows still rejected after the last retry are separate entries.
#[derive(Debug, Default)]
pub struct LoadResult {
    pub written: usize,
    pub failed_batches: Vec<ErrorRecord>,
}

pub struct BulkLoader<'a> {
    batch_size: usize,
    policy: &'a RetryPolicy,
    inter_batch_delay: Duration,
}

impl<'a> BulkLoader<'a> {
    pub fn new(batch_size: usize, policy: &'a RetryPolicy, inter_batch_delay: Duration) -> Self {
        Self { batch_size: batch_size.max(1), policy, inter_batch_delay }
    }

    pub fn load(&self, rows: &[OutputRow], destination: &mut dyn DestinationStore) -> LoadResult {
        let mut result = LoadResult::default();
        if rows.is_empty() {
            warn!("No rows to insert");
            return result;
        }
        let total_batches = rows.len().div_ceil(self.batch_size);
        info!("Inserting {} rows in {} batches of up to {}", rows.len(), total_batches, self.batch_size);

        let mut failed = 0;
        for (i, batch) in rows.chunks(self.batch_size).enumerate() {
            let batch_number = i + 1;
            let (written, failures) = self.load_batch(batch_number, batch, destination);
            result.written += written;
            if failures.is_empty() {
                debug!("Batch {}/{} inserted {} rows", batch_number, total_batches, written);
                if batch_number < total_batches && !self.inter_batch_delay.is_zero() {
                    thread::sleep(self.inter_batch_delay);
                }
                continue;
            }
            failed += 1;
            for record in failures {
                error!("Batch {}/{} failed: {}", batch_number, total_batches, record.reason);
                result.failed_batches.push(record);
            }
        }

        if failed * 2 > total_batches {
            warn!("Too many batch failures: {}/{} batches failed", failed, total_batches);
        }
        info!("Inserted {}/{} rows ({} failed batches)", result.written, rows.len(), failed);
        result
    }

    /// Returns the confirmed row count and one error for each group of rows that never made it.
    ///
    /// Fatal rejections are recorded at once; only the retryable ones are resent.
    fn load_batch(
        &self,
        batch_number: usize,
        batch: &[OutputRow],
        destination: &mut dyn DestinationStore,
    ) -> (usize, Vec<ErrorRecord>) {
        let mut pending: Cow<[OutputRow]> = Cow::Borrowed(batch);
        let mut written = 0;
        let mut failures = Vec::new();
        let mut attempt = 0;
        loop {
            match destination.insert_rows(&pending) {
                Ok(report) => {
                    let mut rejected: BTreeMap<usize, &WriteError> = BTreeMap::new();
                    for rejection in report.rejected.iter().filter(|r| r.index < pending.len()) {
                        rejected.entry(rejection.index).or_insert(&rejection.error);
                    }
                    written += pending.len() - rejected.len();
                    let (retryable, fatal): (Vec<_>, Vec<_>) =
                        rejected.into_iter().partition(|(_, error)| (self.policy.retryable)(*error));
                    if let Some((_, first)) = fatal.first() {
                        let reason = format!("batch {}: {} rows rejected ({})", batch_number, fatal.len(), first);
                        failures.push(ErrorRecord::batch(ErrorStage::Write, reason, fatal.len()));
                    }
                    let Some((_, first)) = retryable.first() else {
                        return (written, failures);
                    };
                    if attempt >= self.policy.max_retries {
                        let reason = format!(
                            "batch {}: {} rows still rejected after {} attempts ({})",
                            batch_number,
                            retryable.len(),
                            attempt + 1,
                            first
                        );
                        failures.push(ErrorRecord::batch(ErrorStage::Write, reason, retryable.len()));
                        return (written, failures);
                    }
                    let wait = self.policy.pause(attempt);
                    warn!("Batch {}: retrying {} rejected rows after {:?}", batch_number, retryable.len(), wait);
                    let resend: Vec<OutputRow> = retryable.iter().map(|(i, _)| pending[*i].clone()).collect();
                    pending = Cow::Owned(resend);
                }
                Err(e) => {
                    if !self.policy.should_retry(&e, attempt) {
                        let reason = format!("batch {}: {}", batch_number, e);
                        failures.push(ErrorRecord::batch(ErrorStage::Write, reason, pending.len()));
                        return (written, failures);
                    }
                    let wait = self.policy.pause(attempt);
                    warn!("Batch {} attempt {} failed: {}. Retried after {:?}", batch_number, attempt + 1, e, wait);
                }
            }
            attempt += 1;
        }
    }
}

/// Appends rows as JSON lines to `<dir>/<table>.jsonl`.
pub struct JsonlDestination {
    dir: PathBuf,
    path: PathBuf,
}

impl JsonlDestination {
    pub fn open(dir: impl Into<PathBuf>, table: &str) -> Self {
        let dir = dir.into();
        let path = dir.join(format!("{}.jsonl", table));
        Self { dir, path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl DestinationStore for JsonlDestination {
    fn verify(&mut self) -> Result<(), WriteError> {
        if !self.dir.is_dir() {
            return Err(WriteError::new(WriteErrorKind::NotFound, format!("destination directory {} not found", self.dir.display())));
        }
        info!("Verified destination {}", self.path.display());
        Ok(())
    }

    fn insert_rows(&mut self, rows: &[OutputRow]) -> Result<InsertReport, WriteError> {
        let mut buffer = String::new();
        for row in rows {
            let line = serde_json::to_string(&Value::Object(row.fields.clone()))
                .map_err(|e| WriteError::new(WriteErrorKind::Schema, e.to_string()))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)
            .map_err(|e| WriteError::from_io(&e))?;
        file.write_all(buffer.as_bytes()).map_err(|e| WriteError::from_io(&e))?;
        Ok(InsertReport::default())
    }
}

/// One scripted response of [`MemoryDestination`].
#[derive(Debug, Clone)]
pub enum ScriptedInsert {
    Fail(WriteError),
    /// Reject these indices of the next call; the rest are stored.
    Reject(Vec<(usize, WriteError)>),
}

/// Stores rows in memory. Calls consume the script first, then succeed.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    script: VecDeque<ScriptedInsert>,
    verify_error: Option<WriteError>,
    rows: Vec<OutputRow>,
    calls: usize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: ScriptedInsert) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn missing(mut self, error: WriteError) -> Self {
        self.verify_error = Some(error);
        self
    }

    pub fn rows(&self) -> &[OutputRow] {
        &self.rows
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DestinationStore for MemoryDestination {
    fn verify(&mut self) -> Result<(), WriteError> {
        match &self.verify_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn insert_rows(&mut self, rows: &[OutputRow]) -> Result<InsertReport, WriteError> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(ScriptedInsert::Fail(e)) => Err(e),
            Some(ScriptedInsert::Reject(rejections)) => {
                let rejected: BTreeSet<usize> = rejections.iter().map(|(i, _)| *i).collect();
                self.rows.extend(rows.iter().enumerate().filter(|(i, _)| !rejected.contains(i)).map(|(_, r)| r.clone()));
                Ok(InsertReport {
                    rejected: rejections.into_iter().map(|(index, error)| RowRejection { index, error }).collect(),
                })
            }
            None => {
                self.rows.extend_from_slice(rows);
                Ok(InsertReport::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn rows(n: usize) -> Vec<OutputRow> {
        (0..n).map(|i| {
            let mut fields = Map::new();
            fields.insert("n".to_string(), json!(i));
            OutputRow { row_id: format!("row-{}", i), composite_key: format!("k{}", i), fields }
        }).collect()
    }

    fn permission() -> WriteError {
        WriteError::new(WriteErrorKind::Permission, "Access Denied: table analyzed")
    }

    #[test]
    fn permission_rejections_are_not_retried() {
        let mut dest = MemoryDestination::new().then(ScriptedInsert::Reject(vec![(3, permission()), (7, permission())]));
        let policy = RetryPolicy::immediate(3);
        let result = BulkLoader::new(10, &policy, Duration::ZERO).load(&rows(10), &mut dest);
        assert_eq!(result.written, 8);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].rows, 2);
        assert_eq!(result.failed_batches[0].stage, ErrorStage::Write);
        assert!(result.failed_batches[0].reason.contains("permission"));
        assert_eq!(dest.calls(), 1);
        assert_eq!(dest.rows().len(), 8);
    }

    #[test]
    fn mixed_rejections_resend_only_the_retryable_rows() {
        let rate_limited = WriteError::new(WriteErrorKind::RateLimited, "quota exceeded");
        let mut dest = MemoryDestination::new()
            .then(ScriptedInsert::Reject(vec![(1, rate_limited), (2, permission())]));
        let policy = RetryPolicy::immediate(3);
        let result = BulkLoader::new(4, &policy, Duration::ZERO).load(&rows(4), &mut dest);
        assert_eq!(result.written, 3);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].rows, 1);
        assert!(result.failed_batches[0].reason.contains("permission"));
        assert_eq!(dest.calls(), 2);
        let stored: Vec<&str> = dest.rows().iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(stored, vec!["row-0", "row-3", "row-1"]);
    }

    #[test]
    fn transient_failure_is_invisible_after_retry() {
        let mut dest = MemoryDestination::new().then(ScriptedInsert::Fail(WriteError::from_message("503 backend unavailable")));
        let policy = RetryPolicy::immediate(3);
        let result = BulkLoader::new(10, &policy, Duration::ZERO).load(&rows(10), &mut dest);
        assert_eq!(result.written, 10);
        assert!(result.failed_batches.is_empty());
        assert_eq!(dest.calls(), 2);
    }

    #[test]
    fn only_retryable_rejections_are_resent() {
        let rate = WriteError::new(WriteErrorKind::RateLimited, "rateLimitExceeded");
        let mut dest = MemoryDestination::new().then(ScriptedInsert::Reject(vec![(1, rate.clone()), (4, rate)]));
        let policy = RetryPolicy::immediate(2);
        let result = BulkLoader::new(5, &policy, Duration::ZERO).load(&rows(5), &mut dest);
        assert_eq!(result.written, 5);
        assert!(result.failed_batches.is_empty());
        assert_eq!(dest.calls(), 2);
        let ids: Vec<&str> = dest.rows().iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(ids, vec!["row-0", "row-2", "row-3", "row-1", "row-4"]);
    }

    #[test]
    fn exhausted_retries_record_the_batch() {
        let timeout = || ScriptedInsert::Fail(WriteError::new(WriteErrorKind::Timeout, "deadline exceeded"));
        let mut dest = MemoryDestination::new().then(timeout()).then(timeout()).then(timeout());
        let policy = RetryPolicy::immediate(2);
        let result = BulkLoader::new(4, &policy, Duration::ZERO).load(&rows(6), &mut dest);
        assert_eq!(result.written, 2);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].rows, 4);
        assert_eq!(dest.calls(), 4);
    }

    #[test]
    fn fatal_batch_error_is_recorded_immediately() {
        let mut dest = MemoryDestination::new().then(ScriptedInsert::Fail(WriteError::from_message("no such field: call_mood")));
        let policy = RetryPolicy::immediate(3);
        let result = BulkLoader::new(3, &policy, Duration::ZERO).load(&rows(3), &mut dest);
        assert_eq!(result.written, 0);
        assert_eq!(result.failed_batches[0].rows, 3);
        assert_eq!(dest.calls(), 1);
    }

    #[test]
    fn jsonl_destination_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = JsonlDestination::open(dir.path(), "analyzed");
        dest.verify().unwrap();
        dest.insert_rows(&rows(2)).unwrap();
        dest.insert_rows(&rows(1)).unwrap();
        let content = std::fs::read_to_string(dest.path()).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec![r#"{"n":0}"#, r#"{"n":1}"#, r#"{"n":0}"#]);

        let mut missing = JsonlDestination::open(dir.path().join("nope"), "analyzed");
        assert_eq!(missing.verify().unwrap_err().kind, WriteErrorKind::NotFound);
    }
}
