use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::{ErrorRecord, ErrorStage, Severity};

pub const DEFAULT_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub counts_by_stage: BTreeMap<ErrorStage, usize>,
    pub rows_failed: usize,
    pub minor_errors: usize,
    pub sample_entries: Vec<ErrorRecord>,
}

/// Collects every recovered failure of an invocation.
#[derive(Debug)]
pub struct ErrorTracker {
    entries: Vec<ErrorRecord>,
    sample_size: usize,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

impl ErrorTracker {
    pub fn new(sample_size: usize) -> Self {
        Self { entries: Vec::new(), sample_size }
    }

    pub fn record(&mut self, entry: ErrorRecord) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ErrorRecord>) {
        self.entries.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compact(&mut self) {
        self.entries.shrink_to_fit();
    }

    /// Record-level failures come first in the sample; field-level ones fill any space left.
    pub fn summary(&self) -> ErrorSummary {
        let mut summary = ErrorSummary::default();
        for entry in &self.entries {
            match entry.severity {
                Severity::Record => {
                    *summary.counts_by_stage.entry(entry.stage).or_insert(0) += 1;
                    summary.rows_failed += entry.rows;
                }
                Severity::Field => summary.minor_errors += 1,
            }
        }
        summary.sample_entries = self.entries.iter()
            .filter(|e| e.severity == Severity::Record)
            .chain(self.entries.iter().filter(|e| e.severity == Severity::Field))
            .take(self.sample_size)
            .cloned()
            .collect();
        summary
    }

    /// Logs every entry recorded since `since`, or a sample when there are many.
    pub fn log_since(&self, since: usize, label: &str) {
        let recent = &self.entries[since.min(self.entries.len())..];
        if recent.is_empty() {
            return;
        }
        if recent.len() <= self.sample_size {
            for entry in recent {
                warn!("{} {} error ({}): {}", label, entry.stage, entry.key.as_deref().unwrap_or("-"), entry.reason);
            }
        } else {
            warn!("{}: {} errors occurred. Sample:", label, recent.len());
            for entry in recent.iter().take(3) {
                warn!("  {} ({}): {}", entry.stage, entry.key.as_deref().unwrap_or("-"), entry.reason);
            }
        }
    }
}
