//! Top-level driver for one invocation.
//!
//! The engine downloads every prediction fragment, decides between a single
//! pass and a sequential chunk loop, and runs extract, parse, join and load
//! over each chunk. The timeout budget is checked before every chunk and the
//! memory monitor after it. Whatever happens, the caller gets a [`RunSummary`].

use chrono::{SecondsFormat, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::{ProcessingConfig, ProcessingRequest};
use crate::errors::{ErrorRecord, ErrorStage, SetupError};
use crate::extract::extract;
use crate::fetch::{ObjectStore, ResultFetcher};
use crate::join::{LookupSource, RecordJoiner, RowMetadata};
use crate::load::{BulkLoader, DestinationStore};
use crate::memory_usage::{log_memory_usage, MemoryMonitor, MemoryProbe};
use crate::parse::parse;
use crate::retry::RetryPolicy;
use crate::tracker::ErrorTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    SingleWhole,
    ChunkedLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

/// What the orchestrator gets back from one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub rows_processed: usize,
    pub rows_failed: usize,
    pub elapsed_seconds: f64,
    pub truncated_by_timeout: bool,
    pub error_sample: Vec<ErrorRecord>,
    pub errors_by_stage: BTreeMap<ErrorStage, usize>,
    pub minor_errors: usize,
    pub chunks_processed: usize,
    pub total_chunks: usize,
    pub mode: Option<ProcessingMode>,
    pub workflow_id: String,
    pub message: String,
}

impl RunSummary {
    pub fn setup_failure(workflow_id: String, message: String) -> Self {
        Self {
            status: RunStatus::Error,
            rows_processed: 0,
            rows_failed: 0,
            elapsed_seconds: 0.0,
            truncated_by_timeout: false,
            error_sample: Vec::new(),
            errors_by_stage: BTreeMap::new(),
            minor_errors: 0,
            chunks_processed: 0,
            total_chunks: 0,
            mode: None,
            workflow_id,
            message,
        }
    }
}

/// Progress hooks; every method defaults to doing nothing.
pub trait ChunkObserver {
    fn on_start(&self, _mode: ProcessingMode, _total_chunks: usize) {}
    fn on_chunk(&self, _chunk: usize, _rows_written: usize) {}
    fn on_finish(&self, _summary: &RunSummary) {}
}

pub struct NoopObserver;

impl ChunkObserver for NoopObserver {}

/// External systems one invocation talks to.
pub struct Collaborators<'a> {
    pub store: &'a dyn ObjectStore,
    pub lookup: &'a dyn LookupSource,
    pub destination: &'a mut dyn DestinationStore,
    pub memory: Box<dyn MemoryProbe>,
    pub observer: &'a dyn ChunkObserver,
}

/// Owns the downloaded content and hands it out a bounded number of lines at a time.
struct LineCursor {
    content: String,
    pos: usize,
}

impl LineCursor {
    fn new(content: String) -> Self {
        Self { content, pos: 0 }
    }

    fn remaining_lines(&self) -> usize {
        self.content[self.pos..].lines().filter(|l| !l.trim().is_empty()).count()
    }

    /// Up to `max_lines` non-blank lines, or `None` once the content is exhausted.
    fn next_chunk(&mut self, max_lines: usize) -> Option<&str> {
        let rest = &self.content[self.pos..];
        let mut end = rest.len();
        let mut taken = 0;
        let mut offset = 0;
        for line in rest.split_inclusive('\n') {
            if !line.trim().is_empty() {
                if taken == max_lines {
                    end = offset;
                    break;
                }
                taken += 1;
            }
            offset += line.len();
        }
        if taken == 0 {
            self.pos = self.content.len();
            return None;
        }
        let start = self.pos;
        self.pos += end;
        Some(&self.content[start..start + end])
    }

    /// Drops the processed prefix and returns the number of bytes released.
    fn reclaim(&mut self) -> usize {
        let before = self.content.capacity();
        self.content.drain(..self.pos);
        self.pos = 0;
        self.content.shrink_to_fit();
        before.saturating_sub(self.content.capacity())
    }
}

#[derive(Debug, Default)]
struct Progress {
    rows_processed: usize,
    chunks_processed: usize,
    total_chunks: usize,
    truncated: bool,
    mode: Option<ProcessingMode>,
}

pub struct Engine {
    config: ProcessingConfig,
    policy: RetryPolicy,
}

impl Engine {
    pub fn new(config: ProcessingConfig) -> Self {
        let policy = config.retry_policy();
        Self { config, policy }
    }

    pub fn run(&self, collaborators: Collaborators<'_>) -> RunSummary {
        let started = Instant::now();
        let Collaborators { store, lookup, destination, memory, observer } = collaborators;
        let monitor = MemoryMonitor::with_probe(self.config.memory_threshold_percent, memory);
        info!("Processing batch results for workflow {} from {}", self.config.workflow_id, self.config.location);
        info!(
            "Joining against {} and loading into {}",
            self.config.lookup_table_ref(),
            self.config.output_table_ref()
        );
        log_memory_usage("start");

        let mut tracker = ErrorTracker::default();
        let mut progress = Progress::default();
        let outcome = self.execute(started, store, lookup, destination, &monitor, observer, &mut tracker, &mut progress);
        log_memory_usage("end");

        let summary = self.summarize(started, &tracker, &progress, outcome);
        match summary.status {
            RunStatus::Error => error!("Invocation failed: {}", summary.message),
            RunStatus::Partial => warn!("{}", summary.message),
            RunStatus::Success => info!("{}", summary.message),
        }
        observer.on_finish(&summary);
        summary
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        started: Instant,
        store: &dyn ObjectStore,
        lookup: &dyn LookupSource,
        destination: &mut dyn DestinationStore,
        monitor: &MemoryMonitor,
        observer: &dyn ChunkObserver,
        tracker: &mut ErrorTracker,
        progress: &mut Progress,
    ) -> Result<(), SetupError> {
        self.policy.run("verify destination", || destination.verify()).map_err(SetupError::Destination)?;

        let content = ResultFetcher::new(store, &self.policy).fetch(&self.config.location)?;
        info!("Downloaded {:.1}MB of prediction output", content.len() as f64 / (1024.0 * 1024.0));
        log_memory_usage("after download");

        let mode = self.choose_mode(content.len(), monitor);
        let mut cursor = LineCursor::new(content);
        let lines = cursor.remaining_lines();
        let chunk_size = match mode {
            ProcessingMode::ChunkedLoop => self.config.chunk_size,
            ProcessingMode::SingleWhole => usize::MAX,
        };
        progress.mode = Some(mode);
        progress.total_chunks = match mode {
            ProcessingMode::ChunkedLoop => lines.div_ceil(self.config.chunk_size),
            ProcessingMode::SingleWhole => usize::from(lines > 0),
        };
        info!("Processing {} lines in {:?} mode ({} chunks)", lines, mode, progress.total_chunks);
        observer.on_start(mode, progress.total_chunks);

        let metadata = RowMetadata {
            processed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            workflow_id: self.config.workflow_id.clone(),
            execution_id: self.config.execution_id.clone(),
            batch_id: self.config.batch_id.clone(),
            include_columns: self.config.include_metadata,
        };
        let mut first_line = 1;
        loop {
            if started.elapsed() >= self.config.timeout {
                if progress.chunks_processed < progress.total_chunks {
                    warn!(
                        "Timeout budget of {:?} reached after {}/{} chunks",
                        self.config.timeout, progress.chunks_processed, progress.total_chunks
                    );
                    progress.truncated = true;
                }
                break;
            }
            let Some(chunk) = cursor.next_chunk(chunk_size) else { break };
            let chunk_number = progress.chunks_processed + 1;
            info!("Processing chunk {}/{}", chunk_number, progress.total_chunks);
            let (lines_seen, written) = self.process_chunk(
                chunk,
                first_line,
                chunk_number,
                lookup,
                destination,
                &metadata,
                tracker,
            )?;
            first_line += lines_seen;
            progress.rows_processed += written;
            progress.chunks_processed = chunk_number;
            observer.on_chunk(chunk_number, written);

            if mode == ProcessingMode::ChunkedLoop && monitor.under_pressure() {
                let released = cursor.reclaim();
                tracker.compact();
                info!("Reclaimed {:.1}MB after chunk {}", released as f64 / (1024.0 * 1024.0), chunk_number);
            }
        }
        Ok(())
    }

    fn choose_mode(&self, content_bytes: usize, monitor: &MemoryMonitor) -> ProcessingMode {
        let mut chunking = self.config.enable_chunked_processing;
        if !chunking && monitor.under_pressure() {
            warn!("Memory pressure detected, enabling chunked processing");
            chunking = true;
        }
        if chunking && content_bytes > self.config.chunk_threshold_bytes {
            ProcessingMode::ChunkedLoop
        } else {
            ProcessingMode::SingleWhole
        }
    }

    /// Returns the non-blank lines consumed and the rows the destination confirmed.
    #[allow(clippy::too_many_arguments)]
    fn process_chunk(
        &self,
        chunk: &str,
        first_line: usize,
        chunk_number: usize,
        lookup: &dyn LookupSource,
        destination: &mut dyn DestinationStore,
        metadata: &RowMetadata,
        tracker: &mut ErrorTracker,
    ) -> Result<(usize, usize), SetupError> {
        let mark = tracker.len();
        let mut parsed = Vec::new();
        let mut seen = 0;
        for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
            let line_number = first_line + seen;
            seen += 1;
            match extract(line) {
                Ok(entry) => match parse(&entry) {
                    Ok(response) => parsed.push(response),
                    Err(e) => {
                        let reason = format!("line {}: {}", line_number, e);
                        tracker.record(ErrorRecord::record(ErrorStage::Parse, Some(&entry.composite_key), reason));
                    }
                },
                Err(e) => {
                    let reason = format!("line {}: {}", line_number, e);
                    tracker.record(ErrorRecord::record(ErrorStage::Extract, e.key(), reason));
                }
            }
        }
        info!("Chunk {}: {} of {} lines parsed", chunk_number, parsed.len(), seen);

        let joined = RecordJoiner::new(&self.config.layout, metadata, &self.policy).join(parsed, lookup)?;
        tracker.extend(joined.errors);
        let loader = BulkLoader::new(self.config.batch_size, &self.policy, self.config.inter_batch_delay);
        let loaded = loader.load(&joined.rows, destination);
        tracker.extend(loaded.failed_batches);
        tracker.log_since(mark, &format!("Chunk {}", chunk_number));
        Ok((seen, loaded.written))
    }

    fn summarize(
        &self,
        started: Instant,
        tracker: &ErrorTracker,
        progress: &Progress,
        outcome: Result<(), SetupError>,
    ) -> RunSummary {
        let errors = tracker.summary();
        let elapsed = round_seconds(started.elapsed());
        let (status, message) = match outcome {
            Err(e) => (RunStatus::Error, e.to_string()),
            Ok(()) if progress.truncated => (
                RunStatus::Partial,
                format!(
                    "Timeout after {}/{} chunks: {} rows processed, {} failed",
                    progress.chunks_processed, progress.total_chunks, progress.rows_processed, errors.rows_failed
                ),
            ),
            Ok(()) if !errors.counts_by_stage.is_empty() => (
                RunStatus::Partial,
                format!("Processed {} rows, {} failed", progress.rows_processed, errors.rows_failed),
            ),
            Ok(()) => (
                RunStatus::Success,
                format!("Processed {} rows in {:.2}s", progress.rows_processed, elapsed),
            ),
        };
        RunSummary {
            status,
            rows_processed: progress.rows_processed,
            rows_failed: errors.rows_failed,
            elapsed_seconds: elapsed,
            truncated_by_timeout: progress.truncated,
            error_sample: errors.sample_entries,
            errors_by_stage: errors.counts_by_stage,
            minor_errors: errors.minor_errors,
            chunks_processed: progress.chunks_processed,
            total_chunks: progress.total_chunks,
            mode: progress.mode,
            workflow_id: self.config.workflow_id.clone(),
            message,
        }
    }
}

/// Validates the request and runs it; invalid configuration becomes an error summary.
pub fn process_request(request: ProcessingRequest, collaborators: Collaborators<'_>) -> RunSummary {
    let workflow_id = request.workflow_id.clone().unwrap_or_default();
    match ProcessingConfig::try_from(request) {
        Ok(config) => Engine::new(config).run(collaborators),
        Err(e) => {
            error!("Invalid request: {}", e);
            let summary = RunSummary::setup_failure(workflow_id, SetupError::from(e).to_string());
            collaborators.observer.on_finish(&summary);
            summary
        }
    }
}

fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}
