use batch_reconciler::errors::{ErrorStage, WriteError, WriteErrorKind};
use batch_reconciler::fetch::{LocalObjectStore, MemoryObjectStore};
use batch_reconciler::join::{CsvLookupSource, LookupRecord, MemoryLookupSource, OutputRow};
use batch_reconciler::key::CompositeKey;
use batch_reconciler::load::{DestinationStore, InsertReport, JsonlDestination, MemoryDestination, ScriptedInsert};
use batch_reconciler::memory_usage::{FixedProbe, MemorySample};
use batch_reconciler::{process_request, Collaborators, Engine, NoopObserver, ProcessingConfig, ProcessingMode, ProcessingRequest, RunStatus, RunSummary};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::thread;
use std::time::Duration;

fn request(output_uri: &str) -> ProcessingRequest {
    let mut request = ProcessingRequest::new(output_uri);
    request.project_id = Some("analytics".into());
    request.dataset = Some("calls".into());
    request.workflow_id = Some("wf-2024-06".into());
    request.batch_id = Some("batch-3".into());
    request.lookup_table = Some("interactions".into());
    request.output_table = Some("analyzed".into());
    request.retry_base_delay_ms = 0;
    request.inter_batch_delay_ms = 0;
    request
}

fn engine(request: ProcessingRequest) -> Engine {
    Engine::new(ProcessingConfig::try_from(request).unwrap())
}

fn key(token: &str, interaction: &str) -> String {
    CompositeKey::new(token, Some(interaction)).encode()
}

fn line(token: &str, interaction: &str, payload: Value) -> String {
    json!({
        "key": key(token, interaction),
        "request": {"contents": [{"role": "user", "parts": [{"text": "Analyze this transcript"}]}]},
        "response": {"candidates": [{"content": {"role": "model", "parts": [{"text": payload.to_string()}]}}]}
    }).to_string()
}

fn lookup_row(token: &str, interaction: &str) -> LookupRecord {
    let row = json!({
        "phone_number_token": token,
        "interactionId": interaction,
        "referenceId": format!("ref-{}", interaction),
        "event_timestamp": "2024-05-01 09:30:00 UTC",
    });
    LookupRecord::from_row(row.as_object().unwrap().clone()).unwrap()
}

fn numbered(n: usize) -> (String, Vec<LookupRecord>) {
    let lines: Vec<String> = (0..n)
        .map(|i| line(&format!("tok-{}", i), &format!("I-{}", i), json!({"callSummary": format!("call {}", i), "callTone": "calm"})))
        .collect();
    let lookups = (0..n).map(|i| lookup_row(&format!("tok-{}", i), &format!("I-{}", i))).collect();
    (lines.join("\n"), lookups)
}

fn run(engine: &Engine, store: &MemoryObjectStore, lookup: &MemoryLookupSource, destination: &mut dyn DestinationStore, used_percent: f64) -> RunSummary {
    engine.run(Collaborators {
        store,
        lookup,
        destination,
        memory: Box::new(FixedProbe(MemorySample { used_percent, available_mb: 256.0 })),
        observer: &NoopObserver,
    })
}

fn without_timestamps(rows: &[OutputRow]) -> Vec<OutputRow> {
    let mut rows: Vec<OutputRow> = rows.iter().cloned().map(|mut row| {
        row.fields.remove("processed_at");
        row
    }).collect();
    rows.sort_by(|a, b| a.row_id.cmp(&b.row_id));
    rows
}

#[test]
fn repairable_lines_are_kept_and_garbage_is_recorded() {
    let valid = line("tok-1", "I-1", json!({"callSummary": "Billing question", "callTone": "calm"}));
    let truncated = format!(
        concat!(
            r#"{{"key": "{}", "request": {{"contents": [{{"role": "user", "parts": [{{"text": "Analyze this transcript"}}]}}]}}, "#,
            r#""response": {{"candidates": [{{"content": {{"parts": [{{"text": "{{\"callSummary\": \"Refund reque"#,
        ),
        key("tok-2", "I-2")
    );
    let content = [valid, truncated, "}}}} not even close".to_string()].join("\n");
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(vec![lookup_row("tok-1", "I-1"), lookup_row("tok-2", "I-2")]);
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(request("gs://bucket/job/")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.rows_processed, 2);
    assert_eq!(summary.rows_failed, 1);
    assert_eq!(summary.errors_by_stage.get(&ErrorStage::Extract), Some(&1));
    assert_eq!(summary.errors_by_stage.len(), 1);
    assert_eq!(summary.mode, Some(ProcessingMode::SingleWhole));
    assert!(!summary.truncated_by_timeout);

    let rows = destination.rows();
    assert_eq!(rows[1].fields["call_summary"], json!("Refund reque"));
    assert_eq!(rows[1].fields["referenceId"], json!("ref-I-2"));
    assert_eq!(rows[0].fields["event_timestamp"], json!("2024-05-01T09:30:00Z"));
    assert_eq!(rows[0].fields["batch_id"], json!("batch-3"));
    assert_eq!(lookup.calls(), 1);
}

#[test]
fn chunked_and_whole_modes_write_the_same_rows() {
    let (content, lookups) = numbered(25);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(lookups);

    let mut whole_request = request("gs://bucket/job");
    whole_request.enable_chunked_processing = false;
    let mut whole = MemoryDestination::new();
    let whole_summary = run(&engine(whole_request), &store, &lookup, &mut whole, 10.0);

    let mut chunked_request = request("gs://bucket/job");
    chunked_request.chunk_threshold_bytes = 0;
    chunked_request.chunk_size = 4;
    chunked_request.batch_size = 3;
    let mut chunked = MemoryDestination::new();
    let chunked_summary = run(&engine(chunked_request), &store, &lookup, &mut chunked, 10.0);

    assert_eq!(whole_summary.mode, Some(ProcessingMode::SingleWhole));
    assert_eq!(whole_summary.total_chunks, 1);
    assert_eq!(chunked_summary.mode, Some(ProcessingMode::ChunkedLoop));
    assert_eq!(chunked_summary.total_chunks, 7);
    assert_eq!(chunked_summary.chunks_processed, 7);
    assert_eq!(whole_summary.status, RunStatus::Success);
    assert_eq!(chunked_summary.status, RunStatus::Success);
    assert_eq!(whole_summary.rows_processed, 25);
    assert_eq!(chunked_summary.rows_processed, 25);
    assert_eq!(without_timestamps(whole.rows()), without_timestamps(chunked.rows()));
}

#[test]
fn memory_pressure_forces_chunking() {
    let (content, lookups) = numbered(6);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(lookups);
    let mut req = request("gs://bucket/job");
    req.enable_chunked_processing = false;
    req.chunk_threshold_bytes = 0;
    req.chunk_size = 2;
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(req), &store, &lookup, &mut destination, 97.5);

    assert_eq!(summary.mode, Some(ProcessingMode::ChunkedLoop));
    assert_eq!(summary.chunks_processed, 3);
    assert_eq!(summary.rows_processed, 6);
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(lookup.calls(), 3);
}

struct SlowDestination {
    inner: MemoryDestination,
    delay: Duration,
}

impl DestinationStore for SlowDestination {
    fn verify(&mut self) -> Result<(), WriteError> {
        self.inner.verify()
    }

    fn insert_rows(&mut self, rows: &[OutputRow]) -> Result<InsertReport, WriteError> {
        thread::sleep(self.delay);
        self.inner.insert_rows(rows)
    }
}

#[test]
fn timeout_stops_between_chunks_with_partial_result() {
    let (content, lookups) = numbered(10);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(lookups);
    let mut req = request("gs://bucket/job");
    req.chunk_threshold_bytes = 0;
    req.chunk_size = 2;
    let mut config = ProcessingConfig::try_from(req).unwrap();
    config.timeout = Duration::from_millis(100);
    let mut destination = SlowDestination { inner: MemoryDestination::new(), delay: Duration::from_millis(60) };

    let summary = run(&Engine::new(config), &store, &lookup, &mut destination, 10.0);

    assert!(summary.truncated_by_timeout);
    assert_eq!(summary.status, RunStatus::Partial);
    assert!(summary.chunks_processed >= 1 && summary.chunks_processed < 5);
    assert_eq!(summary.total_chunks, 5);
    assert_eq!(summary.rows_processed, summary.chunks_processed * 2);
    assert_eq!(destination.inner.rows().len(), summary.rows_processed);
    assert_eq!(summary.rows_failed, 0);
}

#[test]
fn fragments_are_read_in_name_order() {
    let store = MemoryObjectStore::new()
        .with_object("bucket", "job/predictions_00002.jsonl", &line("tok-b", "I-2", json!({"callTone": "tense"})))
        .with_object("bucket", "job/predictions_00001.jsonl", &format!("{}\n", line("tok-a", "I-1", json!({"callTone": "calm"}))))
        .with_object("bucket", "job/batch.log", "not a fragment");
    let lookup = MemoryLookupSource::new(vec![lookup_row("tok-a", "I-1"), lookup_row("tok-b", "I-2")]);
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.rows_processed, 2);
    let keys: Vec<&str> = destination.rows().iter().map(|r| r.composite_key.as_str()).collect();
    assert_eq!(keys, vec![key("tok-a", "I-1"), key("tok-b", "I-2")]);
}

#[test]
fn rerun_reports_the_same_count_and_row_ids() {
    let (content, lookups) = numbered(5);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(lookups);
    let mut destination = MemoryDestination::new();

    let first = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);
    let second = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(first.rows_processed, second.rows_processed);
    let rows = destination.rows();
    assert_eq!(rows.len(), 10);
    let (a, b) = rows.split_at(5);
    let ids = |rows: &[OutputRow]| rows.iter().map(|r| r.row_id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(a), ids(b));
}

#[test]
fn missing_fragments_are_a_setup_error() {
    let store = MemoryObjectStore::new().with_object("bucket", "job/batch.log", "nothing here");
    let lookup = MemoryLookupSource::new(vec![]);
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.status, RunStatus::Error);
    assert!(summary.message.contains("no prediction fragments"), "{}", summary.message);
    assert_eq!(summary.rows_processed, 0);
    assert_eq!(destination.calls(), 0);
}

#[test]
fn transient_fetch_failures_are_retried() {
    let (content, lookups) = numbered(2);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content).fail_next(2);
    let lookup = MemoryLookupSource::new(lookups);
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.rows_processed, 2);
    assert_eq!(store.reads(), 3);
}

#[test]
fn unreachable_lookup_is_a_setup_error() {
    let (content, _) = numbered(3);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(vec![]).fail_next(10);
    let mut req = request("gs://bucket/job");
    req.max_retries = 1;
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(req), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.status, RunStatus::Error);
    assert!(summary.message.contains("lookup"), "{}", summary.message);
    assert_eq!(lookup.calls(), 2);
}

#[test]
fn missing_destination_is_a_setup_error() {
    let (content, lookups) = numbered(1);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(lookups);
    let mut destination = MemoryDestination::new().missing(WriteError::new(WriteErrorKind::NotFound, "table analyzed not found"));

    let summary = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.status, RunStatus::Error);
    assert!(summary.message.starts_with("destination unavailable"));
    assert_eq!(store.reads(), 0);
}

#[test]
fn rejected_rows_count_as_failed() {
    let (content, lookups) = numbered(10);
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(lookups);
    let denied = || WriteError::new(WriteErrorKind::Permission, "Access Denied");
    let mut destination = MemoryDestination::new().then(ScriptedInsert::Reject(vec![(0, denied()), (9, denied())]));

    let summary = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.rows_processed, 8);
    assert_eq!(summary.rows_failed, 2);
    assert_eq!(summary.errors_by_stage.get(&ErrorStage::Write), Some(&1));
    assert_eq!(destination.calls(), 1);
}

#[test]
fn unmatched_and_unparseable_responses_are_dropped() {
    let content = [
        line("tok-1", "I-1", json!({"callTone": "calm"})),
        line("tok-2", "I-9", json!({"callTone": "calm"})),
        line("tok-3", "I-3", json!(["not", "an", "object"])),
        line("tok-4", "I-8", json!({"callTone": "tense"})),
    ].join("\n");
    let store = MemoryObjectStore::new().with_object("bucket", "job/predictions.jsonl", &content);
    let lookup = MemoryLookupSource::new(vec![
        lookup_row("tok-1", "I-1"),
        lookup_row("tok-2", "I-2"),
        lookup_row("tok-2", "I-5"),
        lookup_row("tok-3", "I-3"),
        lookup_row("tok-4", "I-4"),
    ]);
    let mut destination = MemoryDestination::new();

    let summary = run(&engine(request("gs://bucket/job")), &store, &lookup, &mut destination, 10.0);

    assert_eq!(summary.rows_processed, 2);
    assert_eq!(summary.rows_failed, 2);
    assert_eq!(summary.errors_by_stage.get(&ErrorStage::Join), Some(&1));
    assert_eq!(summary.errors_by_stage.get(&ErrorStage::Parse), Some(&1));
    let rows = destination.rows();
    assert_eq!(rows[1].fields["call_tone"], json!("tense"));
    assert_eq!(rows[1].fields["referenceId"], json!("ref-I-4"));
}

#[test]
fn invalid_request_is_reported_not_raised() {
    let mut req = request("gs://bucket/job");
    req.dataset = None;
    let store = MemoryObjectStore::new();
    let lookup = MemoryLookupSource::new(vec![]);
    let mut destination = MemoryDestination::new();

    let summary = process_request(req, Collaborators {
        store: &store,
        lookup: &lookup,
        destination: &mut destination,
        memory: Box::new(FixedProbe(MemorySample { used_percent: 10.0, available_mb: 256.0 })),
        observer: &NoopObserver,
    });

    assert_eq!(summary.status, RunStatus::Error);
    assert!(summary.message.contains("dataset"));
    assert_eq!(summary.workflow_id, "wf-2024-06");
}

#[test]
fn local_adapters_run_end_to_end() {
    let storage = tempfile::tempdir().unwrap();
    let warehouse = tempfile::tempdir().unwrap();
    let job_dir = storage.path().join("bucket").join("job");
    fs::create_dir_all(&job_dir).unwrap();

    let mut encoder = GzEncoder::new(fs::File::create(job_dir.join("predictions_00001.jsonl.gz")).unwrap(), Compression::default());
    writeln!(encoder, "{}", line("tok-1", "I-1", json!({"callSummary": "Upgrade", "agentResponse": {"resolved": true}}))).unwrap();
    encoder.finish().unwrap();
    fs::write(job_dir.join("predictions_00002.jsonl"), format!("{}\n", line("tok-2", "I-2", json!({"callSummary": "Cancel"})))).unwrap();
    let config = ProcessingConfig::try_from(request("gs://bucket/job")).unwrap();
    let lookup_table = config.lookup_table_ref();
    let output_table = config.output_table_ref();
    let dataset_dir = lookup_table.dataset_dir(warehouse.path());
    assert_eq!(dataset_dir, warehouse.path().join("analytics").join("calls"));
    fs::create_dir_all(&dataset_dir).unwrap();
    fs::write(
        dataset_dir.join(format!("{}.csv", lookup_table.table)),
        "phone_number_token,interactionId,referenceId,event_timestamp\ntok-1,I-1,R-1,2024-05-01 09:30:00 UTC\ntok-2,I-2,R-2,\n",
    ).unwrap();

    let store = LocalObjectStore::new(storage.path());
    let lookup = CsvLookupSource::open(&dataset_dir.join("interactions.csv")).unwrap();
    let mut destination = JsonlDestination::open(output_table.dataset_dir(warehouse.path()), &output_table.table);
    assert_eq!(destination.path(), &dataset_dir.join("analyzed.jsonl"));

    let summary = Engine::new(config).run(Collaborators {
        store: &store,
        lookup: &lookup,
        destination: &mut destination,
        memory: Box::new(FixedProbe(MemorySample { used_percent: 10.0, available_mb: 256.0 })),
        observer: &NoopObserver,
    });

    assert_eq!(summary.status, RunStatus::Success, "{}", summary.message);
    assert_eq!(summary.rows_processed, 2);
    let written: Vec<Value> = fs::read_to_string(destination.path()).unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0]["agent_response_resolved"], json!(true));
    assert_eq!(written[0]["referenceId"], json!("R-1"));
    assert_eq!(written[1]["event_timestamp"], Value::Null);
    assert_eq!(written[1]["workflow_id"], json!("wf-2024-06"));
}
