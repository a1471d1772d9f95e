use anyhow::{Context, Result};
use batch_reconciler::fetch::LocalObjectStore;
use batch_reconciler::join::CsvLookupSource;
use batch_reconciler::load::JsonlDestination;
use batch_reconciler::memory_usage::SystemMemory;
use batch_reconciler::{ChunkObserver, Collaborators, Engine, ProcessingConfig, ProcessingMode, ProcessingRequest, RunStatus, RunSummary, SetupError};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::macros::format_description;
use uuid::Uuid;

#[derive(Parser, Clone)]
#[command(name = "Batch Result Reconciler")]
#[command(about = "Reconciles batch inference output with warehouse lookup rows and loads the enriched rows.")]
#[command(version = "1.1.0")]
struct Cli {
    #[arg(long, help = "Path to the processing request (YAML or JSON)", required = true)]
    request: PathBuf,
    #[arg(long, default_value = ".", help = "Directory holding object store containers (bucket directories)")]
    storage_root: PathBuf,
    #[arg(long, help = "Directory holding <project>/<dataset>/<lookup_table>.csv and receiving <project>/<dataset>/<output_table>.jsonl", required = true)]
    warehouse_dir: PathBuf,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(short, long, help = "Rows per destination insert batch")]
    batch_size: Option<usize>,
    #[arg(long, help = "Lines per chunk in chunked mode")]
    chunk_size: Option<usize>,
    #[arg(long, help = "Wall-clock budget for the whole invocation")]
    timeout_seconds: Option<u64>,
    #[arg(long, help = "Process the whole result set in one pass unless memory pressure forces chunking")]
    no_chunking: bool,
    #[arg(long, help = "Hide the chunk progress bar")]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, request: &mut ProcessingRequest) {
        if let Some(batch_size) = self.batch_size {
            request.batch_size = batch_size;
        }
        if let Some(chunk_size) = self.chunk_size {
            request.chunk_size = chunk_size;
        }
        if let Some(timeout) = self.timeout_seconds {
            request.timeout_seconds = timeout;
        }
        if self.no_chunking {
            request.enable_chunked_processing = false;
        }
    }
}

struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new(hidden: bool) -> Result<Self> {
        let bar = if hidden { ProgressBar::hidden() } else { ProgressBar::new(0) };
        bar.set_style(ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta}) {msg}")
            .context("Failed to create progress bar template")?
            .progress_chars("=> "));
        Ok(Self { bar })
    }
}

impl ChunkObserver for ProgressObserver {
    fn on_start(&self, mode: ProcessingMode, total_chunks: usize) {
        self.bar.set_length(total_chunks as u64);
        self.bar.set_message(format!("{:?}", mode));
    }

    fn on_chunk(&self, chunk: usize, rows_written: usize) {
        self.bar.set_message(format!("chunk {}: {} rows written", chunk, rows_written));
        self.bar.inc(1);
    }

    fn on_finish(&self, summary: &RunSummary) {
        self.bar.finish_with_message(format!("{:?}: {} rows processed, {} failed", summary.status, summary.rows_processed, summary.rows_failed));
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}.{:03}s", secs / 3600, (secs % 3600) / 60, secs % 60, elapsed.subsec_millis())
}

fn load_request(path: &Path) -> Result<ProcessingRequest> {
    let file = File::open(path).with_context(|| format!("Failed to open processing request: {}", path.display()))?;
    serde_yaml::from_reader(file).with_context(|| format!("Failed to parse processing request from {}", path.display()))
}

fn emit(summary: &RunSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?);
    Ok(())
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => { eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level); LevelFilter::Info }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting Batch Result Reconciler");
    info!("Loading processing request from: {}", cli.request.display());
    let mut request = load_request(&cli.request)?;
    cli.apply_overrides(&mut request);
    if request.execution_id.is_none() {
        let execution_id = Uuid::new_v4().to_string();
        info!("No execution_id in request, using {}", execution_id);
        request.execution_id = Some(execution_id);
    }
    let workflow_id = request.workflow_id.clone().unwrap_or_default();

    let config = match ProcessingConfig::try_from(request) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid processing request: {}", e);
            emit(&RunSummary::setup_failure(workflow_id, SetupError::from(e).to_string()))?;
            std::process::exit(1);
        }
    };

    let lookup_table = config.lookup_table_ref();
    let output_table = config.output_table_ref();
    let lookup_path = lookup_table.dataset_dir(&cli.warehouse_dir).join(format!("{}.csv", lookup_table.table));
    let lookup = match CsvLookupSource::open(&lookup_path) {
        Ok(lookup) => lookup,
        Err(e) => {
            error!("Lookup source unavailable: {}", e);
            emit(&RunSummary::setup_failure(workflow_id, SetupError::from(e).to_string()))?;
            std::process::exit(1);
        }
    };
    let store = LocalObjectStore::new(&cli.storage_root);
    let mut destination = JsonlDestination::open(output_table.dataset_dir(&cli.warehouse_dir), &output_table.table);
    info!("Destination {}: {}", output_table, destination.path().display());
    let observer = ProgressObserver::new(cli.quiet)?;

    let summary = Engine::new(config).run(Collaborators {
        store: &store,
        lookup: &lookup,
        destination: &mut destination,
        memory: Box::new(SystemMemory),
        observer: &observer,
    });

    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    emit(&summary)?;
    if summary.status == RunStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}
