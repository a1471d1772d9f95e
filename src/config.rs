use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coerce::RowLayout;
use crate::errors::ConfigError;
use crate::memory_usage::DEFAULT_THRESHOLD_PERCENT;
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};

pub const DEFAULT_BATCH_SIZE: usize = 100;
/// 55 minutes, leaving headroom under a 60 minute invocation limit.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3300;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_THRESHOLD_BYTES: usize = 1024 * 1024;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_INTER_BATCH_DELAY_MS: u64 = 100;

/// Where one inference job left its output fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutputLocation {
    pub scheme: String,
    pub container: String,
    pub prefix: String,
}

impl JobOutputLocation {
    /// Parses `scheme://container/prefix/`. For `file://` the whole path is the container.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = uri.split_once("://")
            .ok_or_else(|| ConfigError::OutputLocation(format!("'{}' is not a scheme://container/path uri", uri)))?;
        if scheme == "file" {
            let path = rest.trim_end_matches('/');
            if path.is_empty() {
                return Err(ConfigError::OutputLocation(format!("'{}' has no path", uri)));
            }
            return Ok(Self { scheme: scheme.to_string(), container: path.to_string(), prefix: String::new() });
        }
        let (container, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if container.is_empty() {
            return Err(ConfigError::OutputLocation(format!("'{}' has no container", uri)));
        }
        Ok(Self { scheme: scheme.to_string(), container: container.to_string(), prefix: prefix.trim_end_matches('/').to_string() })
    }

    /// Prefers `gcsOutputDirectory`, otherwise the first value that looks like a uri.
    pub fn from_output_info(output_info: &Map<String, Value>) -> Result<Self, ConfigError> {
        let uri = match output_info.get("gcsOutputDirectory").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            Some(uri) => uri,
            None => {
                warn!("No gcsOutputDirectory found in output_info, trying fallback");
                output_info.values()
                    .filter_map(Value::as_str)
                    .find(|s| s.contains("://"))
                    .ok_or_else(|| ConfigError::OutputLocation("no output directory found in output_info".to_string()))?
            }
        };
        let location = Self::parse(uri)?;
        if location.scheme != "file" && location.prefix.is_empty() {
            return Err(ConfigError::OutputLocation(format!("'{}' has no path prefix", uri)));
        }
        info!("Parsed output location: container='{}', prefix='{}'", location.container, location.prefix);
        Ok(location)
    }
}

impl std::fmt::Display for JobOutputLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}://{}", self.scheme, self.container)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.container, self.prefix)
        }
    }
}

fn default_batch_size() -> usize { DEFAULT_BATCH_SIZE }
fn default_timeout_seconds() -> u64 { DEFAULT_TIMEOUT_SECONDS }
fn default_chunk_size() -> usize { DEFAULT_CHUNK_SIZE }
fn default_chunk_threshold() -> usize { DEFAULT_CHUNK_THRESHOLD_BYTES }
fn default_max_retries() -> u32 { DEFAULT_MAX_RETRIES }
fn default_retry_delay() -> u64 { DEFAULT_RETRY_BASE_DELAY_MS }
fn default_inter_batch_delay() -> u64 { DEFAULT_INTER_BATCH_DELAY_MS }
fn default_memory_threshold() -> f64 { DEFAULT_THRESHOLD_PERCENT }
fn default_true() -> bool { true }

/// The invocation payload as the orchestrator sends it.
#[derive(Deserialize, Debug, Clone)]
pub struct ProcessingRequest {
    #[serde(default)]
    pub output_info: Map<String, Value>,
    pub project_id: Option<String>,
    pub dataset: Option<String>,
    pub workflow_id: Option<String>,
    pub execution_id: Option<String>,
    pub batch_id: Option<String>,
    pub lookup_table: Option<String>,
    pub output_table: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub enable_chunked_processing: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold_bytes: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_inter_batch_delay")]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_percent: f64,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    #[serde(default)]
    pub columns: Option<RowLayout>,
}

impl ProcessingRequest {
    /// A request with every optional parameter at its default.
    pub fn new(output_uri: &str) -> Self {
        let mut output_info = Map::new();
        output_info.insert("gcsOutputDirectory".to_string(), Value::String(output_uri.to_string()));
        Self {
            output_info,
            project_id: None,
            dataset: None,
            workflow_id: None,
            execution_id: None,
            batch_id: None,
            lookup_table: None,
            output_table: None,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            enable_chunked_processing: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_threshold_bytes: DEFAULT_CHUNK_THRESHOLD_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            inter_batch_delay_ms: DEFAULT_INTER_BATCH_DELAY_MS,
            memory_threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            include_metadata: true,
            columns: None,
        }
    }
}

/// Validated processing parameters for one invocation.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub location: JobOutputLocation,
    pub project_id: String,
    pub dataset: String,
    pub workflow_id: String,
    pub execution_id: Option<String>,
    pub batch_id: Option<String>,
    pub lookup_table: String,
    pub output_table: String,
    pub batch_size: usize,
    pub timeout: Duration,
    pub enable_chunked_processing: bool,
    pub chunk_size: usize,
    pub chunk_threshold_bytes: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub inter_batch_delay: Duration,
    pub memory_threshold_percent: f64,
    pub include_metadata: bool,
    pub layout: RowLayout,
}

impl TryFrom<ProcessingRequest> for ProcessingConfig {
    type Error = ConfigError;

    fn try_from(request: ProcessingRequest) -> Result<Self, Self::Error> {
        let required = [
            ("project_id", &request.project_id),
            ("dataset", &request.dataset),
            ("lookup_table", &request.lookup_table),
            ("output_table", &request.output_table),
            ("workflow_id", &request.workflow_id),
        ];
        let missing: Vec<String> = required.iter()
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(name, _)| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingParameters(missing));
        }

        let positive = [("batch_size", request.batch_size), ("chunk_size", request.chunk_size)];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidParameter { name: name.to_string(), reason: "must be greater than zero".to_string() });
            }
        }
        if request.timeout_seconds == 0 {
            return Err(ConfigError::InvalidParameter { name: "timeout_seconds".to_string(), reason: "must be greater than zero".to_string() });
        }
        if !(request.memory_threshold_percent > 0.0 && request.memory_threshold_percent <= 100.0) {
            return Err(ConfigError::InvalidParameter {
                name: "memory_threshold_percent".to_string(),
                reason: format!("{} is outside (0, 100]", request.memory_threshold_percent),
            });
        }

        let location = JobOutputLocation::from_output_info(&request.output_info)?;
        let layout = request.columns.unwrap_or_default();
        layout.validate()?;

        Ok(Self {
            location,
            project_id: request.project_id.unwrap_or_default(),
            dataset: request.dataset.unwrap_or_default(),
            workflow_id: request.workflow_id.unwrap_or_default(),
            execution_id: request.execution_id.filter(|s| !s.is_empty()),
            batch_id: request.batch_id.filter(|s| !s.is_empty()),
            lookup_table: request.lookup_table.unwrap_or_default(),
            output_table: request.output_table.unwrap_or_default(),
            batch_size: request.batch_size,
            timeout: Duration::from_secs(request.timeout_seconds),
            enable_chunked_processing: request.enable_chunked_processing,
            chunk_size: request.chunk_size,
            chunk_threshold_bytes: request.chunk_threshold_bytes,
            max_retries: request.max_retries,
            retry_base_delay: Duration::from_millis(request.retry_base_delay_ms),
            inter_batch_delay: Duration::from_millis(request.inter_batch_delay_ms),
            memory_threshold_percent: request.memory_threshold_percent,
            include_metadata: request.include_metadata,
            layout,
        })
    }
}

/// A warehouse table named `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    /// `<root>/<project>/<dataset>`, where local adapters keep the table's file.
    pub fn dataset_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.project).join(&self.dataset)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl ProcessingConfig {
    pub fn lookup_table_ref(&self) -> TableRef {
        self.table_ref(&self.lookup_table)
    }

    pub fn output_table_ref(&self) -> TableRef {
        self.table_ref(&self.output_table)
    }

    /// Bare names resolve against `project_id` and `dataset`; qualified names keep their own parts.
    fn table_ref(&self, name: &str) -> TableRef {
        let (project, dataset, table) = match name.split('.').collect::<Vec<_>>().as_slice() {
            [project, dataset, table] => (project.to_string(), dataset.to_string(), table.to_string()),
            [dataset, table] => (self.project_id.clone(), dataset.to_string(), table.to_string()),
            _ => (self.project_id.clone(), self.dataset.clone(), name.to_string()),
        };
        TableRef { project, dataset, table }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_base_delay.is_zero() {
            RetryPolicy::immediate(self.max_retries)
        } else {
            RetryPolicy::new(self.max_retries, self.retry_base_delay)
        }
    }
}
