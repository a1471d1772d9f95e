use flate2::read::GzDecoder;
use glob::glob;
use log::{info, warn};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::JobOutputLocation;
use crate::errors::FetchError;
use crate::retry::RetryPolicy;

const LARGE_RESULT_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
}

/// Listing and reading of job output objects.
pub trait ObjectStore {
    fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectMeta>, FetchError>;
    fn read_text(&self, container: &str, name: &str) -> Result<String, FetchError>;
}

/// `predictions*.jsonl`, optionally gzipped.
pub fn is_prediction_fragment(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name.starts_with("predictions") && (file_name.ends_with(".jsonl") || file_name.ends_with(".jsonl.gz"))
}

pub struct ResultFetcher<'a> {
    store: &'a dyn ObjectStore,
    policy: &'a RetryPolicy,
}

impl<'a> ResultFetcher<'a> {
    pub fn new(store: &'a dyn ObjectStore, policy: &'a RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// All prediction fragments under the location, concatenated in name order.
    pub fn fetch(&self, location: &JobOutputLocation) -> Result<String, FetchError> {
        self.policy.run("fetch batch results", || self.fetch_once(location))
    }

    fn fetch_once(&self, location: &JobOutputLocation) -> Result<String, FetchError> {
        info!("Looking for prediction files in '{}' with prefix '{}'", location.container, location.prefix);
        let objects = self.store.list(&location.container, &location.prefix)?;
        let listed = objects.len();
        let mut fragments: Vec<ObjectMeta> = objects.into_iter().filter(|o| is_prediction_fragment(&o.name)).collect();
        if fragments.is_empty() {
            return Err(FetchError::NoFragments { container: location.container.clone(), prefix: location.prefix.clone(), listed });
        }
        fragments.sort_by(|a, b| a.name.cmp(&b.name));

        info!("Found {} prediction files:", fragments.len());
        for fragment in &fragments {
            info!("  - {} ({} bytes)", fragment.name, fragment.size);
        }
        let total_size: u64 = fragments.iter().map(|f| f.size).sum();
        if total_size > LARGE_RESULT_BYTES {
            warn!("Large result set detected: {:.1}MB", total_size as f64 / (1024.0 * 1024.0));
        }

        if let [single] = fragments.as_slice() {
            return self.store.read_text(&location.container, &single.name);
        }
        let mut combined = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let content = self.store.read_text(&location.container, &fragment.name)?;
            combined.push(content.trim().to_string());
        }
        info!("Combined {} prediction files, {:.1}MB total", fragments.len(), total_size as f64 / (1024.0 * 1024.0));
        Ok(combined.join("\n"))
    }
}

/// Containers are directories below `root`; an absolute container path is used as-is.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join(container)
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectMeta>, FetchError> {
        let dir = self.container_dir(container);
        if !dir.is_dir() {
            return Err(FetchError::Storage { message: format!("container {} does not exist", dir.display()), retryable: false });
        }
        let pattern = dir.join("**/*");
        let pattern_str = pattern.to_string_lossy();
        let paths = glob(&pattern_str).map_err(|e| FetchError::Storage { message: e.to_string(), retryable: false })?;
        let mut objects = Vec::new();
        for path in paths.filter_map(Result::ok).filter(|p| p.is_file()) {
            let name = relative_name(&dir, &path);
            if name.starts_with(prefix) {
                let size = fs::metadata(&path)?.len();
                objects.push(ObjectMeta { name, size });
            }
        }
        Ok(objects)
    }

    fn read_text(&self, container: &str, name: &str) -> Result<String, FetchError> {
        let path = self.container_dir(container).join(name);
        let file = File::open(&path)?;
        let mut bytes = Vec::new();
        if name.ends_with(".gz") {
            GzDecoder::new(file).read_to_end(&mut bytes)
                .map_err(|e| FetchError::Decode { name: name.to_string(), reason: e.to_string() })?;
        } else {
            let mut file = file;
            file.read_to_end(&mut bytes)?;
        }
        String::from_utf8(bytes).map_err(|e| FetchError::Decode { name: name.to_string(), reason: e.to_string() })
    }
}

fn relative_name(dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(dir).unwrap_or(path);
    relative.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// In-memory object store; `fail_next` injects transient read failures.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: BTreeMap<(String, String), String>,
    failures_left: Cell<u32>,
    reads: Cell<usize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, container: &str, name: &str, content: &str) -> Self {
        self.objects.insert((container.to_string(), name.to_string()), content.to_string());
        self
    }

    pub fn fail_next(self, n: u32) -> Self {
        self.failures_left.set(n);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectMeta>, FetchError> {
        Ok(self.objects.iter()
            .filter(|((c, name), _)| c == container && name.starts_with(prefix))
            .map(|((_, name), content)| ObjectMeta { name: name.clone(), size: content.len() as u64 })
            .collect())
    }

    fn read_text(&self, container: &str, name: &str) -> Result<String, FetchError> {
        self.reads.set(self.reads.get() + 1);
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(FetchError::Storage { message: "503 Service Unavailable".to_string(), retryable: true });
        }
        self.objects.get(&(container.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| FetchError::Storage { message: format!("object {} not found", name), retryable: false })
    }
}
