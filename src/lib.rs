//! Reconciles the output of a batch inference job with warehouse lookup rows
//! and bulk-loads the enriched rows into a destination table.

pub mod coerce;
pub mod config;
pub mod errors;
pub mod extract;
pub mod fetch;
pub mod join;
pub mod key;
pub mod load;
pub mod memory_usage;
pub mod parse;
pub mod repair;
pub mod retry;
pub mod scheduler;
pub mod tracker;

pub use config::{JobOutputLocation, ProcessingConfig, ProcessingRequest, TableRef};
pub use errors::{ErrorRecord, ErrorStage, SetupError, WriteError, WriteErrorKind};
pub use scheduler::{
    process_request, ChunkObserver, Collaborators, Engine, NoopObserver, ProcessingMode, RunStatus,
    RunSummary,
};
