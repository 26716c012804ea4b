//! Pipeline orchestration: normalise, check, deduplicate, classify, import.

use thiserror::Error;

pub mod compliance;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod export;
pub mod normaliser;
pub mod scheduler;
pub mod status;

pub use compliance::{detect_access_control, ComplianceChecker};
pub use config::{SourceRegistry, SyncConfig};
pub use dedup::Deduplicator;
pub use engine::{Engine, ScrapeResult, SourceResult, SourceSummary};
pub use export::{ExportRecord, REQUIRED_FIELDS};
pub use normaliser::Normaliser;
pub use scheduler::{RunSummary, ScheduleConfig, Scheduler, SourceStatus};
pub use status::{refresh_statuses, RefreshSummary, StatusChange, StatusManager};

pub const CRATE_NAME: &str = "grantscout-sync";

/// Errors surfaced directly to the caller. Record- and source-level failures
/// never appear here; they are folded into run counters.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("export failed: {0}")]
    Export(String),
}
