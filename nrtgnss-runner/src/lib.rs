//! nrtgnss runner: pipeline orchestration on top of `nrtgnss-core`.
//!
//! - TOML pipeline configuration and deterministic run ids
//! - Acquisition orchestrator (ledger claims + bounded rayon worker pool)
//! - Stacking and consensus jobs, ledger status and cleanup
//! - JSON run summaries

pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod pipeline;
pub mod summary;

pub use config::{CategoryConfig, ConfigError, PipelineConfig, RunId};
pub use jobs::{ConsensusJob, StackingJob};
pub use orchestrator::{CategorySummary, OrchestratorError};
pub use pipeline::Pipeline;
pub use summary::RunSummary;
