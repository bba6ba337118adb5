//! Core pipeline for legisflow.
//!
//! Ties the document source, converter, model providers, state tracker and
//! artifact store into the staged convert → amend → qa pipeline, and builds
//! the consolidated session export.

pub mod export;
pub mod fingerprint;
pub mod model;
pub mod providers;
pub mod runner;
pub mod stages;

#[cfg(test)]
mod testkit;

pub use export::{EXPORT_FILE, SessionExport, build_export, write_export};
pub use fingerprint::{StageInputs, TextSource, fingerprint};
pub use model::{GuardedModel, ModelClient, ModelSpec};
pub use providers::build_client;
pub use runner::{
    PipelineRunner, ProgressReporter, RejectedListing, RunConfig, RunSummary, SilentProgress,
    StageCounts, StageModels, StageOutcome,
};
pub use stages::{Agency, load_agencies};
