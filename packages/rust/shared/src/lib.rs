//! Shared types, error model, and configuration for legisflow.
//!
//! This crate is the foundation depended on by all other legisflow crates.
//! It provides:
//! - [`LegisflowError`] — the unified error type
//! - Domain types ([`BillId`], [`Stage`], [`StageRecord`], [`ArtifactRef`], ...)
//! - Configuration ([`AppConfig`], [`RetryPolicy`], config loading)
//! - Small filesystem and hashing helpers shared by the storage crates

pub mod config;
pub mod error;
pub mod fs;
pub mod hash;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, LimitsConfig, ModelsConfig, ProviderConfig, QaConfig,
    RetryPolicy, SourceConfig, SourceKind, StateBackend, config_dir, config_file_path,
    init_config, load_config, load_config_from, render_config, validate_api_key,
};
pub use error::{ErrorCategory, LegisflowError, ModelCallKind, Result};
pub use fs::write_atomic;
pub use hash::sha256_hex;
pub use types::{
    AmendmentMeta, ArtifactKind, ArtifactRef, BillId, BillMetadata, CURRENT_SCHEMA_VERSION,
    Fingerprint, MediaType, ModelFamily, SessionId, Stage, StageError, StageRecord, StageStatus,
    SuccessEntry,
};
