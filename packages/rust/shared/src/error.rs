//! Error types for legisflow.
//!
//! Library crates use [`LegisflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all legisflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LegisflowError {
    /// Upstream document source unavailable or returned malformed data.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Corrupt or unsupported document.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Model capability failure (network, quota, timeout, bad response).
    #[error("model call error ({kind}): {message}")]
    ModelCall {
        kind: ModelCallKind,
        message: String,
    },

    /// Persisted pipeline state is unreadable or inconsistent. Never recovered locally.
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Database or artifact storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (bad identifier, invalid listing, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON/TOML (de)serialization error outside of persisted state.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LegisflowError>;

/// Sub-kind of a [`LegisflowError::ModelCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallKind {
    Network,
    Quota,
    Timeout,
    /// The response did not match the expected schema (or was empty).
    Validation,
    /// Bad credentials, unknown model, malformed request. Not retried.
    Config,
}

impl ModelCallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Quota => "quota",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Config => "config",
        }
    }

    /// Whether another attempt of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Config)
    }
}

impl fmt::Display for ModelCallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error category persisted in failed stage records and run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Fetch,
    Conversion,
    ModelCall,
    StateCorruption,
    Storage,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Conversion => "conversion",
            Self::ModelCall => "model_call",
            Self::StateCorruption => "state_corruption",
            Self::Storage => "storage",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LegisflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a model call error of the given kind.
    pub fn model(kind: ModelCallKind, msg: impl Into<String>) -> Self {
        Self::ModelCall {
            kind,
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) => ErrorCategory::Fetch,
            Self::Conversion(_) => ErrorCategory::Conversion,
            Self::ModelCall { .. } => ErrorCategory::ModelCall,
            Self::StateCorruption(_) => ErrorCategory::StateCorruption,
            Self::Storage(_) | Self::Io { .. } => ErrorCategory::Storage,
            Self::Config { .. } | Self::Validation { .. } | Self::Serialization(_) => {
                ErrorCategory::Other
            }
        }
    }

    /// Fatal errors abort the whole run instead of being recorded against a
    /// single bill's stage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StateCorruption(_) | Self::Storage(_) | Self::Io { .. }
        )
    }
}
