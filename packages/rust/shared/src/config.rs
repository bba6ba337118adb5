//! Application configuration for legisflow.
//!
//! User config lives at `~/.legisflow/legisflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LegisflowError, Result};
use crate::types::ModelFamily;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "legisflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".legisflow";

// ---------------------------------------------------------------------------
// Config structs (matching legisflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Where bill listings and documents come from.
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    /// Concurrency, timeout and retry limits for external calls.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub qa: QaConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for per-session state, artifacts and exports.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Bills processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub state_backend: StateBackend,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workers: default_workers(),
            state_backend: StateBackend::default(),
        }
    }
}

fn default_data_dir() -> String {
    "data".into()
}
fn default_workers() -> usize {
    4
}

/// Persistence medium for pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// One JSON document per session, replaced atomically.
    #[default]
    Json,
    /// A libSQL database per session.
    Libsql,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Directory (local) or base URL (http) holding `{session}/bills.json`.
    #[serde(default = "default_source_location")]
    pub location: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            location: default_source_location(),
        }
    }
}

fn default_source_location() -> String {
    "sources".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Local,
    Http,
}

/// `[models]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Family used when `--model-family` is not given.
    #[serde(default)]
    pub family: ModelFamily,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "ProviderConfig::gemini")]
    pub gemini: ProviderConfig,

    #[serde(default = "ProviderConfig::gpt")]
    pub gpt: ProviderConfig,

    #[serde(default = "ProviderConfig::ollama")]
    pub ollama: ProviderConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            family: ModelFamily::default(),
            temperature: default_temperature(),
            gemini: ProviderConfig::gemini(),
            gpt: ProviderConfig::gpt(),
            ollama: ProviderConfig::ollama(),
        }
    }
}

impl ModelsConfig {
    pub fn provider(&self, family: ModelFamily) -> &ProviderConfig {
        match family {
            ModelFamily::Gemini => &self.gemini,
            ModelFamily::Gpt => &self.gpt,
            ModelFamily::Ollama => &self.ollama,
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}

/// `[models.<family>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Model used when `--model` is not given.
    pub default_model: String,

    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    fn gemini() -> Self {
        Self {
            default_model: "gemini-3-flash-preview".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_key_env: Some("GEMINI_API_KEY".into()),
        }
    }

    fn gpt() -> Self {
        Self {
            default_model: "gpt-4o-mini".into(),
            base_url: "https://api.openai.com".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
        }
    }

    fn ollama() -> Self {
        Self {
            default_model: "llama3.1".into(),
            base_url: "http://localhost:11434".into(),
            api_key_env: None,
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Outstanding model calls across all workers.
    #[serde(default = "default_max_inflight_model_calls")]
    pub max_inflight_model_calls: usize,

    /// Outstanding document fetches across all workers.
    #[serde(default = "default_max_inflight_fetches")]
    pub max_inflight_fetches: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight_model_calls: default_max_inflight_model_calls(),
            max_inflight_fetches: default_max_inflight_fetches(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_max_inflight_model_calls() -> usize {
    2
}
fn default_max_inflight_fetches() -> usize {
    4
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}

/// `[qa]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaConfig {
    /// JSON list of `{name, summary}` agencies to rate bills against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agencies_file: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry policy (runtime, derived from [limits])
// ---------------------------------------------------------------------------

/// Exponential backoff for transient external-call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&LimitsConfig> for RetryPolicy {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_retries: limits.max_retries,
            base_delay: Duration::from_millis(limits.backoff_base_ms),
            max_delay: Duration::from_millis(limits.backoff_cap_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.legisflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LegisflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.legisflow/legisflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LegisflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LegisflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LegisflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = render_config(&AppConfig::default())?;

    crate::fs::write_atomic(&path, content.as_bytes())?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Serialize a config as pretty TOML.
pub fn render_config(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| LegisflowError::config(e.to_string()))
}

/// Check that the API key env var for `family` is set and non-empty.
/// Families without a configured key variable always pass.
pub fn validate_api_key(config: &AppConfig, family: ModelFamily) -> Result<()> {
    let Some(var_name) = &config.models.provider(family).api_key_env else {
        return Ok(());
    };
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(LegisflowError::config(format!(
            "{family} API key not found. Set the {var_name} environment variable."
        ))),
    }
}
