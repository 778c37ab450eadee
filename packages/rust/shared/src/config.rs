//! Application configuration for matflow.
//!
//! User config lives at `~/.matflow/matflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MatflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "matflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".matflow";

/// Env vars consulted after the configured one when looking for an API key.
pub const FALLBACK_API_KEY_ENVS: &[&str] = &["GOOGLE_API_KEY", "GOOGLE_GENAI_API_KEY"];

// ---------------------------------------------------------------------------
// Config structs (matching matflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Gemini model endpoint settings.
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// Retry and backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Output area for artifacts, database, and reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Concurrent model calls per stage.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_output_dir() -> String {
    "output".into()
}
fn default_concurrency() -> u32 {
    4
}

/// `[gemini]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for both stages.
    #[serde(default = "default_model")]
    pub model: String,

    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Endpoint root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-call timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra prompts the gateway may spend on output that is not JSON at all.
    #[serde(default = "default_parse_retries")]
    pub parse_retries: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            api_version: default_api_version(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            parse_retries: default_parse_retries(),
        }
    }
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_model() -> String {
    "gemini-3-flash-preview".into()
}
fn default_api_version() -> String {
    "v1beta".into()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_parse_retries() -> u32 {
    1
}

/// Backoff jitter strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// Exact exponential delays.
    None,
    /// Half fixed, half random.
    Equal,
    /// Uniform between zero and the computed delay.
    Full,
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total model calls allowed for one item when every call fails transiently.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: JitterMode,

    /// Re-prompts allowed after a schema-invalid document.
    #[serde(default = "default_corrective_attempts")]
    pub corrective_attempts: u32,

    /// Persist attempts before a valid result is reported as a storage failure.
    #[serde(default = "default_storage_attempts")]
    pub storage_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            corrective_attempts: default_corrective_attempts(),
            storage_attempts: default_storage_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> JitterMode {
    JitterMode::Equal
}
fn default_corrective_attempts() -> u32 {
    2
}
fn default_storage_attempts() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.matflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| MatflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.matflow/matflow.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| MatflowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MatflowError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values that would make the pipeline unable to make progress.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.concurrency == 0 {
        return Err(MatflowError::config("defaults.concurrency must be at least 1"));
    }
    if config.retry.max_attempts == 0 {
        return Err(MatflowError::config("retry.max_attempts must be at least 1"));
    }
    if config.retry.storage_attempts == 0 {
        return Err(MatflowError::config("retry.storage_attempts must be at least 1"));
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(MatflowError::config(
            "retry.max_delay_ms must not be below retry.base_delay_ms",
        ));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MatflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| MatflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MatflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Find the Gemini API key: the configured env var first, then the fallbacks.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let configured = config.gemini.api_key_env.as_str();
    std::iter::once(configured)
        .chain(FALLBACK_API_KEY_ENVS.iter().copied())
        .find_map(|name| match std::env::var(name) {
            Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
            _ => None,
        })
        .ok_or_else(|| {
            MatflowError::config(format!(
                "Gemini API key not found. Set the {configured} environment variable."
            ))
        })
}
