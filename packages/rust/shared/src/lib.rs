//! Shared types, error model, and configuration for matflow.
//!
//! This crate is the foundation depended on by all other matflow crates.
//! It provides:
//! - [`MatflowError`], the unified error type
//! - Domain types ([`SourceRecord`], [`Fingerprint`], [`Profile`], [`MatchResult`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, FALLBACK_API_KEY_ENVS, GeminiConfig, JitterMode, RetryConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, resolve_api_key,
    validate_config,
};
pub use error::{MatflowError, Result};
pub use types::{
    ArtifactRef, Fingerprint, ItemStatus, ManifestEntry, MatchEntry, MatchResult, Profile,
    Provenance, SourceRecord, Stage, content_hash,
};
