//! Core domain types for the material flow pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MatflowError;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A pipeline stage. Stage 2 consumes the output of stage 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Profile,
    Matching,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Matching => "matching",
        }
    }

    /// Directory under the output area holding this stage's documents.
    pub fn artifact_dir(&self) -> &'static str {
        match self {
            Self::Profile => "profiles",
            Self::Matching => "matches",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = MatflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Self::Profile),
            "matching" | "match" => Ok(Self::Matching),
            other => Err(MatflowError::parse(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// SourceRecord
// ---------------------------------------------------------------------------

/// Where a catalog row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Catalog file the row was read from.
    pub source_file: String,
    /// Zero-based data row index (header excluded).
    pub row_index: usize,
}

/// One catalog row. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable identifier, unique within the catalog.
    pub id: String,
    /// Column name → raw cell value.
    pub fields: BTreeMap<String, String>,
    pub provenance: Provenance,
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Content hash identifying one unit of work: record content, prompt version,
/// schema version, stage, and (for matching) the upstream profile fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a work item.
    ///
    /// Each component is length-prefixed so adjacent values cannot run
    /// together into the same byte stream.
    pub fn compute(
        stage: Stage,
        prompt_version: &str,
        schema_version: &str,
        record: &SourceRecord,
        upstream: Option<&Fingerprint>,
    ) -> Self {
        let mut hasher = Sha256::new();
        let mut feed = |part: &str| {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        };

        feed(stage.as_str());
        feed(prompt_version);
        feed(schema_version);
        feed(&record.id);
        for (column, value) in &record.fields {
            feed(column);
            feed(value);
        }
        feed(upstream.map(|fp| fp.as_str()).unwrap_or(""));

        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap a stored hex string.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA-256 of arbitrary text, used for derived versions.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Locator for a persisted per-item document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub stage: Stage,
    pub record_id: String,
    pub path: PathBuf,
}

/// Validated stage-1 output for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub record_id: String,
    pub schema_version: String,
    pub prompt_version: String,
    pub fingerprint: Fingerprint,
    /// The validated document returned by the model.
    pub attributes: serde_json::Value,
    pub generated_at: DateTime<Utc>,
    /// Provider call identifier.
    pub call_id: String,
    pub model: String,
}

/// One normalized candidate entry of a match document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEntry {
    /// Position in the model's list.
    pub ordinal: usize,
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// The raw entry object.
    pub entry: serde_json::Value,
}

/// Validated stage-2 output for one subject record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub subject_id: String,
    /// Records offered to the model as candidates.
    pub candidate_ids: Vec<String>,
    pub schema_version: String,
    pub prompt_version: String,
    pub fingerprint: Fingerprint,
    pub document: serde_json::Value,
    #[serde(default)]
    pub entries: Vec<MatchEntry>,
    pub generated_at: DateTime<Utc>,
    pub call_id: String,
    pub model: String,
}

// ---------------------------------------------------------------------------
// Manifest rows
// ---------------------------------------------------------------------------

/// Durable status of a fingerprint in the run manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = MatflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(MatflowError::parse(format!("unknown item status '{other}'"))),
        }
    }
}

/// One row of the durable run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub fingerprint: Fingerprint,
    pub stage: Stage,
    pub record_id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, pairs: &[(&str, &str)]) -> SourceRecord {
        SourceRecord {
            id: id.into(),
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            provenance: Provenance {
                source_file: "catalog.csv".into(),
                row_index: 0,
            },
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let r = record("acme", &[("name", "Acme"), ("city", "Ghent")]);
        let a = Fingerprint::compute(Stage::Profile, "1", "1", &r, None);
        let b = Fingerprint::compute(Stage::Profile, "1", "1", &r, None);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn fingerprint_changes_with_each_component() {
        let r = record("acme", &[("name", "Acme")]);
        let base = Fingerprint::compute(Stage::Profile, "1", "1", &r, None);

        let edited = record("acme", &[("name", "Acme NV")]);
        assert_ne!(base, Fingerprint::compute(Stage::Profile, "1", "1", &edited, None));
        assert_ne!(base, Fingerprint::compute(Stage::Profile, "2", "1", &r, None));
        assert_ne!(base, Fingerprint::compute(Stage::Profile, "1", "2", &r, None));
        assert_ne!(base, Fingerprint::compute(Stage::Matching, "1", "1", &r, None));
        assert_ne!(
            base,
            Fingerprint::compute(Stage::Profile, "1", "1", &r, Some(&base))
        );
    }

    #[test]
    fn fingerprint_framing_prevents_concatenation_collisions() {
        let a = record("x", &[("ab", "c")]);
        let b = record("x", &[("a", "bc")]);
        assert_ne!(
            Fingerprint::compute(Stage::Profile, "1", "1", &a, None),
            Fingerprint::compute(Stage::Profile, "1", "1", &b, None)
        );
    }

    #[test]
    fn stage_parsing() {
        assert_eq!("profile".parse::<Stage>().unwrap(), Stage::Profile);
        assert_eq!("match".parse::<Stage>().unwrap(), Stage::Matching);
        assert!("enrich".parse::<Stage>().is_err());
        assert_eq!(Stage::Matching.artifact_dir(), "matches");
    }

    #[test]
    fn item_status_roundtrip() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::InFlight,
            ItemStatus::Completed,
            ItemStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
    }

    #[test]
    fn profile_serialization() {
        let profile = Profile {
            record_id: "acme".into(),
            schema_version: "1".into(),
            prompt_version: "1".into(),
            fingerprint: Fingerprint::from_hex("ab".repeat(32)),
            attributes: serde_json::json!({"materials": ["steel"]}),
            generated_at: Utc::now(),
            call_id: "call-1".into(),
            model: "gemini-test".into(),
        };
        let json = serde_json::to_string(&profile).expect("serialize");
        assert!(json.contains("\"fingerprint\":\"abab"));
        let parsed: Profile = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, profile);
    }
}
