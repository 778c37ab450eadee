//! Input directory layout: `pipeline.toml`, catalog, templates, schemas.
//!
//! Everything here is loaded and checked before the first model call; any
//! problem is a [`MatflowError::Config`].

use std::path::{Path, PathBuf};

use matflow_schema::SchemaContract;
use matflow_shared::{Fingerprint, MatflowError, Result, SourceRecord, Stage, content_hash};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{CatalogSettings, read_catalog};
use crate::template::PromptTemplate;

/// Settings file name inside the input directory.
pub const PIPELINE_FILE_NAME: &str = "pipeline.toml";

// ---------------------------------------------------------------------------
// pipeline.toml
// ---------------------------------------------------------------------------

/// Parsed `pipeline.toml`; every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub catalog: CatalogSettings,

    /// Reference text files rendered into `{{context}}`.
    #[serde(default)]
    pub context_files: Vec<String>,

    #[serde(default)]
    pub profile: ProfileSettings,

    #[serde(default)]
    pub matching: MatchingSettings,
}

/// `[profile]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default = "default_profile_prompt")]
    pub prompt: String,
    #[serde(default = "default_profile_schema")]
    pub schema: String,
    /// Explicit prompt version; defaults to a hash of the template.
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default)]
    pub permissive: bool,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            prompt: default_profile_prompt(),
            schema: default_profile_schema(),
            prompt_version: None,
            permissive: false,
        }
    }
}

fn default_profile_prompt() -> String {
    "profile_prompt.txt".into()
}
fn default_profile_schema() -> String {
    "profile.schema.json".into()
}

/// `[matching]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingSettings {
    #[serde(default = "default_match_prompt")]
    pub prompt: String,
    #[serde(default = "default_match_schema")]
    pub schema: String,
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default)]
    pub permissive: bool,

    /// Most candidate profiles offered per subject.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,

    /// Field holding the list of matches in the document.
    #[serde(default = "default_list_field")]
    pub list_field: String,
    #[serde(default = "default_candidate_field")]
    pub candidate_field: String,
    #[serde(default = "default_score_field")]
    pub score_field: String,
    #[serde(default = "default_category_field")]
    pub category_field: String,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            prompt: default_match_prompt(),
            schema: default_match_schema(),
            prompt_version: None,
            permissive: false,
            candidate_limit: default_candidate_limit(),
            list_field: default_list_field(),
            candidate_field: default_candidate_field(),
            score_field: default_score_field(),
            category_field: default_category_field(),
        }
    }
}

fn default_match_prompt() -> String {
    "match_prompt.txt".into()
}
fn default_match_schema() -> String {
    "match.schema.json".into()
}
fn default_candidate_limit() -> usize {
    150
}
fn default_list_field() -> String {
    "matches".into()
}
fn default_candidate_field() -> String {
    "candidate_id".into()
}
fn default_score_field() -> String {
    "score".into()
}
fn default_category_field() -> String {
    "category".into()
}

// ---------------------------------------------------------------------------
// Loaded inputs
// ---------------------------------------------------------------------------

/// Everything one stage needs to render, check, and version its calls.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage: Stage,
    pub template: PromptTemplate,
    pub contract: SchemaContract,
    pub prompt_version: String,
    /// Hash prefix of the rendered reference context.
    pub context_version: String,
}

impl StageSpec {
    fn load(
        stage: Stage,
        dir: &Path,
        prompt: &str,
        schema: &str,
        prompt_version: Option<&str>,
        permissive: bool,
        context: &str,
    ) -> Result<Self> {
        let prompt_path = dir.join(prompt);
        let source = std::fs::read_to_string(&prompt_path).map_err(|e| {
            MatflowError::config(format!("cannot read {stage} prompt {}: {e}", prompt_path.display()))
        })?;
        let template = PromptTemplate::parse(stage, source)?;
        let contract = SchemaContract::load(&dir.join(schema))?.with_permissive(permissive);
        let prompt_version = prompt_version
            .map(String::from)
            .unwrap_or_else(|| template.content_version());
        let context_version = content_hash(context)[..12].to_string();

        debug!(%stage, %prompt_version, %context_version, schema_version = %contract.version, "stage inputs loaded");
        Ok(Self {
            stage,
            template,
            contract,
            prompt_version,
            context_version,
        })
    }

    /// Fingerprint of one record under this stage's prompt, context and schema.
    ///
    /// The context is rendered into every prompt, so editing a context file
    /// invalidates results even when the prompt version is pinned.
    pub fn fingerprint(&self, record: &SourceRecord, upstream: Option<&Fingerprint>) -> Fingerprint {
        let prompt_version = format!("{}+{}", self.prompt_version, self.context_version);
        Fingerprint::compute(self.stage, &prompt_version, &self.contract.version, record, upstream)
    }
}

/// The fully loaded input directory.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub dir: PathBuf,
    pub settings: PipelineSettings,
    pub records: Vec<SourceRecord>,
    /// Rendered reference context.
    pub context: String,
    pub profile: StageSpec,
    /// Present when the matching stage was requested.
    pub matching: Option<StageSpec>,
}

impl PipelineInputs {
    /// Load and check the input directory.
    ///
    /// The profile stage is always loaded because matching eligibility
    /// depends on profile fingerprints.
    pub fn load(dir: &Path, include_matching: bool, limit: Option<usize>) -> Result<Self> {
        if !dir.is_dir() {
            return Err(MatflowError::config(format!(
                "input directory {} does not exist",
                dir.display()
            )));
        }

        let mut settings = load_settings(dir)?;
        if limit.is_some() {
            settings.catalog.limit = limit;
        }

        let records = read_catalog(&dir.join(&settings.catalog.file), &settings.catalog)?;
        let context = load_context(dir, &settings.context_files)?;

        let p = &settings.profile;
        let profile = StageSpec::load(
            Stage::Profile,
            dir,
            &p.prompt,
            &p.schema,
            p.prompt_version.as_deref(),
            p.permissive,
            &context,
        )?;

        let matching = if include_matching {
            let m = &settings.matching;
            Some(StageSpec::load(
                Stage::Matching,
                dir,
                &m.prompt,
                &m.schema,
                m.prompt_version.as_deref(),
                m.permissive,
                &context,
            )?)
        } else {
            None
        };

        info!(
            dir = %dir.display(),
            records = records.len(),
            context_files = settings.context_files.len(),
            matching = include_matching,
            "pipeline inputs loaded"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            settings,
            records,
            context,
            profile,
            matching,
        })
    }
}

fn load_settings(dir: &Path) -> Result<PipelineSettings> {
    let path = dir.join(PIPELINE_FILE_NAME);
    if !path.exists() {
        debug!(?path, "no pipeline.toml, using defaults");
        return Ok(PipelineSettings::default());
    }
    let content = std::fs::read_to_string(&path).map_err(|e| MatflowError::io(&path, e))?;
    toml::from_str(&content)
        .map_err(|e| MatflowError::config(format!("failed to parse {}: {e}", path.display())))
}

fn load_context(dir: &Path, files: &[String]) -> Result<String> {
    let mut context = String::new();
    for name in files {
        let path = dir.join(name);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            MatflowError::config(format!("cannot read context file {}: {e}", path.display()))
        })?;
        if !context.is_empty() {
            context.push('\n');
        }
        context.push_str(&format!("## {name}\n{}\n", text.trim_end()));
    }
    Ok(context)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a minimal, valid input directory and return its path.
    pub(crate) fn fixture_dir(catalog: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mf-inputs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("catalog.csv"), catalog).unwrap();
        std::fs::write(dir.join("notes.txt"), "Aalst industrial zone\n").unwrap();
        std::fs::write(
            dir.join(PIPELINE_FILE_NAME),
            "context_files = [\"notes.txt\"]\n\n[catalog]\nid_column = \"name\"\n\n[profile]\nprompt_version = \"1\"\n\n[matching]\nprompt_version = \"1\"\ncandidate_limit = 10\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("profile_prompt.txt"),
            "Profile {{record_id}}.\n{{context}}\n{{record}}\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("profile.schema.json"),
            r#"{"$version": "1", "type": "object", "required": ["outputs"],
                "properties": {"outputs": {"type": "array", "items": {"type": "string"}}}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("match_prompt.txt"),
            "Match {{record_id}} ({{profile}}) against {{candidate_count}}: {{candidates}}\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("match.schema.json"),
            r#"{"$version": "1", "type": "object", "required": ["matches"],
                "properties": {"matches": {"type": "array", "items": {
                    "type": "object", "required": ["candidate_id"],
                    "properties": {"candidate_id": {"type": "string"}, "score": {"type": "number"}}}}}}"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn loads_fixture_directory() {
        let dir = fixture_dir("name,city\nA,Aalst\nB,Ghent\n");
        let inputs = PipelineInputs::load(&dir, true, None).unwrap();
        assert_eq!(inputs.records.len(), 2);
        assert_eq!(inputs.profile.prompt_version, "1");
        assert_eq!(inputs.profile.context_version.len(), 12);
        assert_eq!(inputs.profile.contract.version, "1");
        assert!(inputs.context.contains("## notes.txt\nAalst industrial zone"));
        assert_eq!(inputs.settings.matching.candidate_limit, 10);
        assert!(inputs.matching.is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn limit_override_applies() {
        let dir = fixture_dir("name,city\nA,Aalst\nB,Ghent\n");
        let inputs = PipelineInputs::load(&dir, false, Some(1)).unwrap();
        assert_eq!(inputs.records.len(), 1);
        assert!(inputs.matching.is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_schema_is_config_error() {
        let dir = fixture_dir("name\nA\n");
        std::fs::remove_file(dir.join("match.schema.json")).unwrap();
        let err = PipelineInputs::load(&dir, true, None).unwrap_err();
        assert!(matches!(err, MatflowError::Config { .. }));
        // Profile-only runs do not need the match files.
        assert!(PipelineInputs::load(&dir, false, None).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_template_fails_before_any_work() {
        let dir = fixture_dir("name\nA\n");
        std::fs::write(dir.join("profile_prompt.txt"), "{{candidates}}").unwrap();
        let err = PipelineInputs::load(&dir, false, None).unwrap_err();
        assert!(err.to_string().contains("unknown placeholder"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
