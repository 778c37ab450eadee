//! Prompt templates with `{{ name }}` placeholders.
//!
//! Placeholders are checked against the stage's variable set when the
//! template is loaded, so a typo fails the run before any model call.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use matflow_shared::{MatflowError, Result, Stage, content_hash};
use regex::{Captures, Regex};
use tracing::warn;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex")
});

/// Variables every stage provides.
pub const COMMON_VARIABLES: &[&str] = &["record_id", "record", "context", "stage"];

/// Variables only the matching stage provides.
pub const MATCHING_VARIABLES: &[&str] = &["profile", "candidates", "candidate_count"];

fn allowed(stage: Stage, name: &str) -> bool {
    COMMON_VARIABLES.contains(&name)
        || (stage == Stage::Matching && MATCHING_VARIABLES.contains(&name))
}

/// A parsed, stage-checked prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    stage: Stage,
    source: String,
}

impl PromptTemplate {
    /// Parse `source` for `stage`. Unknown placeholders are a config error.
    pub fn parse(stage: Stage, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let mut unknown: Vec<String> = PLACEHOLDER_RE
            .captures_iter(&source)
            .map(|c| c[1].to_string())
            .filter(|name| !allowed(stage, name))
            .collect();
        unknown.sort();
        unknown.dedup();

        if !unknown.is_empty() {
            return Err(MatflowError::config(format!(
                "{stage} template uses unknown placeholder(s): {}",
                unknown.join(", ")
            )));
        }
        if !PLACEHOLDER_RE.is_match(&source) {
            warn!(%stage, "template has no placeholders; every item gets the same prompt");
        }

        Ok(Self { stage, source })
    }

    /// Default prompt version: hash prefix of the template text.
    pub fn content_version(&self) -> String {
        content_hash(&self.source)[..12].to_string()
    }

    /// Substitute every placeholder from `vars`.
    pub fn render(&self, vars: &TemplateVars) -> Result<String> {
        let mut missing = Vec::new();
        let rendered = PLACEHOLDER_RE.replace_all(&self.source, |caps: &Captures| {
            match vars.values.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    missing.push(caps[1].to_string());
                    String::new()
                }
            }
        });

        if missing.is_empty() {
            Ok(rendered.into_owned())
        } else {
            Err(MatflowError::config(format!(
                "{} template variable(s) not provided: {}",
                self.stage,
                missing.join(", ")
            )))
        }
    }
}

/// Values for one rendering.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_whitespace_tolerant_placeholders() {
        let t = PromptTemplate::parse(Stage::Profile, "Company {{record_id}}:\n{{ record }}").unwrap();
        let out = t
            .render(&TemplateVars::new().set("record_id", "acme").set("record", "{}"))
            .unwrap();
        assert_eq!(out, "Company acme:\n{}");
    }

    #[test]
    fn matching_variables_rejected_in_profile_stage() {
        let err = PromptTemplate::parse(Stage::Profile, "{{profile}} {{candidates}}").unwrap_err();
        assert!(matches!(err, MatflowError::Config { .. }));
        assert!(err.to_string().contains("profile, candidates"));

        assert!(PromptTemplate::parse(Stage::Matching, "{{profile}} {{candidates}}").is_ok());
    }

    #[test]
    fn unknown_placeholder_is_config_error() {
        let err = PromptTemplate::parse(Stage::Matching, "{{recrod}}").unwrap_err();
        assert!(err.to_string().contains("recrod"));

        // Each bad name is listed once, however often it appears.
        let err = PromptTemplate::parse(Stage::Profile, "{{zz}} {{aa}} {{zz}} {{ aa }}").unwrap_err();
        assert!(err.to_string().ends_with("placeholder(s): aa, zz"), "{err}");
    }

    #[test]
    fn missing_value_at_render_is_reported() {
        let t = PromptTemplate::parse(Stage::Profile, "{{record}} / {{context}}").unwrap();
        let err = t.render(&TemplateVars::new().set("record", "x")).unwrap_err();
        assert!(err.to_string().contains("context"));
    }

    #[test]
    fn content_version_tracks_text() {
        let a = PromptTemplate::parse(Stage::Profile, "v1 {{record}}").unwrap();
        let b = PromptTemplate::parse(Stage::Profile, "v2 {{record}}").unwrap();
        assert_ne!(a.content_version(), b.content_version());
        assert_eq!(a.content_version().len(), 12);
    }
}
