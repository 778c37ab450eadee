use std::collections::HashMap;
use std::path::{Path, PathBuf};

use matflow_shared::{MatflowError, Result, content_hash};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Nesting limit for file `$ref` chains; deeper chains are treated as cycles.
const MAX_REF_DEPTH: usize = 32;

/// Root keyword that makes every object node accept undeclared properties.
const PERMISSIVE_KEYWORD: &str = "x-permissive";

/// Knobs that change how strictly a document is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorOptions {
    /// Accept object properties that the schema does not declare.
    pub permissive: bool,
}

/// A named, versioned JSON-Schema document that model output must satisfy.
#[derive(Debug, Clone)]
pub struct SchemaContract {
    pub name: String,
    /// Explicit `$version`/`version` from the document, else a content hash prefix.
    pub version: String,
    /// Fully resolved schema (no file references left).
    pub document: Value,
    pub options: ValidatorOptions,
    /// Every `pattern` in the document, compiled once.
    patterns: HashMap<String, Regex>,
}

impl SchemaContract {
    /// Build a contract from an in-memory schema document.
    pub fn new(name: impl Into<String>, document: Value) -> Result<Self> {
        let name = name.into();
        if !document.is_object() {
            return Err(MatflowError::config(format!(
                "schema '{name}' must be a JSON object"
            )));
        }
        let mut patterns = HashMap::new();
        compile_patterns(&document, "$", &mut patterns)?;

        let permissive = document
            .get(PERMISSIVE_KEYWORD)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let version = declared_version(&document).unwrap_or_else(|| {
            let canonical = document.to_string();
            content_hash(&canonical)[..12].to_string()
        });

        Ok(Self {
            name,
            version,
            document,
            options: ValidatorOptions { permissive },
            patterns,
        })
    }

    /// Load a schema file, inlining any `$ref` that points at another file.
    pub fn load(path: &Path) -> Result<Self> {
        let document = read_schema_file(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let resolved = resolve_file_refs(document, &base_dir, 0)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().trim_end_matches(".schema").to_string())
            .unwrap_or_else(|| "schema".into());
        let contract = Self::new(name, resolved)?;
        debug!(name = %contract.name, version = %contract.version, path = %path.display(), "loaded schema contract");
        Ok(contract)
    }

    /// Override the permissive flag (e.g. from pipeline settings).
    pub fn with_permissive(mut self, permissive: bool) -> Self {
        self.options.permissive = self.options.permissive || permissive;
        self
    }

    /// Compiled form of a `pattern` keyword found in the document.
    pub(crate) fn pattern(&self, source: &str) -> Option<&Regex> {
        self.patterns.get(source)
    }
}

fn declared_version(document: &Value) -> Option<String> {
    ["$version", "version"].iter().find_map(|key| match document.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn read_schema_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MatflowError::config(format!("cannot read schema {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| MatflowError::config(format!("invalid JSON in schema {}: {e}", path.display())))
}

/// Replace every non-local `$ref` node with the referenced file content.
fn resolve_file_refs(schema: Value, base_dir: &Path, depth: usize) -> Result<Value> {
    if depth > MAX_REF_DEPTH {
        return Err(MatflowError::config(
            "schema $ref chain too deep (cyclic file references?)",
        ));
    }

    match schema {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if !reference.starts_with('#') {
                    let (file, fragment) = match reference.split_once('#') {
                        Some((file, fragment)) => (file, Some(fragment)),
                        None => (reference.as_str(), None),
                    };
                    let ref_path: PathBuf = base_dir.join(file);
                    let file_root = read_schema_file(&ref_path)?;
                    let target = match fragment.filter(|f| !f.is_empty()) {
                        Some(pointer) => file_root.pointer(pointer).cloned().ok_or_else(|| {
                            MatflowError::config(format!(
                                "schema reference '{reference}' does not resolve"
                            ))
                        })?,
                        None => file_root.clone(),
                    };
                    // `#/...` inside the file means that file's root, not ours.
                    let target = inline_local_refs(target, &file_root, &ref_path, depth + 1)?;
                    let next_base = ref_path.parent().map(Path::to_path_buf).unwrap_or_default();
                    return resolve_file_refs(target, &next_base, depth + 1);
                }
            }
            map.into_iter()
                .map(|(key, value)| Ok((key, resolve_file_refs(value, base_dir, depth)?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| resolve_file_refs(item, base_dir, depth))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// Replace local `$ref`s with their targets in `file_root`.
fn inline_local_refs(schema: Value, file_root: &Value, file: &Path, depth: usize) -> Result<Value> {
    if depth > MAX_REF_DEPTH {
        return Err(MatflowError::config(format!(
            "schema $ref chain too deep in {} (recursive definitions are not supported across files)",
            file.display()
        )));
    }

    match schema {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if let Some(pointer) = reference.strip_prefix('#') {
                    let target = file_root.pointer(pointer).cloned().ok_or_else(|| {
                        MatflowError::config(format!(
                            "schema reference '{reference}' in {} does not resolve",
                            file.display()
                        ))
                    })?;
                    return inline_local_refs(target, file_root, file, depth + 1);
                }
            }
            map.into_iter()
                .map(|(key, value)| Ok((key, inline_local_refs(value, file_root, file, depth)?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| inline_local_refs(item, file_root, file, depth))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// Compile every `pattern` regex up front; a bad one is a config error.
fn compile_patterns(schema: &Value, at: &str, out: &mut HashMap<String, Regex>) -> Result<()> {
    match schema {
        Value::Object(map) => {
            if let Some(Value::String(pattern)) = map.get("pattern") {
                if !out.contains_key(pattern) {
                    let re = Regex::new(pattern).map_err(|e| {
                        MatflowError::config(format!("invalid pattern at {at}: {e}"))
                    })?;
                    out.insert(pattern.clone(), re);
                }
            }
            for (key, value) in map {
                compile_patterns(value, &format!("{at}/{key}"), out)?;
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| compile_patterns(item, &format!("{at}/{i}"), out)),
        _ => Ok(()),
    }
}
