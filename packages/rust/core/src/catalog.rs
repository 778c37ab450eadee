//! Catalog ingestion: delimited rows → [`SourceRecord`]s.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use matflow_shared::{MatflowError, Provenance, Result, SourceRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// `[catalog]` section of `pipeline.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Catalog file, relative to the input directory.
    #[serde(default = "default_file")]
    pub file: String,

    /// Single-character field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Column whose value becomes the record id.
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Keep only the first N rows that pass the filter.
    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub filter: Option<RowFilter>,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            file: default_file(),
            delimiter: default_delimiter(),
            id_column: default_id_column(),
            limit: None,
            filter: None,
        }
    }
}

fn default_file() -> String {
    "catalog.csv".into()
}
fn default_delimiter() -> String {
    ",".into()
}
fn default_id_column() -> String {
    "Company Name".into()
}

/// Keep rows whose `column` equals `equals` (both trimmed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub equals: String,
}

/// Reduce arbitrary text to `[A-Za-z0-9_-]`, usable as a file name.
pub fn safe_name(value: &str) -> String {
    let mapped: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_matches('_').to_string()
}

/// Read the catalog file into records, applying the filter and limit.
pub fn read_catalog(path: &Path, settings: &CatalogSettings) -> Result<Vec<SourceRecord>> {
    let delimiter = match settings.delimiter.as_bytes() {
        [b] => *b,
        b"\\t" => b'\t',
        _ => {
            return Err(MatflowError::config(format!(
                "catalog delimiter must be a single character, got '{}'",
                settings.delimiter
            )));
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .map_err(|e| MatflowError::config(format!("cannot open catalog {}: {e}", path.display())))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| MatflowError::parse(format!("catalog header: {e}")))?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    if !headers.iter().any(|h| *h == settings.id_column) {
        return Err(MatflowError::config(format!(
            "catalog {} has no '{}' column",
            path.display(),
            settings.id_column
        )));
    }
    if let Some(filter) = &settings.filter {
        if !headers.iter().any(|h| *h == filter.column) {
            return Err(MatflowError::config(format!(
                "catalog filter column '{}' not found",
                filter.column
            )));
        }
    }

    let source_file = path.display().to_string();
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for (row_index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| MatflowError::parse(format!("catalog row {row_index}: {e}")))?;
        let fields: BTreeMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();

        if let Some(filter) = &settings.filter {
            let value = fields.get(&filter.column).map(|v| v.trim()).unwrap_or("");
            if value != filter.equals.trim() {
                continue;
            }
        }

        let mut id = fields
            .get(&settings.id_column)
            .map(|v| safe_name(v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("row-{row_index}"));
        if !seen.insert(id.clone()) {
            // Suffix with the row index, counting up past ids already taken.
            let base = id;
            let mut n = row_index;
            id = format!("{base}-{n}");
            while !seen.insert(id.clone()) {
                n += 1;
                id = format!("{base}-{n}");
            }
            debug!(%id, "duplicate catalog id, suffixed");
        }

        records.push(SourceRecord {
            id,
            fields,
            provenance: Provenance {
                source_file: source_file.clone(),
                row_index,
            },
        });

        if settings.limit.is_some_and(|n| records.len() >= n) {
            break;
        }
    }

    info!(path = %path.display(), records = records.len(), "catalog loaded");
    Ok(records)
}
