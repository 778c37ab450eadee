//! Per-item JSON documents plus their normalized database rows.
//!
//! A document write is all-or-nothing across the file and the rows:
//!
//! 1. Serialize and write the document to a hidden temp file
//! 2. Open a transaction (holding the write gate) and upsert the rows,
//!    replacing child rows wholesale
//! 3. Move any previous document aside, rename the temp file into place
//! 4. Commit, then drop the backup
//!
//! Any failure rolls the transaction back, removes the temp file and puts
//! the previous document back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::{Transaction, params};
use matflow_shared::{ArtifactRef, MatchResult, MatflowError, Profile, Result, Stage};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Storage, storage_err};

/// Rows that accompany a document.
enum Rows<'a> {
    Profile(&'a Profile),
    Match(&'a MatchResult),
}

/// Durable store for stage documents.
pub struct ArtifactStore {
    root: PathBuf,
    storage: Arc<Storage>,
}

impl ArtifactStore {
    /// Documents live under `root/<stage dir>/`.
    pub fn new(root: impl Into<PathBuf>, storage: Arc<Storage>) -> Self {
        Self {
            root: root.into(),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Final location of a stage document.
    pub fn artifact_path(&self, stage: Stage, record_id: &str) -> PathBuf {
        self.root
            .join(stage.artifact_dir())
            .join(format!("{record_id}.json"))
    }

    /// Persist a validated profile.
    pub async fn write_profile(&self, profile: &Profile) -> Result<ArtifactRef> {
        self.commit(Stage::Profile, &profile.record_id, profile, Rows::Profile(profile))
            .await
    }

    /// Persist a validated match result.
    pub async fn write_match(&self, result: &MatchResult) -> Result<ArtifactRef> {
        self.commit(Stage::Matching, &result.subject_id, result, Rows::Match(result))
            .await
    }

    /// Read a profile document back from its artifact file.
    pub fn read_profile(&self, artifact: &ArtifactRef) -> Result<Profile> {
        read_document(&artifact.path)
    }

    /// Read a match document back from its artifact file.
    pub fn read_match(&self, artifact: &ArtifactRef) -> Result<MatchResult> {
        read_document(&artifact.path)
    }

    async fn commit<T: serde::Serialize>(
        &self,
        stage: Stage,
        record_id: &str,
        document: &T,
        rows: Rows<'_>,
    ) -> Result<ArtifactRef> {
        let target = self.artifact_path(stage, record_id);
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let temp = dir.join(format!(".{record_id}.json.tmp"));
        let backup = dir.join(format!(".{record_id}.json.bak"));

        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| MatflowError::Storage(format!("serialize {stage} {record_id}: {e}")))?;

        std::fs::create_dir_all(&dir).map_err(|e| io_storage(&dir, e))?;
        if let Err(e) = std::fs::write(&temp, &bytes) {
            let _ = std::fs::remove_file(&temp);
            return Err(io_storage(&temp, e));
        }

        let write = match self.storage.begin_write().await {
            Ok(w) => w,
            Err(e) => {
                let _ = std::fs::remove_file(&temp);
                return Err(e);
            }
        };

        let upsert = match rows {
            Rows::Profile(p) => upsert_profile_rows(&write.tx, p, &target).await,
            Rows::Match(m) => upsert_match_rows(&write.tx, m, &target).await,
        };
        if let Err(e) = upsert {
            abort(write.tx, &temp).await;
            return Err(e);
        }

        let had_previous = target.exists();
        if had_previous {
            if let Err(e) = std::fs::rename(&target, &backup) {
                abort(write.tx, &temp).await;
                return Err(io_storage(&target, e));
            }
        }

        if let Err(e) = std::fs::rename(&temp, &target) {
            restore(&backup, &target, had_previous);
            abort(write.tx, &temp).await;
            return Err(io_storage(&target, e));
        }

        if let Err(e) = write.tx.commit().await {
            let _ = std::fs::remove_file(&target);
            restore(&backup, &target, had_previous);
            return Err(storage_err(e));
        }

        if had_previous {
            let _ = std::fs::remove_file(&backup);
        }

        debug!(%stage, record_id, path = %target.display(), "artifact committed");
        Ok(ArtifactRef {
            stage,
            record_id: record_id.to_string(),
            path: target,
        })
    }
}

fn io_storage(path: &Path, e: std::io::Error) -> MatflowError {
    MatflowError::Storage(format!("{}: {e}", path.display()))
}

async fn abort(tx: Transaction, temp: &Path) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
    let _ = std::fs::remove_file(temp);
}

fn restore(backup: &Path, target: &Path, had_previous: bool) {
    if had_previous {
        if let Err(e) = std::fs::rename(backup, target) {
            warn!(error = %e, path = %target.display(), "failed to restore previous artifact");
        }
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| MatflowError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| MatflowError::parse(format!("{}: {e}", path.display())))
}

async fn upsert_profile_rows(tx: &Transaction, profile: &Profile, path: &Path) -> Result<()> {
    let document_json = serde_json::to_string(profile).map_err(storage_err)?;
    let file_path = path.to_string_lossy().to_string();

    tx.execute(
        "INSERT INTO profiles (record_id, fingerprint, schema_version, prompt_version, model, call_id, generated_at, file_path, document_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(record_id) DO UPDATE SET
           fingerprint = excluded.fingerprint,
           schema_version = excluded.schema_version,
           prompt_version = excluded.prompt_version,
           model = excluded.model,
           call_id = excluded.call_id,
           generated_at = excluded.generated_at,
           file_path = excluded.file_path,
           document_json = excluded.document_json",
        params![
            profile.record_id.as_str(),
            profile.fingerprint.as_str(),
            profile.schema_version.as_str(),
            profile.prompt_version.as_str(),
            profile.model.as_str(),
            profile.call_id.as_str(),
            profile.generated_at.to_rfc3339(),
            file_path,
            document_json,
        ],
    )
    .await
    .map_err(storage_err)?;

    tx.execute(
        "DELETE FROM profile_attributes WHERE record_id = ?1",
        params![profile.record_id.as_str()],
    )
    .await
    .map_err(storage_err)?;

    if let Value::Object(attributes) = &profile.attributes {
        for (attribute, value) in attributes {
            tx.execute(
                "INSERT INTO profile_attributes (record_id, attribute, value_json) VALUES (?1, ?2, ?3)",
                params![profile.record_id.as_str(), attribute.as_str(), value.to_string()],
            )
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

async fn upsert_match_rows(tx: &Transaction, result: &MatchResult, path: &Path) -> Result<()> {
    let document_json = serde_json::to_string(result).map_err(storage_err)?;
    let candidate_ids_json = serde_json::to_string(&result.candidate_ids).map_err(storage_err)?;
    let file_path = path.to_string_lossy().to_string();

    tx.execute(
        "INSERT INTO matches (subject_id, fingerprint, schema_version, prompt_version, model, call_id, generated_at, candidate_ids_json, file_path, document_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(subject_id) DO UPDATE SET
           fingerprint = excluded.fingerprint,
           schema_version = excluded.schema_version,
           prompt_version = excluded.prompt_version,
           model = excluded.model,
           call_id = excluded.call_id,
           generated_at = excluded.generated_at,
           candidate_ids_json = excluded.candidate_ids_json,
           file_path = excluded.file_path,
           document_json = excluded.document_json",
        params![
            result.subject_id.as_str(),
            result.fingerprint.as_str(),
            result.schema_version.as_str(),
            result.prompt_version.as_str(),
            result.model.as_str(),
            result.call_id.as_str(),
            result.generated_at.to_rfc3339(),
            candidate_ids_json,
            file_path,
            document_json,
        ],
    )
    .await
    .map_err(storage_err)?;

    tx.execute(
        "DELETE FROM match_entries WHERE subject_id = ?1",
        params![result.subject_id.as_str()],
    )
    .await
    .map_err(storage_err)?;

    for entry in &result.entries {
        tx.execute(
            "INSERT INTO match_entries (subject_id, ordinal, candidate_id, score, category, entry_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.subject_id.as_str(),
                entry.ordinal as i64,
                entry.candidate_id.as_str(),
                entry.score,
                entry.category.as_deref(),
                entry.entry.to_string(),
            ],
        )
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use libsql::params;
    use matflow_shared::{Fingerprint, MatchEntry};
    use serde_json::json;
    use uuid::Uuid;

    async fn test_store() -> (ArtifactStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("mf-artifacts-{}", Uuid::now_v7()));
        let storage = Storage::open(&root.join("databases").join("matflow.db"))
            .await
            .expect("open db");
        (ArtifactStore::new(&root, Arc::new(storage)), root)
    }

    fn profile(record_id: &str, attributes: Value) -> Profile {
        Profile {
            record_id: record_id.into(),
            schema_version: "1".into(),
            prompt_version: "1".into(),
            fingerprint: Fingerprint::from_hex("f".repeat(64)),
            attributes,
            generated_at: Utc::now(),
            call_id: "call-1".into(),
            model: "gemini-test".into(),
        }
    }

    #[tokio::test]
    async fn profile_write_creates_file_and_rows() {
        let (store, root) = test_store().await;
        let p = profile("acme", json!({"sector": "metals", "outputs": ["slag"]}));

        let artifact = store.write_profile(&p).await.expect("write profile");
        assert_eq!(artifact.path, root.join("profiles").join("acme.json"));
        assert_eq!(store.read_profile(&artifact).unwrap(), p);

        let attrs = store.storage().profile_attributes("acme").await.unwrap();
        assert_eq!(
            attrs,
            vec![
                ("outputs".to_string(), r#"["slag"]"#.to_string()),
                ("sector".to_string(), r#""metals""#.to_string()),
            ]
        );
        assert!(store.storage().profile_document("acme").await.unwrap().is_some());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rewrite_replaces_child_rows() {
        let (store, root) = test_store().await;
        store
            .write_profile(&profile("acme", json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        store
            .write_profile(&profile("acme", json!({"c": 3})))
            .await
            .unwrap();

        let attrs = store.storage().profile_attributes("acme").await.unwrap();
        assert_eq!(attrs, vec![("c".to_string(), "3".to_string())]);
        let leftovers: Vec<_> = std::fs::read_dir(root.join("profiles"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["acme.json".to_string()]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn match_write_normalizes_entries() {
        let (store, root) = test_store().await;
        let result = MatchResult {
            subject_id: "acme".into(),
            candidate_ids: vec!["beta".into(), "gamma".into()],
            schema_version: "1".into(),
            prompt_version: "1".into(),
            fingerprint: Fingerprint::from_hex("e".repeat(64)),
            document: json!({"matches": [{"candidate_id": "beta", "score": 0.9}]}),
            entries: vec![MatchEntry {
                ordinal: 0,
                candidate_id: "beta".into(),
                score: Some(0.9),
                category: None,
                entry: json!({"candidate_id": "beta", "score": 0.9}),
            }],
            generated_at: Utc::now(),
            call_id: "call-2".into(),
            model: "gemini-test".into(),
        };

        let artifact = store.write_match(&result).await.expect("write match");
        assert_eq!(artifact.path, root.join("matches").join("acme.json"));
        assert_eq!(store.read_match(&artifact).unwrap(), result);

        let entries = store.storage().match_entries("acme").await.unwrap();
        assert_eq!(entries, vec![(0, "beta".to_string(), Some(0.9))]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failed_row_write_leaves_no_file_and_no_rows() {
        let (store, root) = test_store().await;
        store
            .storage()
            .conn
            .execute("DROP TABLE profile_attributes", params![])
            .await
            .unwrap();

        let result = store
            .write_profile(&profile("acme", json!({"sector": "metals"})))
            .await;
        assert!(matches!(result, Err(MatflowError::Storage(_))));
        assert!(!root.join("profiles").join("acme.json").exists());
        assert!(!root.join("profiles").join(".acme.json.tmp").exists());
        assert!(store.storage().profile_document("acme").await.unwrap().is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failed_rename_keeps_previous_document() {
        let (store, root) = test_store().await;
        let first = profile("acme", json!({"v": 1}));
        let artifact = store.write_profile(&first).await.unwrap();

        // A directory squatting on the temp path makes the temp write fail.
        std::fs::create_dir_all(root.join("profiles").join(".acme.json.tmp")).unwrap();
        let result = store.write_profile(&profile("acme", json!({"v": 2}))).await;
        assert!(result.is_err());

        assert_eq!(store.read_profile(&artifact).unwrap(), first);
        let attrs = store.storage().profile_attributes("acme").await.unwrap();
        assert_eq!(attrs, vec![("v".to_string(), "1".to_string())]);

        let _ = std::fs::remove_dir_all(&root);
    }
}
