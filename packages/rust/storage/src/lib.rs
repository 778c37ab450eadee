//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding run records, the
//! durable run manifest, and the normalized profile and match tables.
//! [`ArtifactStore`] layers the per-item JSON documents on top of it.
//!
//! **Access rules:**
//! - Pipeline runs: read-write via [`Storage::open`]
//! - `status` inspection: read-only via [`Storage::open_readonly`]
//!
//! One connection is shared by every worker task. All writes go through a
//! single gate so an open transaction never picks up another task's
//! statements.

mod artifacts;
mod migrations;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Transaction, params};
use matflow_shared::{Fingerprint, ItemStatus, ManifestEntry, MatflowError, Result};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub use artifacts::ArtifactStore;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_gate: Mutex<()>,
}

/// An open transaction holding the write gate.
pub(crate) struct WriteTx<'a> {
    _gate: MutexGuard<'a, ()>,
    pub tx: Transaction,
}

fn storage_err(e: impl std::fmt::Display) -> MatflowError {
    MatflowError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MatflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_gate: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MatflowError::Storage(format!(
                "no database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_gate: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    MatflowError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MatflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Take the write gate and open a transaction.
    pub(crate) async fn begin_write(&self) -> Result<WriteTx<'_>> {
        self.check_writable()?;
        let gate = self.write_gate.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        Ok(WriteTx { _gate: gate, tx })
    }

    // -----------------------------------------------------------------------
    // Run records
    // -----------------------------------------------------------------------

    /// Insert a new run. Returns the generated run ID.
    pub async fn insert_run(&self) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at) VALUES (?1, ?2)",
                params![id.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Mark a run finished with its final stats.
    pub async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, stats_json FROM runs
                 ORDER BY started_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: parse_time(&row.get::<String>(1).map_err(storage_err)?)?,
                finished_at: row
                    .get::<String>(2)
                    .ok()
                    .map(|s| parse_time(&s))
                    .transpose()?,
                stats_json: row.get::<String>(3).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Run manifest
    // -----------------------------------------------------------------------

    /// Write one manifest row (insert or replace by fingerprint).
    pub async fn upsert_manifest_entry(&self, entry: &ManifestEntry) -> Result<()> {
        self.check_writable()?;
        let artifact_path = entry
            .artifact_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO run_manifest (fingerprint, stage, record_id, status, artifact_path, reason, run_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                   status = excluded.status,
                   artifact_path = excluded.artifact_path,
                   reason = excluded.reason,
                   run_id = excluded.run_id,
                   updated_at = excluded.updated_at",
                params![
                    entry.fingerprint.as_str(),
                    entry.stage.as_str(),
                    entry.record_id.as_str(),
                    entry.status.as_str(),
                    artifact_path,
                    entry.reason.as_deref(),
                    entry.run_id.as_str(),
                    entry.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Every manifest row.
    pub async fn load_manifest(&self) -> Result<Vec<ManifestEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint, stage, record_id, status, artifact_path, reason, run_id, updated_at
                 FROM run_manifest ORDER BY stage, record_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_manifest_entry(&row)?);
        }
        Ok(results)
    }

    /// Manifest row counts grouped by `(stage, status)`.
    pub async fn manifest_counts(&self) -> Result<Vec<(String, String, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage, status, COUNT(*) FROM run_manifest
                 GROUP BY stage, status ORDER BY stage, status",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
                row.get::<i64>(2).map_err(storage_err)? as u64,
            ));
        }
        Ok(results)
    }

    /// Failed manifest rows with their reasons, for reporting.
    pub async fn failed_items(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self
            .load_manifest()
            .await?
            .into_iter()
            .filter(|e| e.status == ItemStatus::Failed)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Document tables
    // -----------------------------------------------------------------------

    /// Stored profile document JSON for a record.
    pub async fn profile_document(&self, record_id: &str) -> Result<Option<String>> {
        self.single_text(
            "SELECT document_json FROM profiles WHERE record_id = ?1",
            record_id,
        )
        .await
    }

    /// `(attribute, value_json)` rows for a profile.
    pub async fn profile_attributes(&self, record_id: &str) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT attribute, value_json FROM profile_attributes
                 WHERE record_id = ?1 ORDER BY attribute",
                params![record_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            ));
        }
        Ok(results)
    }

    /// `(ordinal, candidate_id, score)` rows for a match subject.
    pub async fn match_entries(&self, subject_id: &str) -> Result<Vec<(i64, String, Option<f64>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT ordinal, candidate_id, score FROM match_entries
                 WHERE subject_id = ?1 ORDER BY ordinal",
                params![subject_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<i64>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
                row.get::<f64>(2).ok(),
            ));
        }
        Ok(results)
    }

    /// Row counts of the `profiles` and `matches` tables.
    pub async fn document_counts(&self) -> Result<(u64, u64)> {
        let mut rows = self
            .conn
            .query(
                "SELECT (SELECT COUNT(*) FROM profiles), (SELECT COUNT(*) FROM matches)",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok((
                row.get::<i64>(0).map_err(storage_err)? as u64,
                row.get::<i64>(1).map_err(storage_err)? as u64,
            )),
            Ok(None) => Ok((0, 0)),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn single_text(&self, sql: &str, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(sql, params![key])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

/// A pipeline invocation as recorded in `runs`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats_json: Option<String>,
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MatflowError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`ManifestEntry`].
fn row_to_manifest_entry(row: &libsql::Row) -> Result<ManifestEntry> {
    Ok(ManifestEntry {
        fingerprint: Fingerprint::from_hex(row.get::<String>(0).map_err(storage_err)?),
        stage: row.get::<String>(1).map_err(storage_err)?.parse()?,
        record_id: row.get::<String>(2).map_err(storage_err)?,
        status: row.get::<String>(3).map_err(storage_err)?.parse()?,
        artifact_path: row.get::<String>(4).ok().map(PathBuf::from),
        reason: row.get::<String>(5).ok(),
        run_id: row.get::<String>(6).map_err(storage_err)?,
        updated_at: parse_time(&row.get::<String>(7).map_err(storage_err)?)?,
    })
}
