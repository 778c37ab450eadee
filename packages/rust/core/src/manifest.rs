//! Fingerprint cache: per-run view of which work items are done.
//!
//! State transitions are check-and-set under a short in-memory lock (never
//! held across an await) and are written through to the `run_manifest`
//! table before the call returns. If the write fails, the in-memory change
//! is reverted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use matflow_shared::{
    ArtifactRef, Fingerprint, ItemStatus, ManifestEntry, MatflowError, Result, Stage,
};
use matflow_storage::Storage;
use tracing::{debug, info, warn};

/// What the cache knows about a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
    /// Never seen, or left over from an interrupted or failed earlier run.
    Absent,
    InFlight,
    Completed(ArtifactRef),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
enum SlotState {
    InFlight,
    Completed(ArtifactRef),
    Failed(String),
}

#[derive(Debug, Clone)]
struct Slot {
    stage: Stage,
    record_id: String,
    state: SlotState,
}

/// Counts by state, for progress and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-memory fingerprint states backed by the durable run manifest.
pub struct FingerprintCache {
    storage: Arc<Storage>,
    run_id: String,
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl FingerprintCache {
    /// Load prior state. Only completed items whose artifact still exists
    /// carry over; everything else starts absent.
    pub async fn load(storage: Arc<Storage>, run_id: impl Into<String>) -> Result<Self> {
        let mut slots = HashMap::new();
        let mut stale = 0usize;

        for entry in storage.load_manifest().await? {
            if entry.status != ItemStatus::Completed {
                continue;
            }
            match entry.artifact_path {
                Some(path) if path.exists() => {
                    slots.insert(
                        entry.fingerprint,
                        Slot {
                            stage: entry.stage,
                            record_id: entry.record_id.clone(),
                            state: SlotState::Completed(ArtifactRef {
                                stage: entry.stage,
                                record_id: entry.record_id,
                                path,
                            }),
                        },
                    );
                }
                _ => {
                    stale += 1;
                    debug!(record_id = %entry.record_id, stage = %entry.stage, "completed entry has no artifact, recomputing");
                }
            }
        }

        info!(completed = slots.len(), stale, "fingerprint cache loaded");
        Ok(Self {
            storage,
            run_id: run_id.into(),
            slots: Mutex::new(slots),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lookup(&self, fp: &Fingerprint) -> CacheStatus {
        match self.slots().get(fp).map(|s| &s.state) {
            None => CacheStatus::Absent,
            Some(SlotState::InFlight) => CacheStatus::InFlight,
            Some(SlotState::Completed(r)) => CacheStatus::Completed(r.clone()),
            Some(SlotState::Failed(reason)) => CacheStatus::Failed(reason.clone()),
        }
    }

    /// Claim a fingerprint for this run. Fails if it is already claimed or
    /// has reached a terminal state.
    pub async fn mark_in_flight(&self, fp: &Fingerprint, stage: Stage, record_id: &str) -> Result<()> {
        {
            let mut slots = self.slots();
            if let Some(existing) = slots.get(fp) {
                return Err(MatflowError::conflict(
                    fp.as_str(),
                    format!("cannot claim, already {}", describe(&existing.state)),
                ));
            }
            slots.insert(
                fp.clone(),
                Slot {
                    stage,
                    record_id: record_id.to_string(),
                    state: SlotState::InFlight,
                },
            );
        }

        let entry = self.entry(fp, stage, record_id, ItemStatus::InFlight, None, None);
        if let Err(e) = self.storage.upsert_manifest_entry(&entry).await {
            self.slots().remove(fp);
            return Err(e);
        }
        Ok(())
    }

    /// Record success. Repeating with the same artifact is a no-op.
    pub async fn mark_completed(&self, fp: &Fingerprint, artifact: ArtifactRef) -> Result<()> {
        let (stage, record_id) = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(fp)
                .ok_or_else(|| MatflowError::conflict(fp.as_str(), "cannot complete, not in flight"))?;
            match &slot.state {
                SlotState::InFlight => {}
                SlotState::Completed(existing) if *existing == artifact => return Ok(()),
                other => {
                    return Err(MatflowError::conflict(
                        fp.as_str(),
                        format!("cannot complete, already {}", describe(other)),
                    ));
                }
            }
            slot.state = SlotState::Completed(artifact.clone());
            (slot.stage, slot.record_id.clone())
        };

        let entry = self.entry(
            fp,
            stage,
            &record_id,
            ItemStatus::Completed,
            Some(&artifact),
            None,
        );
        if let Err(e) = self.storage.upsert_manifest_entry(&entry).await {
            self.set_state(fp, SlotState::InFlight);
            return Err(e);
        }
        Ok(())
    }

    /// Record a permanent failure. Repeating is a no-op.
    pub async fn mark_failed(&self, fp: &Fingerprint, reason: &str) -> Result<()> {
        let (stage, record_id) = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(fp)
                .ok_or_else(|| MatflowError::conflict(fp.as_str(), "cannot fail, not in flight"))?;
            match &slot.state {
                SlotState::InFlight => {}
                SlotState::Failed(_) => return Ok(()),
                other => {
                    return Err(MatflowError::conflict(
                        fp.as_str(),
                        format!("cannot fail, already {}", describe(other)),
                    ));
                }
            }
            slot.state = SlotState::Failed(reason.to_string());
            (slot.stage, slot.record_id.clone())
        };

        let entry = self.entry(fp, stage, &record_id, ItemStatus::Failed, None, Some(reason));
        if let Err(e) = self.storage.upsert_manifest_entry(&entry).await {
            self.set_state(fp, SlotState::InFlight);
            return Err(e);
        }
        Ok(())
    }

    /// Drop an in-flight claim back to pending (interrupted work).
    pub async fn release(&self, fp: &Fingerprint) -> Result<()> {
        let released = {
            let mut slots = self.slots();
            let in_flight =
                matches!(slots.get(fp), Some(slot) if slot.state == SlotState::InFlight);
            if in_flight { slots.remove(fp) } else { None }
        };

        if let Some(slot) = released {
            let entry = self.entry(fp, slot.stage, &slot.record_id, ItemStatus::Pending, None, None);
            if let Err(e) = self.storage.upsert_manifest_entry(&entry).await {
                // The row stays in_flight, which the next run treats as absent anyway.
                warn!(error = %e, record_id = %slot.record_id, "failed to release manifest entry");
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> CacheCounts {
        self.slots()
            .values()
            .fold(CacheCounts::default(), |mut counts, slot| {
                match slot.state {
                    SlotState::InFlight => counts.in_flight += 1,
                    SlotState::Completed(_) => counts.completed += 1,
                    SlotState::Failed(_) => counts.failed += 1,
                }
                counts
            })
    }

    fn set_state(&self, fp: &Fingerprint, state: SlotState) {
        if let Some(slot) = self.slots().get_mut(fp) {
            slot.state = state;
        }
    }

    fn entry(
        &self,
        fp: &Fingerprint,
        stage: Stage,
        record_id: &str,
        status: ItemStatus,
        artifact: Option<&ArtifactRef>,
        reason: Option<&str>,
    ) -> ManifestEntry {
        ManifestEntry {
            fingerprint: fp.clone(),
            stage,
            record_id: record_id.to_string(),
            status,
            artifact_path: artifact.map(|a| a.path.clone()),
            reason: reason.map(String::from),
            run_id: self.run_id.clone(),
            updated_at: Utc::now(),
        }
    }
}

fn describe(state: &SlotState) -> &'static str {
    match state {
        SlotState::InFlight => "in flight",
        SlotState::Completed(_) => "completed",
        SlotState::Failed(_) => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn test_cache() -> (FingerprintCache, Arc<Storage>, PathBuf) {
        let root = std::env::temp_dir().join(format!("mf-cache-{}", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&root.join("matflow.db")).await.unwrap());
        let cache = FingerprintCache::load(Arc::clone(&storage), "run-1").await.unwrap();
        (cache, storage, root)
    }

    fn artifact(root: &std::path::Path, id: &str) -> ArtifactRef {
        let path = root.join(format!("{id}.json"));
        std::fs::write(&path, "{}").unwrap();
        ArtifactRef {
            stage: Stage::Profile,
            record_id: id.into(),
            path,
        }
    }

    #[tokio::test]
    async fn lifecycle_and_write_through() {
        let (cache, storage, root) = test_cache().await;
        let fp = Fingerprint::from_hex("a1");
        assert_eq!(cache.lookup(&fp), CacheStatus::Absent);

        cache.mark_in_flight(&fp, Stage::Profile, "acme").await.unwrap();
        assert_eq!(cache.lookup(&fp), CacheStatus::InFlight);
        assert_eq!(storage.load_manifest().await.unwrap()[0].status, ItemStatus::InFlight);

        let a = artifact(&root, "acme");
        cache.mark_completed(&fp, a.clone()).await.unwrap();
        assert_eq!(cache.lookup(&fp), CacheStatus::Completed(a.clone()));
        let rows = storage.load_manifest().await.unwrap();
        assert_eq!(rows[0].status, ItemStatus::Completed);
        assert_eq!(rows[0].artifact_path.as_ref(), Some(&a.path));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn double_claim_is_rejected() {
        let (cache, _storage, root) = test_cache().await;
        let fp = Fingerprint::from_hex("b2");
        cache.mark_in_flight(&fp, Stage::Profile, "acme").await.unwrap();
        let err = cache.mark_in_flight(&fp, Stage::Profile, "acme").await.unwrap_err();
        assert!(matches!(err, MatflowError::ManifestConflict { .. }));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn terminal_marks_are_idempotent_but_not_contradictory() {
        let (cache, _storage, root) = test_cache().await;
        let fp = Fingerprint::from_hex("c3");
        cache.mark_in_flight(&fp, Stage::Profile, "acme").await.unwrap();
        let a = artifact(&root, "acme");
        cache.mark_completed(&fp, a.clone()).await.unwrap();
        cache.mark_completed(&fp, a).await.unwrap();
        assert!(cache.mark_failed(&fp, "late failure").await.is_err());

        let fp2 = Fingerprint::from_hex("d4");
        cache.mark_in_flight(&fp2, Stage::Profile, "beta").await.unwrap();
        cache.mark_failed(&fp2, "validation").await.unwrap();
        cache.mark_failed(&fp2, "validation").await.unwrap();
        assert!(cache.mark_completed(&fp2, artifact(&root, "beta")).await.is_err());
        assert_eq!(cache.lookup(&fp2), CacheStatus::Failed("validation".into()));

        assert_eq!(
            cache.snapshot(),
            CacheCounts {
                in_flight: 0,
                completed: 1,
                failed: 1
            }
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn reload_keeps_only_completed_with_artifacts() {
        let (cache, storage, root) = test_cache().await;
        let done = Fingerprint::from_hex("e5");
        let crashed = Fingerprint::from_hex("f6");
        let failed = Fingerprint::from_hex("a7");
        let vanished = Fingerprint::from_hex("b8");

        cache.mark_in_flight(&done, Stage::Profile, "a").await.unwrap();
        cache.mark_completed(&done, artifact(&root, "a")).await.unwrap();
        cache.mark_in_flight(&crashed, Stage::Profile, "b").await.unwrap();
        cache.mark_in_flight(&failed, Stage::Profile, "c").await.unwrap();
        cache.mark_failed(&failed, "permanent").await.unwrap();
        cache.mark_in_flight(&vanished, Stage::Profile, "d").await.unwrap();
        let gone = artifact(&root, "d");
        cache.mark_completed(&vanished, gone.clone()).await.unwrap();
        std::fs::remove_file(&gone.path).unwrap();
        drop(cache);

        let reloaded = FingerprintCache::load(storage, "run-2").await.unwrap();
        assert!(matches!(reloaded.lookup(&done), CacheStatus::Completed(_)));
        assert_eq!(reloaded.lookup(&crashed), CacheStatus::Absent);
        assert_eq!(reloaded.lookup(&failed), CacheStatus::Absent);
        assert_eq!(reloaded.lookup(&vanished), CacheStatus::Absent);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn release_returns_to_pending() {
        let (cache, storage, root) = test_cache().await;
        let fp = Fingerprint::from_hex("c9");
        cache.mark_in_flight(&fp, Stage::Matching, "acme").await.unwrap();
        cache.release(&fp).await.unwrap();
        assert_eq!(cache.lookup(&fp), CacheStatus::Absent);
        assert_eq!(storage.load_manifest().await.unwrap()[0].status, ItemStatus::Pending);
        // Claimable again.
        cache.mark_in_flight(&fp, Stage::Matching, "acme").await.unwrap();
        let _ = std::fs::remove_dir_all(&root);
    }
}
