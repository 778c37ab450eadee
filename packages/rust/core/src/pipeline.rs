//! End-to-end pipeline: profile every catalog record, then match each
//! profiled record against the others.
//!
//! Progress is reported via the [`ProgressReporter`] trait so the CLI can
//! drive spinners without this crate depending on a terminal library.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use matflow_gateway::ModelGateway;
use matflow_shared::{
    ArtifactRef, Fingerprint, MatflowError, Profile, Result, SourceRecord, Stage,
};
use matflow_storage::{ArtifactStore, Storage};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::inputs::{PipelineInputs, StageSpec};
use crate::manifest::{CacheStatus, FingerprintCache};
use crate::retry::RetryPolicy;
use crate::runner::{ItemOutcome, MatchFields, RunContext, StageSummary, WorkItem, run_stage};
use crate::shutdown::ShutdownSignal;
use crate::template::TemplateVars;

/// Database location relative to the output directory.
pub const DATABASE_PATH: &str = "databases/matflow.db";

/// Absolute database path for an output directory.
pub fn database_path(output_dir: &Path) -> PathBuf {
    output_dir.join(DATABASE_PATH)
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback trait for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each item of a stage reaches its final state.
    fn item_finished(
        &self,
        stage: Stage,
        record_id: &str,
        outcome: &ItemOutcome,
        current: usize,
        total: usize,
    );
    /// Called when the pipeline completes.
    fn done(&self, report: &PipelineReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_finished(&self, _: Stage, _: &str, _: &ItemOutcome, _: usize, _: usize) {}
    fn done(&self, _report: &PipelineReport) {}
}

// ---------------------------------------------------------------------------
// Configuration & results
// ---------------------------------------------------------------------------

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSelection {
    Profile,
    Matching,
    All,
}

impl StageSelection {
    pub fn includes(&self, stage: Stage) -> bool {
        match self {
            Self::All => true,
            Self::Profile => stage == Stage::Profile,
            Self::Matching => stage == Stage::Matching,
        }
    }
}

impl std::str::FromStr for StageSelection {
    type Err = MatflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "profile" | "profiles" => Ok(Self::Profile),
            "matching" | "match" | "matches" => Ok(Self::Matching),
            other => Err(MatflowError::config(format!(
                "unknown stage '{other}' (expected profile, matching or all)"
            ))),
        }
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub stages: StageSelection,
    pub concurrency: usize,
    /// Process at most this many catalog records.
    pub limit: Option<usize>,
    /// Render prompts to disk instead of calling the model.
    pub dry_run: bool,
    pub call_timeout: Duration,
    pub policy: RetryPolicy,
}

/// Result of a pipeline run; also written to `reports/run-<id>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub dry_run: bool,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub stages: Vec<StageSummary>,
    /// Records left out of matching because they have no profile.
    pub unprofiled: usize,
    /// Prompt files written by a dry run.
    pub prompts_written: usize,
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl PipelineReport {
    pub fn failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed.len()).sum()
    }

    pub fn model_calls(&self) -> u32 {
        self.stages.iter().map(|s| s.model_calls).sum()
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run the pipeline.
///
/// 1. Load and check inputs (config errors abort here)
/// 2. Open storage, register the run, load the fingerprint cache
/// 3. Stage 1: profile every record
/// 4. Stage 2: match every profiled record against the other profiles
/// 5. Write the run report
#[instrument(skip_all, fields(input = %config.input_dir.display(), stages = ?config.stages))]
pub async fn run_pipeline(
    config: &PipelineConfig,
    gateway: Arc<dyn ModelGateway>,
    shutdown: ShutdownSignal,
    progress: &dyn ProgressReporter,
) -> Result<PipelineReport> {
    let started_at = Utc::now();

    progress.phase("Loading inputs");
    let inputs = PipelineInputs::load(
        &config.input_dir,
        config.stages.includes(Stage::Matching),
        config.limit,
    )?;

    if config.dry_run {
        return dry_run(config, &inputs, gateway.model_id(), started_at, progress).await;
    }

    // --- Storage ---
    progress.phase("Opening storage");
    let storage = Arc::new(Storage::open(&database_path(&config.output_dir)).await?);
    let run_id = storage.insert_run().await?;
    let cache = Arc::new(FingerprintCache::load(Arc::clone(&storage), run_id.clone()).await?);
    let store = Arc::new(ArtifactStore::new(&config.output_dir, Arc::clone(&storage)));

    info!(%run_id, records = inputs.records.len(), "starting pipeline run");

    let ctx = RunContext {
        store: Arc::clone(&store),
        cache: Arc::clone(&cache),
        gateway: Arc::clone(&gateway),
        policy: config.policy.clone(),
        shutdown: shutdown.clone(),
        concurrency: config.concurrency,
        call_timeout: config.call_timeout,
    };

    let mut stages = Vec::new();
    let mut unprofiled = 0;

    // --- Stage 1 ---
    if config.stages.includes(Stage::Profile) {
        progress.phase("Generating profiles");
        let items = profile_items(&inputs, None)?;
        stages.push(
            run_stage(&ctx, inputs.profile.clone(), MatchFields::default(), items, progress).await,
        );
    }

    // --- Stage 2 ---
    if let Some(spec) = &inputs.matching {
        progress.phase("Matching materials");
        let (items, skipped) = matching_items(&inputs, spec, Some(&cache), &store, false)?;
        unprofiled = skipped;
        let fields = MatchFields::from_settings(&inputs.settings.matching);
        stages.push(run_stage(&ctx, spec.clone(), fields, items, progress).await);
    }

    // --- Report ---
    let mut report = PipelineReport {
        run_id: run_id.clone(),
        dry_run: false,
        model: gateway.model_id().to_string(),
        started_at,
        finished_at: Utc::now(),
        records: inputs.records.len(),
        stages,
        unprofiled,
        prompts_written: 0,
        interrupted: shutdown.is_triggered(),
        report_path: None,
    };

    report.report_path = Some(write_report(&config.output_dir, &report)?);
    let stats = serde_json::to_string(&report)
        .map_err(|e| MatflowError::Storage(format!("serialize run report: {e}")))?;
    storage.finish_run(&run_id, &stats).await?;

    info!(
        %run_id,
        failed = report.failed(),
        model_calls = report.model_calls(),
        interrupted = report.interrupted,
        "pipeline run finished"
    );
    progress.done(&report);
    Ok(report)
}

/// Render every prompt the run would send, without calling the model or
/// touching the manifest. Items already completed in an existing database
/// are left out.
async fn dry_run(
    config: &PipelineConfig,
    inputs: &PipelineInputs,
    model: &str,
    started_at: DateTime<Utc>,
    progress: &dyn ProgressReporter,
) -> Result<PipelineReport> {
    let db_path = database_path(&config.output_dir);
    let (cache, store) = if db_path.exists() {
        let storage = Arc::new(Storage::open_readonly(&db_path).await?);
        let cache = FingerprintCache::load(Arc::clone(&storage), "dry-run").await?;
        (Some(cache), Some(ArtifactStore::new(&config.output_dir, storage)))
    } else {
        (None, None)
    };

    let mut prompts_written = 0;
    let mut unprofiled = 0;
    let prompts_dir = config.output_dir.join("prompts");

    if config.stages.includes(Stage::Profile) {
        progress.phase("Rendering profile prompts");
        for item in profile_items(inputs, cache.as_ref())? {
            write_atomic(
                &prompts_dir.join(Stage::Profile.as_str()).join(format!("{}.txt", item.record_id)),
                item.prompt.as_bytes(),
            )?;
            prompts_written += 1;
        }
    }

    if let (Some(spec), Some(store)) = (&inputs.matching, &store) {
        progress.phase("Rendering matching prompts");
        let (items, skipped) = matching_items(inputs, spec, cache.as_ref(), store, true)?;
        unprofiled = skipped;
        for item in items {
            write_atomic(
                &prompts_dir.join(Stage::Matching.as_str()).join(format!("{}.txt", item.record_id)),
                item.prompt.as_bytes(),
            )?;
            prompts_written += 1;
        }
    } else if inputs.matching.is_some() {
        unprofiled = inputs.records.len();
    }

    info!(prompts_written, dir = %prompts_dir.display(), "dry run finished");
    let report = PipelineReport {
        run_id: "dry-run".into(),
        dry_run: true,
        model: model.to_string(),
        started_at,
        finished_at: Utc::now(),
        records: inputs.records.len(),
        stages: Vec::new(),
        unprofiled,
        prompts_written,
        interrupted: false,
        report_path: None,
    };
    progress.done(&report);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

fn base_vars(inputs: &PipelineInputs, record: &SourceRecord, stage: Stage) -> Result<TemplateVars> {
    let fields = serde_json::to_string_pretty(&record.fields)
        .map_err(|e| MatflowError::parse(format!("render record {}: {e}", record.id)))?;
    Ok(TemplateVars::new()
        .set("record_id", record.id.as_str())
        .set("record", fields)
        .set("context", inputs.context.as_str())
        .set("stage", stage.as_str()))
}

/// Stage-1 items. With a cache, completed items are left out.
fn profile_items(inputs: &PipelineInputs, cache: Option<&FingerprintCache>) -> Result<Vec<WorkItem>> {
    let spec = &inputs.profile;
    let mut items = Vec::with_capacity(inputs.records.len());
    for record in &inputs.records {
        let fingerprint = spec.fingerprint(record, None);
        if let Some(cache) = cache {
            if matches!(cache.lookup(&fingerprint), CacheStatus::Completed(_)) {
                continue;
            }
        }
        let prompt = spec
            .template
            .render(&base_vars(inputs, record, Stage::Profile)?)?;
        items.push(WorkItem {
            record_id: record.id.clone(),
            fingerprint,
            prompt,
            candidate_ids: Vec::new(),
        });
    }
    Ok(items)
}

/// Stage-2 items for every record with a completed profile, plus the number
/// of records left out for lack of one.
///
/// Candidates are the other profiled records in id order, capped at the
/// configured limit.
fn matching_items(
    inputs: &PipelineInputs,
    spec: &StageSpec,
    cache: Option<&FingerprintCache>,
    store: &ArtifactStore,
    skip_completed: bool,
) -> Result<(Vec<WorkItem>, usize)> {
    let Some(cache) = cache else {
        return Ok((Vec::new(), inputs.records.len()));
    };

    let mut eligible: Vec<(&SourceRecord, Fingerprint, Profile)> = Vec::new();
    let mut unprofiled = 0;
    for record in &inputs.records {
        let fp = inputs.profile.fingerprint(record, None);
        let artifact: ArtifactRef = match cache.lookup(&fp) {
            CacheStatus::Completed(artifact) => artifact,
            _ => {
                unprofiled += 1;
                continue;
            }
        };
        match store.read_profile(&artifact) {
            Ok(profile) => eligible.push((record, fp, profile)),
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "unreadable profile, not matching");
                unprofiled += 1;
            }
        }
    }
    eligible.sort_by(|a, b| a.0.id.cmp(&b.0.id));

    let limit = inputs.settings.matching.candidate_limit;
    let mut items = Vec::with_capacity(eligible.len());
    for (record, profile_fp, profile) in &eligible {
        let candidates: Vec<&(&SourceRecord, Fingerprint, Profile)> = eligible
            .iter()
            .filter(|(other, _, _)| other.id != record.id)
            .take(limit)
            .collect();

        let fingerprint = spec.fingerprint(record, Some(profile_fp));
        if skip_completed && matches!(cache.lookup(&fingerprint), CacheStatus::Completed(_)) {
            continue;
        }

        let candidate_docs: Vec<serde_json::Value> = candidates
            .iter()
            .map(|(c, _, p)| json!({"record_id": c.id, "profile": p.attributes}))
            .collect();
        let vars = base_vars(inputs, record, Stage::Matching)?
            .set("profile", pretty(&profile.attributes)?)
            .set("candidates", pretty(&serde_json::Value::Array(candidate_docs))?)
            .set("candidate_count", candidates.len().to_string());

        items.push(WorkItem {
            record_id: record.id.clone(),
            fingerprint,
            prompt: spec.template.render(&vars)?,
            candidate_ids: candidates.iter().map(|(c, _, _)| c.id.clone()).collect(),
        });
    }
    Ok((items, unprofiled))
}

fn pretty(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| MatflowError::parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Write a file atomically (temp file, then rename).
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| MatflowError::io(dir, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{name}.tmp"));
    std::fs::write(&temp, bytes).map_err(|e| MatflowError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| MatflowError::io(path, e))
}

fn write_report(output_dir: &Path, report: &PipelineReport) -> Result<PathBuf> {
    let path = output_dir
        .join("reports")
        .join(format!("run-{}.json", report.run_id));
    let bytes = serde_json::to_vec_pretty(report)
        .map_err(|e| MatflowError::Storage(format!("serialize run report: {e}")))?;
    write_atomic(&path, &bytes)?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Snapshot of an output directory, for `matflow status`.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub database: PathBuf,
    pub schema_version: u32,
    /// `(stage, status, count)` rows from the manifest.
    pub manifest: Vec<(String, String, u64)>,
    pub profiles: u64,
    pub matches: u64,
    /// `(record_id, stage, reason)` for every failed item.
    pub failures: Vec<(String, String, String)>,
    pub last_run: Option<LastRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Read-only summary of what an output directory holds.
pub async fn inspect_output(output_dir: &Path) -> Result<OutputStatus> {
    let database = database_path(output_dir);
    let storage = Storage::open_readonly(&database).await?;

    let (profiles, matches) = storage.document_counts().await?;
    let failures = storage
        .failed_items()
        .await?
        .into_iter()
        .map(|e| (e.record_id, e.stage.to_string(), e.reason.unwrap_or_default()))
        .collect();
    let last_run = storage.list_runs(1).await?.into_iter().next().map(|r| LastRun {
        id: r.id,
        started_at: r.started_at,
        finished_at: r.finished_at,
    });

    Ok(OutputStatus {
        schema_version: storage.schema_version().await,
        manifest: storage.manifest_counts().await?,
        profiles,
        matches,
        failures,
        last_run,
        database,
    })
}

/// Create (or migrate) the database for an output directory.
pub async fn init_database(output_dir: &Path) -> Result<PathBuf> {
    let path = database_path(output_dir);
    let storage = Storage::open(&path).await?;
    info!(path = %path.display(), version = storage.schema_version().await, "database ready");
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use matflow_gateway::ModelOutcome;
    use serde_json::json;

    use crate::inputs::tests::fixture_dir;
    use crate::runner::tests::{ScriptedGateway, record_of, success, valid_document};

    const CATALOG: &str = "name,city\nA,Aalst\nB,Ghent\nC,Genk\n";

    fn config(input: &Path, stages: StageSelection) -> PipelineConfig {
        PipelineConfig {
            input_dir: input.to_path_buf(),
            output_dir: input.join("out"),
            stages,
            concurrency: 2,
            limit: None,
            dry_run: false,
            call_timeout: Duration::from_secs(5),
            policy: RetryPolicy::immediate(3, 1),
        }
    }

    async fn run(config: &PipelineConfig, gateway: &Arc<ScriptedGateway>) -> PipelineReport {
        run_pipeline(config, gateway.clone(), ShutdownSignal::new(), &SilentProgress)
            .await
            .unwrap()
    }

    fn summary(report: &PipelineReport, stage: Stage) -> &StageSummary {
        report.stages.iter().find(|s| s.stage == stage).unwrap()
    }

    #[tokio::test]
    async fn full_run_writes_profiles_matches_and_report() {
        let dir = fixture_dir(CATALOG);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        let report = run(&config(&dir, StageSelection::All), &gateway).await;

        assert_eq!(summary(&report, Stage::Profile).completed, 3);
        assert_eq!(summary(&report, Stage::Matching).completed, 3);
        assert_eq!(report.model_calls(), 6);
        assert!(dir.join("out/profiles/A.json").exists());
        assert!(dir.join("out/matches/C.json").exists());
        assert!(report.report_path.as_ref().unwrap().exists());

        // Each subject sees the other two as candidates, never itself.
        let match_prompts: Vec<String> = gateway
            .prompts()
            .into_iter()
            .filter(|p| p.starts_with("Match "))
            .collect();
        assert_eq!(match_prompts.len(), 3);
        for prompt in &match_prompts {
            assert!(prompt.contains("against 2:"));
        }

        let status = inspect_output(&dir.join("out")).await.unwrap();
        assert_eq!((status.profiles, status.matches), (3, 3));
        assert!(status.failures.is_empty());
        assert_eq!(status.last_run.unwrap().id, report.run_id);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn second_run_makes_no_model_calls() {
        let dir = fixture_dir(CATALOG);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        let cfg = config(&dir, StageSelection::All);
        run(&cfg, &gateway).await;
        let first = gateway.calls();

        let again = run(&cfg, &gateway).await;
        assert_eq!(gateway.calls(), first);
        assert_eq!(summary(&again, Stage::Profile).skipped, 3);
        assert_eq!(summary(&again, Stage::Matching).skipped, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_profile_is_excluded_from_matching_then_resumed() {
        let dir = fixture_dir(CATALOG);
        let cfg = config(&dir, StageSelection::All);

        // B is refused on the first run.
        let refuse_b = Arc::new(ScriptedGateway::new(|prompt, _| {
            if prompt.starts_with("Profile B") {
                ModelOutcome::PermanentFailure("policy".into())
            } else {
                success(valid_document(prompt))
            }
        }));
        let report = run(&cfg, &refuse_b).await;
        assert_eq!(summary(&report, Stage::Profile).failed.len(), 1);
        assert_eq!(report.unprofiled, 1);
        let matching = summary(&report, Stage::Matching);
        assert_eq!(matching.total, 2);
        assert_eq!(matching.completed, 2);
        assert!(!dir.join("out/matches/B.json").exists());

        let status = inspect_output(&dir.join("out")).await.unwrap();
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].0, "B");

        // Second run: only B is new. A and C keep their matches, which
        // depend on their own profiles and not on the candidate pool.
        let healthy = Arc::new(ScriptedGateway::always_valid());
        let report = run(&cfg, &healthy).await;
        assert_eq!(summary(&report, Stage::Profile).completed, 1);
        assert_eq!(summary(&report, Stage::Profile).skipped, 2);
        assert_eq!(summary(&report, Stage::Matching).completed, 1);
        assert_eq!(summary(&report, Stage::Matching).skipped, 2);
        assert_eq!(healthy.calls(), 2);
        assert!(dir.join("out/matches/B.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn changed_record_recomputes_only_that_record() {
        let dir = fixture_dir(CATALOG);
        let cfg = config(&dir, StageSelection::Profile);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        run(&cfg, &gateway).await;
        assert_eq!(gateway.calls(), 3);

        std::fs::write(dir.join("catalog.csv"), "name,city\nA,Aalst\nB,Antwerp\nC,Genk\n").unwrap();
        let report = run(&cfg, &gateway).await;
        assert_eq!(gateway.calls(), 4);
        assert_eq!(summary(&report, Stage::Profile).completed, 1);
        assert_eq!(gateway.prompts().last().map(|p| record_of(p)), Some("B".to_string()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn prompt_version_bump_recomputes_everything() {
        let dir = fixture_dir(CATALOG);
        let cfg = config(&dir, StageSelection::Profile);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        run(&cfg, &gateway).await;

        let settings = std::fs::read_to_string(dir.join("pipeline.toml"))
            .unwrap()
            .replacen("[profile]\nprompt_version = \"1\"", "[profile]\nprompt_version = \"2\"", 1);
        std::fs::write(dir.join("pipeline.toml"), settings).unwrap();

        let report = run(&cfg, &gateway).await;
        assert_eq!(summary(&report, Stage::Profile).completed, 3);
        assert_eq!(gateway.calls(), 6);
        let profile: Profile =
            serde_json::from_slice(&std::fs::read(dir.join("out/profiles/A.json")).unwrap()).unwrap();
        assert_eq!(profile.prompt_version, "2");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn context_edit_recomputes_both_stages() {
        let dir = fixture_dir(CATALOG);
        let cfg = config(&dir, StageSelection::All);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        run(&cfg, &gateway).await;
        assert_eq!(gateway.calls(), 6);

        // Prompt versions stay pinned at "1"; only the reference text moves.
        std::fs::write(dir.join("notes.txt"), "Ghent harbour cluster\n").unwrap();
        let report = run(&cfg, &gateway).await;
        assert_eq!(summary(&report, Stage::Profile).completed, 3);
        assert_eq!(summary(&report, Stage::Profile).skipped, 0);
        assert_eq!(summary(&report, Stage::Matching).completed, 3);
        assert_eq!(gateway.calls(), 12);
        assert!(
            gateway
                .prompts()
                .iter()
                .rev()
                .take(6)
                .filter(|p| p.starts_with("Profile "))
                .all(|p| p.contains("Ghent harbour cluster"))
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn deleted_artifact_is_recomputed() {
        let dir = fixture_dir(CATALOG);
        let cfg = config(&dir, StageSelection::Profile);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        run(&cfg, &gateway).await;

        std::fs::remove_file(dir.join("out/profiles/C.json")).unwrap();
        let report = run(&cfg, &gateway).await;
        assert_eq!(summary(&report, Stage::Profile).completed, 1);
        assert_eq!(gateway.calls(), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_without_repeating_work() {
        let dir = fixture_dir(CATALOG);
        let mut cfg = config(&dir, StageSelection::Profile);
        cfg.concurrency = 1;

        // Shut down as soon as the first call comes back.
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        let gateway = Arc::new(ScriptedGateway::new(move |prompt, _| {
            trigger.trigger();
            success(valid_document(prompt))
        }));
        let report = run_pipeline(&cfg, gateway.clone(), shutdown, &SilentProgress)
            .await
            .unwrap();
        assert!(report.interrupted);
        let first = summary(&report, Stage::Profile);
        assert_eq!(first.completed, 1);
        assert_eq!(first.interrupted, 2);
        assert_eq!(gateway.calls(), 1);

        let healthy = Arc::new(ScriptedGateway::always_valid());
        let report = run(&cfg, &healthy).await;
        assert_eq!(summary(&report, Stage::Profile).completed, 2);
        assert_eq!(summary(&report, Stage::Profile).skipped, 1);

        let done: HashSet<String> = gateway
            .prompts()
            .iter()
            .chain(healthy.prompts().iter())
            .map(|p| record_of(p))
            .collect();
        assert_eq!(done.len(), 3);
        assert_eq!(gateway.calls() + healthy.calls(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn match_entries_are_indexed() {
        let dir = fixture_dir("name\nA\nB\n");
        let gateway = Arc::new(ScriptedGateway::new(|prompt, _| {
            if prompt.starts_with("Match A") {
                success(json!({"matches": [{"candidate_id": "B", "score": 0.8}]}))
            } else {
                success(valid_document(prompt))
            }
        }));
        run(&config(&dir, StageSelection::All), &gateway).await;

        let storage = Storage::open_readonly(&database_path(&dir.join("out"))).await.unwrap();
        let entries = storage.match_entries("A").await.unwrap();
        assert_eq!(entries, vec![(0, "B".to_string(), Some(0.8))]);

        let result: matflow_shared::MatchResult =
            serde_json::from_slice(&std::fs::read(dir.join("out/matches/A.json")).unwrap()).unwrap();
        assert_eq!(result.candidate_ids, vec!["B".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dry_run_writes_prompts_only() {
        let dir = fixture_dir(CATALOG);
        let mut cfg = config(&dir, StageSelection::All);
        cfg.dry_run = true;
        let gateway = Arc::new(ScriptedGateway::always_valid());

        let report = run(&cfg, &gateway).await;
        assert!(report.dry_run);
        assert_eq!(report.prompts_written, 3);
        assert_eq!(report.unprofiled, 3);
        assert_eq!(gateway.calls(), 0);
        assert!(!database_path(&dir.join("out")).exists());

        let prompt = std::fs::read_to_string(dir.join("out/prompts/profile/A.txt")).unwrap();
        assert!(prompt.starts_with("Profile A."));
        assert!(prompt.contains("Aalst industrial zone"));
        assert!(prompt.contains("\"city\": \"Aalst\""));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dry_run_after_real_run_renders_match_prompts() {
        let dir = fixture_dir(CATALOG);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        run(&config(&dir, StageSelection::Profile), &gateway).await;

        let mut cfg = config(&dir, StageSelection::All);
        cfg.dry_run = true;
        let report = run(&cfg, &gateway).await;
        assert_eq!(report.prompts_written, 3);
        assert_eq!(gateway.calls(), 3);
        let prompt = std::fs::read_to_string(dir.join("out/prompts/matching/B.txt")).unwrap();
        assert!(prompt.starts_with("Match B"));
        assert!(prompt.contains("\"record_id\": \"A\""));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn config_errors_abort_before_any_call() {
        let dir = fixture_dir(CATALOG);
        std::fs::write(dir.join("profile_prompt.txt"), "{{nope}}").unwrap();
        let gateway = Arc::new(ScriptedGateway::always_valid());
        let err = run_pipeline(&config(&dir, StageSelection::All), gateway.clone(), ShutdownSignal::new(), &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, MatflowError::Config { .. }));
        assert_eq!(gateway.calls(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn progress_sees_every_item() {
        struct Counting(Mutex<Vec<(Stage, String)>>);
        impl ProgressReporter for Counting {
            fn phase(&self, _name: &str) {}
            fn item_finished(&self, stage: Stage, id: &str, _: &ItemOutcome, _: usize, _: usize) {
                self.0.lock().unwrap().push((stage, id.to_string()));
            }
            fn done(&self, _report: &PipelineReport) {}
        }

        let dir = fixture_dir(CATALOG);
        let gateway = Arc::new(ScriptedGateway::always_valid());
        let counting = Counting(Mutex::new(Vec::new()));
        run_pipeline(&config(&dir, StageSelection::All), gateway, ShutdownSignal::new(), &counting)
            .await
            .unwrap();
        assert_eq!(counting.0.lock().unwrap().len(), 6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stage_selection_parses() {
        assert_eq!("all".parse::<StageSelection>().unwrap(), StageSelection::All);
        assert_eq!("match".parse::<StageSelection>().unwrap(), StageSelection::Matching);
        assert!(StageSelection::Profile.includes(Stage::Profile));
        assert!(!StageSelection::Profile.includes(Stage::Matching));
        assert!("both".parse::<StageSelection>().is_err());
    }
}
