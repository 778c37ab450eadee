//! Stage runner: drives every work item of one stage through
//! cache check, model call, validation, correction, backoff and persist.
//!
//! Each item is an independent bounded state machine. Items run on spawned
//! tasks behind a semaphore, so at most `concurrency` of them talk to the
//! gateway at once. One item failing never stops the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use matflow_gateway::{ModelGateway, ModelOutcome, ModelResponse};
use matflow_schema::{ValidationOutcome, Violation, validate};
use matflow_shared::{
    ArtifactRef, Fingerprint, MatchEntry, MatchResult, MatflowError, Profile, Stage,
};
use matflow_storage::ArtifactStore;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::inputs::{MatchingSettings, StageSpec};
use crate::manifest::{CacheStatus, FingerprintCache};
use crate::pipeline::ProgressReporter;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<ArtifactStore>,
    pub cache: Arc<FingerprintCache>,
    pub gateway: Arc<dyn ModelGateway>,
    pub policy: RetryPolicy,
    pub shutdown: ShutdownSignal,
    pub concurrency: usize,
    /// Per-call timeout handed to the gateway.
    pub call_timeout: Duration,
}

/// One unit of work: a record, its fingerprint, and its rendered prompt.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub record_id: String,
    pub fingerprint: Fingerprint,
    pub prompt: String,
    /// Candidates offered to the model (matching stage only).
    pub candidate_ids: Vec<String>,
}

/// Where the matching stage finds its entries inside the model document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFields {
    pub list: String,
    pub candidate: String,
    pub score: String,
    pub category: String,
}

impl MatchFields {
    pub fn from_settings(settings: &MatchingSettings) -> Self {
        Self {
            list: settings.list_field.clone(),
            candidate: settings.candidate_field.clone(),
            score: settings.score_field.clone(),
            category: settings.category_field.clone(),
        }
    }
}

impl Default for MatchFields {
    fn default() -> Self {
        Self::from_settings(&MatchingSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why an item ended in the failed state.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Still invalid after every corrective re-prompt.
    Validation(Vec<Violation>),
    /// Rate limits or transient errors used up the attempt budget.
    TransientExhausted { attempts: u32, last_cause: String },
    /// The provider refused in a way retrying cannot fix.
    Permanent(String),
    /// A valid result could not be persisted.
    Storage(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(violations) => {
                write!(f, "schema validation failed: ")?;
                let listed: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", listed.join("; "))
            }
            Self::TransientExhausted {
                attempts,
                last_cause,
            } => write!(f, "gave up after {attempts} attempts: {last_cause}"),
            Self::Permanent(cause) => write!(f, "permanent model failure: {cause}"),
            Self::Storage(cause) => write!(f, "storage failure: {cause}"),
        }
    }
}

/// Final state of one item in this run.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed(ArtifactRef),
    /// Already completed under the same fingerprint, or claimed elsewhere.
    Skipped,
    Failed(FailureReason),
    /// Shutdown was requested before the item finished.
    Interrupted,
}

/// An item that failed, with its reason rendered for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub record_id: String,
    pub reason: String,
}

/// Counts for one stage of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub interrupted: usize,
    pub failed: Vec<FailedItem>,
    pub model_calls: u32,
}

impl StageSummary {
    pub fn new(stage: Stage, total: usize) -> Self {
        Self {
            stage,
            total,
            completed: 0,
            skipped: 0,
            interrupted: 0,
            failed: Vec::new(),
            model_calls: 0,
        }
    }

    fn record(&mut self, record_id: &str, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed(_) => self.completed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Interrupted => self.interrupted += 1,
            ItemOutcome::Failed(reason) => self.failed.push(FailedItem {
                record_id: record_id.to_string(),
                reason: reason.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage loop
// ---------------------------------------------------------------------------

struct StageShared {
    spec: StageSpec,
    fields: MatchFields,
}

/// Run every item of one stage and wait for all of them.
#[instrument(skip_all, fields(stage = %spec.stage, items = items.len()))]
pub async fn run_stage(
    ctx: &RunContext,
    spec: StageSpec,
    fields: MatchFields,
    items: Vec<WorkItem>,
    progress: &dyn ProgressReporter,
) -> StageSummary {
    let stage = spec.stage;
    let total = items.len();
    let mut summary = StageSummary::new(stage, total);
    let shared = Arc::new(StageShared { spec, fields });
    let semaphore = Arc::new(Semaphore::new(ctx.concurrency.max(1)));

    info!(concurrency = ctx.concurrency, "stage started");

    let mut handles = Vec::with_capacity(total);
    for item in items {
        let ctx = ctx.clone();
        let shared = Arc::clone(&shared);
        let sem = Arc::clone(&semaphore);
        let record_id = item.record_id.clone();

        handles.push((
            record_id,
            tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = ctx.shutdown.wait() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (ItemOutcome::Interrupted, 0);
                };
                if ctx.shutdown.is_triggered() {
                    return (ItemOutcome::Interrupted, 0);
                }
                process_item(&ctx, &shared, item).await
            }),
        ));
    }

    for (done, (record_id, handle)) in handles.into_iter().enumerate() {
        let (outcome, calls) = match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(%record_id, error = %e, "worker task failed");
                (
                    ItemOutcome::Failed(FailureReason::Permanent(format!("worker task failed: {e}"))),
                    0,
                )
            }
        };
        summary.model_calls += calls;
        summary.record(&record_id, &outcome);
        progress.item_finished(stage, &record_id, &outcome, done + 1, total);
    }

    info!(
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        interrupted = summary.interrupted,
        model_calls = summary.model_calls,
        "stage finished"
    );
    summary
}

// ---------------------------------------------------------------------------
// Per-item state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AttemptState {
    transient_failures: u32,
    corrective_attempts: u32,
    last_violations: Vec<Violation>,
    calls: u32,
}

/// Drive one item to a terminal state. Returns the outcome and the number
/// of gateway calls it made.
async fn process_item(ctx: &RunContext, shared: &StageShared, item: WorkItem) -> (ItemOutcome, u32) {
    let stage = shared.spec.stage;
    let fp = &item.fingerprint;

    match ctx.cache.lookup(fp) {
        CacheStatus::Absent => {}
        CacheStatus::Completed(_) => {
            debug!(%stage, record_id = %item.record_id, "already completed");
            return (ItemOutcome::Skipped, 0);
        }
        other => {
            debug!(%stage, record_id = %item.record_id, ?other, "fingerprint already claimed");
            return (ItemOutcome::Skipped, 0);
        }
    }

    match ctx.cache.mark_in_flight(fp, stage, &item.record_id).await {
        Ok(()) => {}
        Err(MatflowError::ManifestConflict { .. }) => return (ItemOutcome::Skipped, 0),
        Err(e) => {
            warn!(%stage, record_id = %item.record_id, error = %e, "could not claim item");
            return (ItemOutcome::Failed(FailureReason::Storage(e.to_string())), 0);
        }
    }

    let mut state = AttemptState::default();
    let outcome = attempt_loop(ctx, shared, &item, &mut state).await;

    match &outcome {
        ItemOutcome::Completed(artifact) => {
            info!(%stage, record_id = %item.record_id, fingerprint = fp.short(), path = %artifact.path.display(), calls = state.calls, "item completed");
        }
        ItemOutcome::Failed(reason) => {
            warn!(
                %stage,
                record_id = %item.record_id,
                fingerprint = fp.short(),
                %reason,
                calls = state.calls,
                corrected = state.last_violations.len(),
                "item failed"
            );
            if let Err(e) = ctx.cache.mark_failed(fp, &reason.to_string()).await {
                warn!(record_id = %item.record_id, error = %e, "could not record failure");
            }
        }
        ItemOutcome::Interrupted => {
            info!(%stage, record_id = %item.record_id, "item interrupted");
            if let Err(e) = ctx.cache.release(fp).await {
                warn!(record_id = %item.record_id, error = %e, "could not release item");
            }
        }
        ItemOutcome::Skipped => {}
    }

    (outcome, state.calls)
}

async fn attempt_loop(
    ctx: &RunContext,
    shared: &StageShared,
    item: &WorkItem,
    state: &mut AttemptState,
) -> ItemOutcome {
    let contract = &shared.spec.contract;
    let mut prompt = item.prompt.clone();

    loop {
        if ctx.shutdown.is_triggered() {
            return ItemOutcome::Interrupted;
        }

        state.calls += 1;
        let hint = match ctx.gateway.complete(&prompt, contract, ctx.call_timeout).await {
            ModelOutcome::Success(response) => match check_document(&response.document, shared) {
                ValidationOutcome::Valid => return persist(ctx, shared, item, response).await,
                ValidationOutcome::Invalid(violations) => {
                    if state.corrective_attempts >= ctx.policy.corrective_attempts {
                        return ItemOutcome::Failed(FailureReason::Validation(violations));
                    }
                    state.corrective_attempts += 1;
                    debug!(
                        record_id = %item.record_id,
                        violations = violations.len(),
                        attempt = state.corrective_attempts,
                        "re-prompting with violations"
                    );
                    prompt = corrective_prompt(&item.prompt, &violations);
                    state.last_violations = violations;
                    continue;
                }
            },
            ModelOutcome::PermanentFailure(cause) => {
                return ItemOutcome::Failed(FailureReason::Permanent(cause));
            }
            ModelOutcome::RateLimited { retry_after } => {
                state.transient_failures += 1;
                if state.transient_failures >= ctx.policy.max_attempts {
                    return ItemOutcome::Failed(FailureReason::TransientExhausted {
                        attempts: state.transient_failures,
                        last_cause: "rate limited".into(),
                    });
                }
                retry_after
            }
            ModelOutcome::TransientFailure(cause) => {
                state.transient_failures += 1;
                if state.transient_failures >= ctx.policy.max_attempts {
                    return ItemOutcome::Failed(FailureReason::TransientExhausted {
                        attempts: state.transient_failures,
                        last_cause: cause,
                    });
                }
                None
            }
        };

        let delay = ctx.policy.delay_for(state.transient_failures, hint);
        debug!(record_id = %item.record_id, delay_ms = delay.as_millis() as u64, failures = state.transient_failures, "backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.shutdown.wait() => return ItemOutcome::Interrupted,
        }
    }
}

/// Stage documents must be JSON objects before the schema even applies.
fn check_document(document: &Value, shared: &StageShared) -> ValidationOutcome {
    if !document.is_object() {
        return ValidationOutcome::Invalid(vec![Violation {
            path: "$".into(),
            constraint: "type".into(),
            expected: "a JSON object".into(),
        }]);
    }
    validate(document, &shared.spec.contract)
}

/// The original prompt plus a precise list of what was wrong.
pub fn corrective_prompt(base: &str, violations: &[Violation]) -> String {
    let mut prompt = String::with_capacity(base.len() + 256);
    prompt.push_str(base);
    prompt.push_str(
        "\n\nYour previous response did not match the required JSON schema. \
         Fix these problems and return the complete corrected JSON document:\n",
    );
    for violation in violations {
        prompt.push_str("- ");
        prompt.push_str(&violation.to_string());
        prompt.push('\n');
    }
    prompt
}

// ---------------------------------------------------------------------------
// Persist
// ---------------------------------------------------------------------------

async fn persist(
    ctx: &RunContext,
    shared: &StageShared,
    item: &WorkItem,
    response: ModelResponse,
) -> ItemOutcome {
    let spec = &shared.spec;
    let mut failures = 0u32;

    let artifact = loop {
        let written = match spec.stage {
            Stage::Profile => ctx.store.write_profile(&build_profile(spec, item, &response)).await,
            Stage::Matching => {
                ctx.store
                    .write_match(&build_match(spec, &shared.fields, item, &response))
                    .await
            }
        };
        match written {
            Ok(artifact) => break artifact,
            Err(e) => {
                failures += 1;
                warn!(record_id = %item.record_id, error = %e, attempt = failures, "persist attempt failed");
                if failures >= ctx.policy.storage_attempts {
                    return ItemOutcome::Failed(FailureReason::Storage(format!(
                        "{e} (after {failures} attempts)"
                    )));
                }
                // Not interruptible: a validated result is worth finishing.
                tokio::time::sleep(ctx.policy.delay_for(failures, None)).await;
            }
        }
    };

    // The document is committed from here on, so the item is never failed.
    let mut failures = 0u32;
    loop {
        match ctx.cache.mark_completed(&item.fingerprint, artifact.clone()).await {
            Ok(()) => return ItemOutcome::Completed(artifact),
            Err(e) => {
                failures += 1;
                if failures >= ctx.policy.storage_attempts {
                    // The row stays in flight, which the next run treats as absent.
                    warn!(record_id = %item.record_id, error = %e, "manifest not updated, artifact will be regenerated next run");
                    return ItemOutcome::Completed(artifact);
                }
                warn!(record_id = %item.record_id, error = %e, attempt = failures, "manifest update failed, retrying");
                tokio::time::sleep(ctx.policy.delay_for(failures, None)).await;
            }
        }
    }
}

fn build_profile(spec: &StageSpec, item: &WorkItem, response: &ModelResponse) -> Profile {
    Profile {
        record_id: item.record_id.clone(),
        schema_version: spec.contract.version.clone(),
        prompt_version: spec.prompt_version.clone(),
        fingerprint: item.fingerprint.clone(),
        attributes: response.document.clone(),
        generated_at: Utc::now(),
        call_id: response.call_id.clone(),
        model: response.model.clone(),
    }
}

fn build_match(
    spec: &StageSpec,
    fields: &MatchFields,
    item: &WorkItem,
    response: &ModelResponse,
) -> MatchResult {
    MatchResult {
        subject_id: item.record_id.clone(),
        candidate_ids: item.candidate_ids.clone(),
        schema_version: spec.contract.version.clone(),
        prompt_version: spec.prompt_version.clone(),
        fingerprint: item.fingerprint.clone(),
        entries: match_entries(&response.document, fields),
        document: response.document.clone(),
        generated_at: Utc::now(),
        call_id: response.call_id.clone(),
        model: response.model.clone(),
    }
}

/// Pull normalized entries out of a match document. Entries without a
/// candidate id are kept in the document but not indexed.
pub fn match_entries(document: &Value, fields: &MatchFields) -> Vec<MatchEntry> {
    let Some(list) = document.get(&fields.list).and_then(Value::as_array) else {
        return Vec::new();
    };

    list.iter()
        .enumerate()
        .filter_map(|(ordinal, entry)| {
            let candidate_id = match entry.get(&fields.candidate)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(MatchEntry {
                ordinal,
                candidate_id,
                score: entry.get(&fields.score).and_then(Value::as_f64),
                category: entry
                    .get(&fields.category)
                    .and_then(Value::as_str)
                    .map(String::from),
                entry: entry.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
