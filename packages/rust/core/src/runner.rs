//! Pipeline runner: schedules bills across a bounded worker pool and runs
//! each bill's stages in order, consulting the state tracker before every
//! stage function.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use legisflow_artifacts::ArtifactStore;
use legisflow_convert::Converter;
use legisflow_shared::{
    ArtifactRef, BillId, ErrorCategory, Fingerprint, LegisflowError, Result, SessionId, Stage,
    StageError, StageStatus, sha256_hex,
};
use legisflow_source::{BillDocuments, BillListing, Document, DocumentSource, dedup_crossfiles};
use legisflow_storage::StateTracker;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::fingerprint::{AmendmentInput, StageInputs, TextSource};
use crate::model::ModelClient;
use crate::stages::{
    self, AMEND_PROMPT_VERSION, Agency, QA_PROMPT_VERSION, QaInput, StageOutput, agencies_hash,
};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Trait for reporting run progress to the UI.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when every bill is scheduled.
    fn bills_listed(&self, total: usize);
    /// Called when one stage of a bill reaches an outcome.
    fn stage_finished(&self, bill: &BillId, stage: Stage, outcome: &StageOutcome);
    /// Called when a bill's stage chain is finished.
    fn bill_finished(&self, bill: &BillId, completed: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn bills_listed(&self, _total: usize) {}
    fn stage_finished(&self, _bill: &BillId, _stage: Stage, _outcome: &StageOutcome) {}
    fn bill_finished(&self, _bill: &BillId, _completed: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Per-invocation settings, merged from CLI flags and config.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub session: SessionId,
    /// Process at most this many bills (after dedup, in bill-number order).
    pub debug_cap: Option<usize>,
    /// Re-run succeeded stages irrespective of fingerprint.
    pub force: bool,
    /// Bills processed concurrently.
    pub workers: usize,
    /// Agencies to rate relevance against; empty disables the second qa call.
    pub agencies: Vec<Agency>,
}

/// Model used by each model-calling stage.
#[derive(Clone)]
pub struct StageModels {
    pub amend: Arc<dyn ModelClient>,
    pub qa: Arc<dyn ModelClient>,
}

/// What happened to one stage of one bill in this run.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded,
    /// Fingerprint matched a previous success; the stage function was not called.
    Skipped,
    NotApplicable,
    Failed(StageError),
    /// An upstream stage failed; nothing was recorded.
    Blocked,
}

/// Per-stage tallies for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub succeeded: usize,
    pub skipped: usize,
    pub not_applicable: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StageCounts {
    fn add(&mut self, outcome: &StageOutcome) {
        match outcome {
            StageOutcome::Succeeded => self.succeeded += 1,
            StageOutcome::Skipped => self.skipped += 1,
            StageOutcome::NotApplicable => self.not_applicable += 1,
            StageOutcome::Failed(_) => self.failed += 1,
            StageOutcome::Blocked => self.blocked += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedStage {
    pub bill: BillId,
    pub stage: Stage,
    pub category: ErrorCategory,
    pub message: String,
}

/// A listed bill that could not be scheduled at all.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedListing {
    pub number: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session: SessionId,
    pub bills: usize,
    pub stages: BTreeMap<Stage, StageCounts>,
    /// Sorted by bill, then stage.
    pub failures: Vec<FailedStage>,
    /// Listings whose bill number was unusable; no stage ran for them.
    pub rejected: Vec<RejectedListing>,
    /// Stage functions actually called.
    pub invocations: u32,
    /// Successful model calls made by stage functions that succeeded.
    pub model_calls: u32,
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            bills: 0,
            stages: Stage::ALL.iter().map(|s| (*s, StageCounts::default())).collect(),
            failures: Vec::new(),
            rejected: Vec::new(),
            invocations: 0,
            model_calls: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    fn absorb(&mut self, report: BillReport) {
        self.bills += 1;
        self.invocations += report.invocations;
        self.model_calls += report.model_calls;
        for (stage, outcome) in report.outcomes {
            self.stages.entry(stage).or_default().add(&outcome);
            if let StageOutcome::Failed(err) = outcome {
                self.failures.push(FailedStage {
                    bill: report.bill.clone(),
                    stage,
                    category: err.category,
                    message: err.message,
                });
            }
        }
    }
}

/// What one worker did for one bill.
#[derive(Debug)]
struct BillReport {
    bill: BillId,
    outcomes: Vec<(Stage, StageOutcome)>,
    invocations: u32,
    model_calls: u32,
}

/// A stage's current output, loaded for the next stage.
struct StageText {
    artifact: ArtifactRef,
    text: String,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Owns the pipeline state for a session while a run is in progress.
#[derive(Clone)]
pub struct PipelineRunner {
    source: Arc<dyn DocumentSource>,
    converter: Arc<dyn Converter>,
    models: StageModels,
    tracker: Arc<dyn StateTracker>,
    store: ArtifactStore,
}

impl PipelineRunner {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        converter: Arc<dyn Converter>,
        models: StageModels,
        tracker: Arc<dyn StateTracker>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            source,
            converter,
            models,
            tracker,
            store,
        }
    }

    /// Run every stage for every bill of `config.session`.
    ///
    /// Per-bill failures are recorded and reported in the summary. Errors
    /// returned from here are fatal: the listing could not be fetched, or
    /// state/artifact storage failed.
    #[instrument(skip_all, fields(session = %config.session, source = self.source.name()))]
    pub async fn run(
        &self,
        config: &RunConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        info!(tracker = self.tracker.backend(), force = config.force, "starting run");

        progress.phase("Listing bills");
        let listed = self.source.list_bills(&config.session).await?;
        let listed_count = listed.len();
        let mut bills = dedup_crossfiles(listed);
        if let Some(cap) = config.debug_cap {
            bills.truncate(cap);
        }
        info!(listed = listed_count, scheduled = bills.len(), "bills scheduled");
        progress.bills_listed(bills.len());

        progress.phase("Processing bills");
        let agencies: Arc<[Agency]> = config.agencies.clone().into();
        let total = bills.len();
        let workers = config.workers.max(1);
        let mut summary = RunSummary::new(config.session.clone());
        let mut pending = bills.into_iter();
        let mut set: JoinSet<Result<BillReport>> = JoinSet::new();

        loop {
            while set.len() < workers {
                let Some(listing) = pending.next() else { break };
                let bill = match BillId::new(config.session.clone(), &listing.metadata.number) {
                    Ok(bill) => bill,
                    Err(e) => {
                        warn!(number = %listing.metadata.number, error = %e, "skipping unusable listing");
                        summary.rejected.push(RejectedListing {
                            number: listing.metadata.number.clone(),
                            category: e.category(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                let worker = BillWorker {
                    runner: self.clone(),
                    bill,
                    listing,
                    force: config.force,
                    agencies: Arc::clone(&agencies),
                    progress: Arc::clone(&progress),
                };
                set.spawn(worker.run());
            }

            let Some(joined) = set.join_next().await else { break };
            let report = match joined {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    error!(error = %e, "aborting run");
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    set.abort_all();
                    return Err(LegisflowError::Storage(format!("bill worker failed: {e}")));
                }
            };
            let bill = report.bill.clone();
            summary.absorb(report);
            progress.bill_finished(&bill, summary.bills, total);
        }

        summary.failures.sort_by(|a, b| {
            (a.bill.number.as_str(), a.stage).cmp(&(b.bill.number.as_str(), b.stage))
        });
        summary.elapsed = start.elapsed();
        info!(
            bills = summary.bills,
            invocations = summary.invocations,
            failures = summary.failures.len(),
            rejected = summary.rejected.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run complete"
        );
        progress.done(&summary);
        Ok(summary)
    }
}

/// Runs one bill's full stage chain.
struct BillWorker {
    runner: PipelineRunner,
    bill: BillId,
    listing: BillListing,
    force: bool,
    agencies: Arc<[Agency]>,
    progress: Arc<dyn ProgressReporter>,
}

impl BillWorker {
    #[instrument(skip_all, fields(bill = %self.bill))]
    async fn run(self) -> Result<BillReport> {
        let mut report = BillReport {
            bill: self.bill.clone(),
            outcomes: Vec::with_capacity(Stage::ALL.len()),
            invocations: 0,
            model_calls: 0,
        };
        let tracker = &self.runner.tracker;
        tracker.upsert_bill(&self.bill, &self.listing.metadata).await?;

        let documents = match self
            .runner
            .source
            .fetch_documents(&self.bill.session, &self.listing)
            .await
        {
            Ok(documents) => documents,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let fingerprint = StageInputs::Unavailable {
                    stage: Stage::Convert,
                    reference: self.listing.document.clone(),
                }
                .fingerprint();
                self.fail(&mut report, Stage::Convert, &fingerprint, &e).await?;
                self.block(&mut report, Stage::Convert);
                return Ok(report);
            }
        };

        // --- convert ---
        let Some(converted) = self.convert(&mut report, &documents).await? else {
            return Ok(report);
        };

        // --- amend ---
        let Some((current, source)) = self.amend(&mut report, &documents, converted).await? else {
            return Ok(report);
        };

        // --- qa ---
        self.qa(&mut report, &documents, &current, source).await?;
        Ok(report)
    }

    async fn convert(
        &self,
        report: &mut BillReport,
        documents: &BillDocuments,
    ) -> Result<Option<StageText>> {
        let converter = &*self.runner.converter;
        let inputs = StageInputs::Convert {
            converter: converter.id().to_string(),
            media_type: documents.bill.media_type,
            document_hash: sha256_hex(&documents.bill.bytes),
        };
        let fingerprint = inputs.fingerprint();

        let execute = async {
            self.store_raw(Stage::Convert, &documents.bill)?;
            stages::convert_bill(converter, &documents.bill)
        };
        let converted = self.run_stage(report, Stage::Convert, &fingerprint, execute).await?;
        if converted.is_none() {
            self.block(report, Stage::Convert);
        }
        Ok(converted)
    }

    /// Returns the most current text for qa, or `None` when amend failed.
    async fn amend(
        &self,
        report: &mut BillReport,
        documents: &BillDocuments,
        converted: StageText,
    ) -> Result<Option<(StageText, TextSource)>> {
        let adopted = documents.adopted_amendments();

        if adopted.is_empty() {
            let fingerprint = StageInputs::NotApplicable {
                stage: Stage::Amend,
                upstream_hash: converted.artifact.content_hash.clone(),
            }
            .fingerprint();
            let tracker = &self.runner.tracker;
            if tracker.needs_run(&self.bill, Stage::Amend, &fingerprint).await? {
                tracker
                    .record_not_applicable(&self.bill, Stage::Amend, &fingerprint)
                    .await?;
                debug!("amend not applicable: no adopted amendments");
            }
            self.outcome(report, Stage::Amend, StageOutcome::NotApplicable);
            return Ok(Some((converted, TextSource::Original)));
        }

        let model = &*self.runner.models.amend;
        let converter = &*self.runner.converter;
        let inputs = StageInputs::Amend {
            base_text_hash: converted.artifact.content_hash.clone(),
            amendments: adopted
                .iter()
                .map(|a| AmendmentInput {
                    id: a.meta.id.clone(),
                    sequence: a.meta.sequence,
                    document_hash: sha256_hex(&a.document.bytes),
                })
                .collect(),
            converter: converter.id().to_string(),
            model: model.spec().clone(),
            prompt_version: AMEND_PROMPT_VERSION,
        };
        let fingerprint = inputs.fingerprint();

        let execute = async {
            for amendment in &adopted {
                self.store_raw(Stage::Amend, &amendment.document)?;
            }
            stages::apply_amendments(converter, model, &converted.text, &adopted).await
        };
        match self.run_stage(report, Stage::Amend, &fingerprint, execute).await? {
            Some(amended) => Ok(Some((amended, TextSource::Amended))),
            None => {
                self.block(report, Stage::Amend);
                Ok(None)
            }
        }
    }

    async fn qa(
        &self,
        report: &mut BillReport,
        documents: &BillDocuments,
        current: &StageText,
        text_source: TextSource,
    ) -> Result<()> {
        let model = &*self.runner.models.qa;
        let converter = &*self.runner.converter;
        let inputs = StageInputs::Qa {
            text_hash: current.artifact.content_hash.clone(),
            text_source,
            fiscal_note_hash: documents.fiscal_note.as_ref().map(|d| sha256_hex(&d.bytes)),
            converter: converter.id().to_string(),
            model: model.spec().clone(),
            prompt_version: QA_PROMPT_VERSION,
            agencies_hash: agencies_hash(&self.agencies),
        };
        let fingerprint = inputs.fingerprint();

        let execute = async {
            let fiscal_note = match &documents.fiscal_note {
                Some(document) => {
                    self.store_raw(Stage::Qa, document)?;
                    Some(
                        converter
                            .convert(&document.bytes, document.media_type)
                            .map_err(|e| match e {
                                LegisflowError::Conversion(msg) => {
                                    LegisflowError::Conversion(format!("fiscal note: {msg}"))
                                }
                                other => other,
                            })?,
                    )
                }
                None => None,
            };
            let input = QaInput {
                metadata: &self.listing.metadata,
                text: &current.text,
                fiscal_note: fiscal_note.as_deref(),
                agencies: &self.agencies,
            };
            stages::answer_questions(model, &input).await
        };
        self.run_stage(report, Stage::Qa, &fingerprint, execute).await?;
        Ok(())
    }

    /// Skip or execute one stage. `execute` is only polled when the tracker
    /// says the stage must run (or `force` is set).
    ///
    /// Returns the stage's current output, or `None` when the stage failed.
    async fn run_stage<F>(
        &self,
        report: &mut BillReport,
        stage: Stage,
        fingerprint: &Fingerprint,
        execute: F,
    ) -> Result<Option<StageText>>
    where
        F: Future<Output = Result<StageOutput>>,
    {
        let tracker = &self.runner.tracker;
        let store = &self.runner.store;

        if !self.force && !tracker.needs_run(&self.bill, stage, fingerprint).await? {
            let record = tracker.get(&self.bill, stage).await?;
            let artifact = record
                .filter(|r| r.status == StageStatus::Succeeded)
                .and_then(|r| r.artifact);
            if let Some(artifact) = artifact {
                match store.read_text(&artifact) {
                    Ok(text) => {
                        debug!(%stage, fingerprint = fingerprint.short(), "inputs unchanged, skipping");
                        self.outcome(report, stage, StageOutcome::Skipped);
                        return Ok(Some(StageText { artifact, text }));
                    }
                    Err(e) => {
                        warn!(%stage, error = %e, "stored artifact unreadable, re-running stage");
                    }
                }
            }
        }

        report.invocations += 1;
        match execute.await {
            Ok(output) => {
                let artifact =
                    store.put(&self.bill, stage, output.kind, fingerprint, &output.content)?;
                tracker
                    .record_success(&self.bill, stage, fingerprint, &artifact)
                    .await?;
                report.model_calls += output.model_calls;
                info!(%stage, artifact = %artifact.path, "stage succeeded");
                self.outcome(report, stage, StageOutcome::Succeeded);
                let text = String::from_utf8(output.content).map_err(|_| {
                    LegisflowError::Storage(format!("artifact {} is not valid UTF-8", artifact.path))
                })?;
                Ok(Some(StageText { artifact, text }))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.fail(report, stage, fingerprint, &e).await?;
                Ok(None)
            }
        }
    }

    /// Record a non-fatal failure of `stage`.
    async fn fail(
        &self,
        report: &mut BillReport,
        stage: Stage,
        fingerprint: &Fingerprint,
        err: &LegisflowError,
    ) -> Result<()> {
        warn!(%stage, category = %err.category(), error = %err, "stage failed");
        let error = StageError::from(err);
        self.runner
            .tracker
            .record_failure(&self.bill, stage, fingerprint, &error)
            .await?;
        self.outcome(report, stage, StageOutcome::Failed(error));
        Ok(())
    }

    fn block(&self, report: &mut BillReport, failed: Stage) {
        for stage in failed.downstream() {
            self.outcome(report, *stage, StageOutcome::Blocked);
        }
    }

    fn outcome(&self, report: &mut BillReport, stage: Stage, outcome: StageOutcome) {
        self.progress.stage_finished(&self.bill, stage, &outcome);
        report.outcomes.push((stage, outcome));
    }

    /// Keep the raw upstream document next to its derived artifacts.
    fn store_raw(&self, stage: Stage, document: &Document) -> Result<ArtifactRef> {
        let hash = Fingerprint::new(sha256_hex(&document.bytes));
        self.runner.store.put(
            &self.bill,
            stage,
            document.media_type.raw_kind(),
            &hash,
            &document.bytes,
        )
    }
}
