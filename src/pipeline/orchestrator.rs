//! Pipeline orchestrator.
//!
//! Single entry point that drives one document through the six stages:
//! prepare → analyze → enhance → infer rules → select schema → score.
//!
//! Uses trait-based DI for every stage and both external services so the
//! orchestrator stays fully testable with mock implementations. Failure
//! handling is driven by the [`StagePolicyTable`]: fatal failures abort the
//! run, recoverable ones substitute a fallback and continue. The caller
//! always receives a [`PipelineResult`], never an `Err` or a panic.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use super::confidence::{ConfidenceAggregator, ConfidenceReport};
use super::enhancer::StandardFieldEnhancer;
use super::error::{AiAnalysisError, ConfidenceScoringError, PipelineError};
use super::retry::{RetryAnalysisStrategy, RetryPlan};
use super::rules::ValidationRuleInferenceEngine;
use super::selector::SchemaFieldSelector;
use super::stage::{CancellationToken, PipelineStage, StagePolicy, StagePolicyTable};
use super::trace::{metrics, PipelineTrace, StageRecord};
use super::types::{
    AnalysisService, ConfidenceScorer, DocumentService, FieldEnhancer, PreparedDocument,
    RawExtraction, RawField, RuleInferencer, RuleSet, SchemaBuilder,
};
use crate::models::{AnalysisRun, SchemaDraft, TypeCandidate};
use crate::pipeline_config::PipelineConfig;

// ---------------------------------------------------------------------------
// Options and result
// ---------------------------------------------------------------------------

/// Per-run options. Unset values fall back to the pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub type_hint: Option<String>,
    /// Merged into the prepared document's metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub threshold: Option<f64>,
    pub include_low_confidence: Option<bool>,
    pub cancellation: CancellationToken,
}

/// Everything one pipeline run produced, including partial output of an
/// aborted run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub document_id: Option<Uuid>,
    pub document: Option<PreparedDocument>,
    pub analysis: Option<AnalysisRun>,
    pub rules: RuleSet,
    pub schema: Option<SchemaDraft>,
    pub confidence: Option<ConfidenceReport>,
    pub recommendations: Vec<String>,
    pub errors: Vec<String>,
    pub trace: PipelineTrace,
}

enum StageInput {
    Raw { bytes: Vec<u8>, filename: String },
    Prepared(PreparedDocument),
}

impl StageInput {
    fn filename(&self) -> &str {
        match self {
            Self::Raw { filename, .. } => filename,
            Self::Prepared(doc) => &doc.filename,
        }
    }
}

/// Stage bookkeeping shared by all stages of one run.
#[derive(Default)]
struct StageLog {
    trace: PipelineTrace,
    errors: Vec<String>,
    current: Option<(PipelineStage, Instant)>,
}

#[derive(Default)]
struct RunState {
    log: StageLog,
    prepared: Option<PreparedDocument>,
    run: Option<AnalysisRun>,
    rules: RuleSet,
    schema: Option<SchemaDraft>,
    confidence: Option<ConfidenceReport>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct PipelineOrchestrator {
    document_service: Arc<dyn DocumentService>,
    analysis_service: Arc<dyn AnalysisService>,
    enhancer: Box<dyn FieldEnhancer>,
    rule_engine: Box<dyn RuleInferencer>,
    schema_builder: Box<dyn SchemaBuilder>,
    scorer: Box<dyn ConfidenceScorer>,
    retry: RetryAnalysisStrategy,
    policies: StagePolicyTable,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    /// Orchestrator with the default stage implementations.
    pub fn new(
        document_service: Arc<dyn DocumentService>,
        analysis_service: Arc<dyn AnalysisService>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            document_service,
            analysis_service,
            enhancer: Box::new(StandardFieldEnhancer::new()),
            rule_engine: Box::new(ValidationRuleInferenceEngine::new()),
            schema_builder: Box::new(SchemaFieldSelector::new()),
            scorer: Box::new(ConfidenceAggregator::new(
                config.model_adjustments.clone(),
                config.reference_page_height,
            )),
            retry: RetryAnalysisStrategy::new(
                config.model_rotation.clone(),
                config.low_confidence_threshold,
            ),
            policies: StagePolicyTable::default(),
            config,
        }
    }

    pub fn with_enhancer(mut self, enhancer: Box<dyn FieldEnhancer>) -> Self {
        self.enhancer = enhancer;
        self
    }

    pub fn with_rule_engine(mut self, rule_engine: Box<dyn RuleInferencer>) -> Self {
        self.rule_engine = rule_engine;
        self
    }

    pub fn with_schema_builder(mut self, schema_builder: Box<dyn SchemaBuilder>) -> Self {
        self.schema_builder = schema_builder;
        self
    }

    pub fn with_scorer(mut self, scorer: Box<dyn ConfidenceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_policies(mut self, policies: StagePolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn retry_strategy(&self) -> &RetryAnalysisStrategy {
        &self.retry
    }

    /// Run all six stages on raw document bytes.
    pub async fn run(&self, bytes: Vec<u8>, filename: &str, options: RunOptions) -> PipelineResult {
        let input = StageInput::Raw {
            bytes,
            filename: filename.to_string(),
        };
        self.drive(input, &options, None).await
    }

    /// Re-run stages 2–6 on an already prepared document with the next
    /// model in the rotation (or `options.model` when given). The new run
    /// carries `retry_count + 1` and a back-reference to `previous`.
    pub async fn rerun(
        &self,
        prepared: PreparedDocument,
        previous: &AnalysisRun,
        options: RunOptions,
    ) -> PipelineResult {
        let plan = self.retry.plan(previous, options.model.as_deref());
        tracing::info!(
            document_id = %prepared.document_id,
            previous_run = %previous.id,
            model = %plan.model,
            retry_count = plan.retry_count,
            "Retrying analysis"
        );
        self.drive(StageInput::Prepared(prepared), &options, Some(plan)).await
    }

    async fn drive(
        &self,
        input: StageInput,
        options: &RunOptions,
        lineage: Option<RetryPlan>,
    ) -> PipelineResult {
        let started = Instant::now();
        let span = tracing::info_span!(
            "pipeline_run",
            filename = %input.filename(),
            retry = lineage.is_some()
        );

        let mut state = RunState::default();
        let outcome = AssertUnwindSafe(self.execute(input, options, lineage.as_ref(), &mut state))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        let _entered = span.enter();

        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                abort(&mut state.log, &error);
                false
            }
            Err(payload) => {
                record_panic(&mut state.log, payload.as_ref());
                false
            }
        };

        state.log.trace.total_duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            success,
            duration_ms = state.log.trace.total_duration_ms,
            errors = state.log.errors.len(),
            "Pipeline run finished"
        );

        let recommendations = state
            .confidence
            .as_ref()
            .map(|c| c.recommendations.clone())
            .unwrap_or_default();

        PipelineResult {
            success,
            document_id: state.prepared.as_ref().map(|d| d.document_id),
            document: state.prepared,
            analysis: state.run,
            rules: state.rules,
            schema: state.schema,
            confidence: state.confidence,
            recommendations,
            errors: state.log.errors,
            trace: state.log.trace,
        }
    }

    async fn execute(
        &self,
        input: StageInput,
        options: &RunOptions,
        lineage: Option<&RetryPlan>,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        // ── Stage 1: document preparation ──
        let prepared = match input {
            StageInput::Raw { bytes, filename } => {
                self.prepare(bytes, filename, options, &mut state.log).await?
            }
            StageInput::Prepared(prepared) => {
                begin(&mut state.log, PipelineStage::DocumentPreparation, options)?;
                state.log.trace.record(StageRecord::success(
                    PipelineStage::DocumentPreparation,
                    Duration::ZERO,
                    metrics([("reused", json!(true)), ("pages", json!(prepared.pages.len()))]),
                ));
                prepared
            }
        };
        tracing::info!(document_id = %prepared.document_id, kind = prepared.kind.as_str(), "Document prepared");
        let document = prepared.clone();
        state.prepared = Some(prepared);

        // ── Stage 2: AI analysis ──
        let model = lineage
            .map(|plan| plan.model.clone())
            .or_else(|| options.model.clone())
            .unwrap_or_else(|| self.config.default_model.clone());
        let run = self.analyze(document, model, lineage, options, state).await?;

        let RunState {
            log,
            run: run_slot,
            rules,
            schema,
            confidence,
            ..
        } = state;
        let run = run_slot.insert(run);

        // ── Stage 3: field enhancement ──
        let stage = PipelineStage::FieldEnhancement;
        let started = begin(log, stage, options)?;
        match self.enhancer.enhance(&run.fields) {
            Ok(fields) => {
                let before = run.fields.len();
                run.set_fields(fields);
                complete(
                    log,
                    stage,
                    started,
                    metrics([
                        ("fields_before", json!(before)),
                        ("fields_after", json!(run.fields.len())),
                    ]),
                );
            }
            Err(e) => {
                // Fallback: keep the raw fields from stage 2.
                self.fail_or_degrade(log, stage, started, e.into(), Some(()))?;
            }
        }

        // ── Stage 4: validation rule inference ──
        let stage = PipelineStage::ValidationInference;
        let started = begin(log, stage, options)?;
        *rules = match self.rule_engine.infer(&run.fields) {
            Ok(inferred) => {
                let total: usize = inferred.values().map(Vec::len).sum();
                let recommended = inferred.values().flatten().filter(|r| r.is_recommended).count();
                complete(
                    log,
                    stage,
                    started,
                    metrics([
                        ("rules", json!(total)),
                        ("recommended", json!(recommended)),
                        ("fields_with_rules", json!(inferred.len())),
                    ]),
                );
                inferred
            }
            Err(e) => self.fail_or_degrade(log, stage, started, e.into(), Some(RuleSet::new()))?,
        };

        // ── Stage 5: schema generation ──
        let stage = PipelineStage::SchemaGeneration;
        let started = begin(log, stage, options)?;
        let threshold = options.threshold.unwrap_or(self.config.confidence_threshold);
        let include_low = options
            .include_low_confidence
            .unwrap_or(self.config.include_low_confidence);
        *schema = match self.schema_builder.select(run, rules, threshold, include_low) {
            Ok(draft) => {
                complete(
                    log,
                    stage,
                    started,
                    metrics([
                        ("threshold", json!(threshold)),
                        ("fields_generated", json!(draft.total_fields_generated())),
                        ("high_confidence_fields", json!(draft.high_confidence_fields())),
                        ("validation_status", json!(draft.validation_status.as_str())),
                    ]),
                );
                Some(draft)
            }
            // A recoverable override continues without a schema.
            Err(e) => self.fail_or_degrade(log, stage, started, e.into(), Some(None))?,
        };

        // ── Stage 6: confidence aggregation ──
        let stage = PipelineStage::ConfidenceScoring;
        let started = begin(log, stage, options)?;
        let scored = self.scorer.score(run, rules).and_then(|report| {
            run.set_quality(report.overall_score)
                .map_err(|e| ConfidenceScoringError::Failed(e.to_string()))?;
            Ok(report)
        });
        *confidence = Some(match scored {
            Ok(report) => {
                complete(
                    log,
                    stage,
                    started,
                    metrics([
                        ("overall_score", json!(report.overall_score)),
                        ("level", json!(report.level.as_str())),
                        ("recommendations", json!(report.recommendations.len())),
                    ]),
                );
                report
            }
            Err(e) => {
                self.fail_or_degrade(log, stage, started, e.into(), Some(ConfidenceReport::neutral()))?
            }
        });

        log.current = None;
        Ok(())
    }

    async fn prepare(
        &self,
        bytes: Vec<u8>,
        filename: String,
        options: &RunOptions,
        log: &mut StageLog,
    ) -> Result<PreparedDocument, PipelineError> {
        let stage = PipelineStage::DocumentPreparation;
        let started = begin(log, stage, options)?;
        let service = Arc::clone(&self.document_service);
        let result = run_blocking(stage, self.config.preparation_timeout(), move || {
            service.prepare(&bytes, &filename)
        })
        .await;

        match result {
            Ok(mut prepared) => {
                prepared
                    .metadata
                    .extend(options.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                complete(
                    log,
                    stage,
                    started,
                    metrics([
                        ("kind", json!(prepared.kind.as_str())),
                        ("pages", json!(prepared.pages.len())),
                        ("size_bytes", json!(prepared.size_bytes)),
                    ]),
                );
                Ok(prepared)
            }
            Err(e) => self.fail_or_degrade(log, stage, started, e, None),
        }
    }

    async fn analyze(
        &self,
        document: PreparedDocument,
        model: String,
        lineage: Option<&RetryPlan>,
        options: &RunOptions,
        state: &mut RunState,
    ) -> Result<AnalysisRun, PipelineError> {
        let stage = PipelineStage::AiAnalysis;
        let started = begin(&mut state.log, stage, options)?;

        let mut run = AnalysisRun::placeholder(document.document_id, &model);
        run.page_height = document.page_height;
        if let Some(plan) = lineage {
            run.retry_count = plan.retry_count;
            run.previous_run_id = Some(plan.previous_run_id);
        }

        let service = Arc::clone(&self.analysis_service);
        let type_hint = options.type_hint.clone();
        let result = run_blocking(stage, self.config.analysis_timeout(), move || {
            service.analyze(&document, &model, type_hint.as_deref())
        })
        .await
        .and_then(|raw| apply_extraction(&mut run, raw).map_err(PipelineError::from));

        match result {
            Ok(()) => {
                complete(
                    &mut state.log,
                    stage,
                    started,
                    metrics([
                        ("model", json!(run.model)),
                        ("document_type", json!(run.document_type)),
                        ("fields_detected", json!(run.total_fields_detected)),
                        ("high_confidence_fields", json!(run.high_confidence_fields)),
                        ("requires_review", json!(run.requires_review_count)),
                    ]),
                );
                Ok(run)
            }
            Err(e) => {
                run.error_detail = Some(e.to_string());
                state.run = Some(run);
                self.fail_or_degrade(&mut state.log, stage, started, e, None)
            }
        }
    }

    /// Consult the policy table for a failed stage. Recoverable stages with a
    /// fallback continue with it; everything else aborts the run.
    fn fail_or_degrade<T>(
        &self,
        log: &mut StageLog,
        stage: PipelineStage,
        started: Instant,
        error: PipelineError,
        fallback: Option<T>,
    ) -> Result<T, PipelineError> {
        let elapsed = started.elapsed();
        let message = error.to_string();
        let recoverable = self.policies.policy_for(stage) == StagePolicy::Recoverable;

        match fallback.filter(|_| recoverable) {
            Some(value) => {
                tracing::warn!(
                    stage = %stage,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %message,
                    "Stage failed, continuing with fallback"
                );
                log.trace.record(StageRecord::failure(stage, elapsed, message.clone(), true));
                log.errors.push(format!("{stage} (recovered): {message}"));
                Ok(value)
            }
            None => {
                tracing::error!(
                    stage = %stage,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %message,
                    "Stage failed, aborting run"
                );
                log.trace.record(StageRecord::failure(stage, elapsed, message, false));
                Err(error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage helpers
// ---------------------------------------------------------------------------

/// Cancellation checkpoint plus stage start bookkeeping.
fn begin(
    log: &mut StageLog,
    stage: PipelineStage,
    options: &RunOptions,
) -> Result<Instant, PipelineError> {
    if options.cancellation.is_cancelled() {
        return Err(PipelineError::Cancelled(stage));
    }
    let now = Instant::now();
    log.current = Some((stage, now));
    tracing::debug!(stage = %stage, number = stage.number(), "Stage started");
    Ok(now)
}

fn complete(
    log: &mut StageLog,
    stage: PipelineStage,
    started: Instant,
    metrics: BTreeMap<String, serde_json::Value>,
) {
    let elapsed = started.elapsed();
    tracing::info!(stage = %stage, duration_ms = elapsed.as_millis() as u64, "Stage complete");
    log.trace.record(StageRecord::success(stage, elapsed, metrics));
    log.current = None;
}

/// Run an external call on the blocking pool, bounded by `timeout`.
///
/// A timed-out task is abandoned, not interrupted. A panic inside the task
/// is resumed on this side so the top-level handler records it.
async fn run_blocking<T, E>(
    stage: PipelineStage,
    timeout: Duration,
    task: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> Result<T, PipelineError>
where
    T: Send + 'static,
    E: Into<PipelineError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(task)).await {
        Err(_) => Err(PipelineError::Timeout {
            stage,
            timeout_secs: timeout.as_secs(),
        }),
        Ok(Err(join)) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
        Ok(Err(join)) => Err(PipelineError::Internal {
            stage,
            message: join.to_string(),
        }),
        Ok(Ok(result)) => result.map_err(Into::into),
    }
}

/// Validate the raw extraction into the run.
fn apply_extraction(run: &mut AnalysisRun, raw: RawExtraction) -> Result<(), AiAnalysisError> {
    run.set_document_type(raw.document_type, raw.confidence)?;
    run.alternative_types = raw
        .alternative_types
        .into_iter()
        .map(|c| TypeCandidate::new(c.document_type, c.confidence))
        .collect::<Result<_, _>>()?;
    run.type_indicators = raw.type_indicators;
    run.template_matches = raw.template_matches;

    let fields = raw
        .fields
        .into_iter()
        .map(RawField::into_field)
        .collect::<Result<Vec<_>, _>>()?;
    run.set_fields(fields);

    let quality = raw.quality.unwrap_or_else(|| run.mean_field_confidence());
    run.set_quality(quality)?;
    Ok(())
}

/// Close out an aborted run: failed stage, skipped stages, error message.
fn abort(log: &mut StageLog, error: &PipelineError) {
    let stage = error.stage();
    log.trace.failed_stage = Some(stage);
    match error {
        PipelineError::Cancelled(_) => {
            tracing::warn!(stage = %stage, "Pipeline cancelled");
            log.trace.skip_remaining(None);
            log.errors.push(error.to_string());
        }
        _ => {
            let duration_ms = log.trace.stage(stage).map_or(0, |r| r.duration_ms);
            log.trace.skip_remaining(Some(stage));
            log.errors.push(format!("{stage} failed after {duration_ms}ms: {error}"));
        }
    }
    log.current = None;
}

fn record_panic(log: &mut StageLog, payload: &(dyn Any + Send)) {
    let message = panic_message(payload);
    let (stage, elapsed) = match log.current.take() {
        Some((stage, started)) => (stage, started.elapsed()),
        None => (PipelineStage::DocumentPreparation, Duration::ZERO),
    };
    tracing::error!(stage = %stage, panic = %message, "Pipeline stage panicked");

    if !log.trace.executed(stage) {
        log.trace
            .record(StageRecord::failure(stage, elapsed, format!("panic: {message}"), false));
    }
    log.trace.failed_stage = Some(stage);
    log.trace.fatal_error = Some(message.clone());
    log.trace.skip_remaining(Some(stage));
    log.errors.push(format!(
        "{stage} failed after {}ms: uncaught panic: {message}",
        elapsed.as_millis()
    ));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfidenceLevel, ExtractedField, FieldType, ValidationStatus};
    use crate::pipeline::error::{
        FieldEnhancementError, SchemaGenerationError, ValidationInferenceError,
    };
    use crate::pipeline::services::{MockAnalysisService, MockDocumentService};

    struct FailingEnhancer;
    impl FieldEnhancer for FailingEnhancer {
        fn enhance(&self, _: &[ExtractedField]) -> Result<Vec<ExtractedField>, FieldEnhancementError> {
            Err(FieldEnhancementError::Failed("enhancer offline".into()))
        }
    }

    struct FailingRules;
    impl RuleInferencer for FailingRules {
        fn infer(&self, _: &[ExtractedField]) -> Result<RuleSet, ValidationInferenceError> {
            Err(ValidationInferenceError::Failed("rules offline".into()))
        }
    }

    struct FailingSchema;
    impl SchemaBuilder for FailingSchema {
        fn select(
            &self,
            _: &AnalysisRun,
            _: &RuleSet,
            threshold: f64,
            _: bool,
        ) -> Result<SchemaDraft, SchemaGenerationError> {
            Err(SchemaGenerationError::InvalidThreshold(threshold))
        }
    }

    struct FailingScorer;
    impl ConfidenceScorer for FailingScorer {
        fn score(&self, _: &AnalysisRun, _: &RuleSet) -> Result<ConfidenceReport, ConfidenceScoringError> {
            Err(ConfidenceScoringError::Failed("scorer offline".into()))
        }
    }

    struct PanickingEnhancer;
    impl FieldEnhancer for PanickingEnhancer {
        fn enhance(&self, _: &[ExtractedField]) -> Result<Vec<ExtractedField>, FieldEnhancementError> {
            panic!("enhancer exploded")
        }
    }

    fn extraction(fields: Vec<RawField>) -> RawExtraction {
        RawExtraction {
            document_type: "invoice".into(),
            confidence: 0.9,
            alternative_types: vec![],
            type_indicators: vec!["invoice number".into()],
            template_matches: vec![],
            fields,
            quality: None,
        }
    }

    fn orchestrator(analysis: MockAnalysisService) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::new(MockDocumentService::new()),
            Arc::new(analysis),
            PipelineConfig::default(),
        )
    }

    fn stage_names(result: &PipelineResult) -> Vec<PipelineStage> {
        result.trace.stages.iter().map(|r| r.stage).collect()
    }

    #[tokio::test]
    async fn happy_path_runs_all_stages() {
        let result = orchestrator(MockAnalysisService::invoice())
            .run(b"INVOICE".to_vec(), "invoice.txt", RunOptions::default())
            .await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert!(result.errors.is_empty());
        assert_eq!(stage_names(&result), PipelineStage::ALL.to_vec());
        assert!(result.trace.skipped.is_empty());
        assert!(result.trace.stages.iter().all(|r| r.success));

        let run = result.analysis.unwrap();
        let schema = result.schema.unwrap();
        let report = result.confidence.unwrap();
        assert_eq!(schema.total_fields_generated(), 3);
        assert_eq!(schema.run_id, run.id);
        assert_eq!(run.overall_quality_score, report.overall_score);
        assert!(run.check_invariants().is_ok());
        assert_eq!(result.document_id, Some(run.document_id));
    }

    // Two confident fields, one email, one date: schema has both, with a
    // recommended rule on each and validation status complete.
    #[tokio::test]
    async fn scenario_confident_fields_yield_complete_schema() {
        let mock = MockAnalysisService::new(extraction(vec![
            RawField::uniform("contact_email", "email", Some("billing@acme.com"), 0.9),
            RawField::uniform("issue_date", "date", Some("2024-01-15"), 0.85),
        ]));
        let result = orchestrator(mock)
            .run(b"x".to_vec(), "doc.txt", RunOptions::default())
            .await;

        assert!(result.success);
        let schema = result.schema.unwrap();
        assert_eq!(schema.total_fields_generated(), 2);
        assert_eq!(schema.high_confidence_fields(), 2);
        for field in schema.fields().values() {
            assert!(!field.validation_rules.is_empty());
            assert!(!field.ai_metadata.requires_review);
        }
        assert_eq!(schema.validation_status, ValidationStatus::Complete);
    }

    // A weak field is dropped at the default threshold and kept, flagged,
    // when low-confidence fields are included.
    #[tokio::test]
    async fn scenario_low_confidence_field_inclusion() {
        let fields = vec![
            RawField::uniform("invoice_number", "identifier", Some("INV-1"), 0.9),
            RawField::uniform("notes", "text", Some("smudged"), 0.3),
        ];
        let o = orchestrator(MockAnalysisService::new(extraction(fields)));

        let excluded = o.run(b"x".to_vec(), "a.txt", RunOptions::default()).await;
        let schema = excluded.schema.unwrap();
        assert_eq!(schema.total_fields_generated(), 1);
        assert!(schema.field("notes").is_none());

        let options = RunOptions {
            include_low_confidence: Some(true),
            ..Default::default()
        };
        let included = o.run(b"x".to_vec(), "a.txt", options).await;
        let schema = included.schema.unwrap();
        let notes = schema.field("notes").unwrap();
        assert!(notes.ai_metadata.requires_review);
        assert!(notes.ai_metadata.review_reason.as_deref().unwrap().contains("below threshold"));
    }

    fn eight_strong_two_weak() -> Vec<RawField> {
        let strong = [
            "invoice_number",
            "invoice_date",
            "due_date",
            "vendor_name",
            "vendor_address",
            "subtotal",
            "tax_amount",
            "total_amount",
        ];
        let mut fields: Vec<RawField> = strong
            .iter()
            .map(|n| RawField::uniform(n, "text", Some("value"), 0.85))
            .collect();
        fields.push(RawField::uniform("handwritten_note", "text", Some("?"), 0.3));
        fields.push(RawField::uniform("stamp_text", "text", Some("?"), 0.3));
        fields
    }

    #[tokio::test]
    async fn scenario_threshold_keeps_only_strong_fields() {
        let o = orchestrator(MockAnalysisService::new(extraction(eight_strong_two_weak())));
        let options = RunOptions {
            threshold: Some(0.6),
            ..Default::default()
        };
        let result = o.run(b"x".to_vec(), "a.txt", options).await;

        assert!(result.success);
        assert_eq!(result.analysis.as_ref().unwrap().total_fields_detected, 10);
        let schema = result.schema.unwrap();
        assert_eq!(schema.total_fields_generated(), 8);
        assert_eq!(schema.high_confidence_fields(), 8);
        assert!(schema.fields_requiring_review().is_empty());
    }

    #[tokio::test]
    async fn scenario_include_low_flags_weak_fields() {
        let o = orchestrator(MockAnalysisService::new(extraction(eight_strong_two_weak())));
        let options = RunOptions {
            threshold: Some(0.6),
            include_low_confidence: Some(true),
            ..Default::default()
        };
        let result = o.run(b"x".to_vec(), "a.txt", options).await;

        let schema = result.schema.unwrap();
        assert_eq!(schema.total_fields_generated(), 10);
        assert_eq!(schema.high_confidence_fields(), 8);
        let mut flagged: Vec<&str> = schema
            .fields_requiring_review()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        flagged.sort_unstable();
        assert_eq!(flagged, vec!["handwritten_note", "stamp_text"]);
    }

    #[tokio::test]
    async fn scenario_recoverable_failures_degrade() {
        let result = orchestrator(MockAnalysisService::invoice())
            .with_enhancer(Box::new(FailingEnhancer))
            .with_rule_engine(Box::new(FailingRules))
            .with_scorer(Box::new(FailingScorer))
            .run(b"x".to_vec(), "a.txt", RunOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(result.trace.stages.len(), 6);
        assert_eq!(result.errors.len(), 3);
        let enhance = result.trace.stage(PipelineStage::FieldEnhancement).unwrap();
        assert!(!enhance.success && enhance.used_fallback);

        // Raw fields survive, no rules, neutral confidence.
        assert_eq!(result.analysis.as_ref().unwrap().total_fields_detected, 3);
        assert!(result.rules.is_empty());
        let report = result.confidence.unwrap();
        assert_eq!(report.overall_score, 0.5);
        assert_eq!(report.level, ConfidenceLevel::Medium);
        assert_eq!(
            result.schema.unwrap().validation_status,
            ValidationStatus::Pending
        );
    }

    #[tokio::test]
    async fn scenario_analysis_failure_aborts() {
        let result = orchestrator(MockAnalysisService::failing("model endpoint down"))
            .run(b"x".to_vec(), "a.txt", RunOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.schema.is_none());
        assert_eq!(
            stage_names(&result),
            vec![PipelineStage::DocumentPreparation, PipelineStage::AiAnalysis]
        );
        assert_eq!(result.trace.failed_stage, Some(PipelineStage::AiAnalysis));
        assert_eq!(result.trace.skipped.len(), 4);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("ai_analysis failed after"));
        assert!(result.errors[0].contains("model endpoint down"));
        assert!(result.analysis.unwrap().error_detail.is_some());
    }

    #[tokio::test]
    async fn preparation_failure_is_fatal() {
        let o = PipelineOrchestrator::new(
            Arc::new(MockDocumentService::failing("corrupt scan")),
            Arc::new(MockAnalysisService::invoice()),
            PipelineConfig::default(),
        );
        let result = o.run(b"x".to_vec(), "a.pdf", RunOptions::default()).await;
        assert!(!result.success);
        assert!(result.document_id.is_none());
        assert_eq!(stage_names(&result), vec![PipelineStage::DocumentPreparation]);
        assert_eq!(result.trace.skipped.len(), 5);
    }

    #[tokio::test]
    async fn schema_failure_is_fatal_by_default() {
        let result = orchestrator(MockAnalysisService::invoice())
            .with_schema_builder(Box::new(FailingSchema))
            .run(b"x".to_vec(), "a.txt", RunOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.trace.failed_stage, Some(PipelineStage::SchemaGeneration));
        assert_eq!(result.trace.skipped, vec![PipelineStage::ConfidenceScoring]);
        assert!(result.confidence.is_none());
    }

    #[tokio::test]
    async fn policy_table_can_make_schema_recoverable() {
        let result = orchestrator(MockAnalysisService::invoice())
            .with_schema_builder(Box::new(FailingSchema))
            .with_policies(
                StagePolicyTable::default()
                    .with_policy(PipelineStage::SchemaGeneration, StagePolicy::Recoverable),
            )
            .run(b"x".to_vec(), "a.txt", RunOptions::default())
            .await;
        assert!(result.success);
        assert!(result.schema.is_none());
        assert!(result.confidence.is_some());
    }

    #[tokio::test]
    async fn panics_become_fatal_errors() {
        let result = orchestrator(MockAnalysisService::invoice())
            .with_enhancer(Box::new(PanickingEnhancer))
            .run(b"x".to_vec(), "a.txt", RunOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.trace.fatal_error.as_deref(), Some("enhancer exploded"));
        assert_eq!(result.trace.failed_stage, Some(PipelineStage::FieldEnhancement));
        assert_eq!(result.trace.stages.len(), 3);
        assert_eq!(result.trace.skipped.len(), 3);
        assert!(result.analysis.is_some());
    }

    #[tokio::test]
    async fn analysis_timeout_is_fatal() {
        let config = PipelineConfig {
            analysis_timeout_secs: 0,
            ..Default::default()
        };
        let o = PipelineOrchestrator::new(
            Arc::new(MockDocumentService::new()),
            Arc::new(MockAnalysisService::invoice().with_delay(Duration::from_millis(200))),
            config,
        );
        let result = o.run(b"x".to_vec(), "a.txt", RunOptions::default()).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("timed out"));
        assert_eq!(result.trace.failed_stage, Some(PipelineStage::AiAnalysis));
    }

    #[tokio::test]
    async fn cancellation_skips_everything() {
        let options = RunOptions::default();
        options.cancellation.cancel();
        let result = orchestrator(MockAnalysisService::invoice())
            .run(b"x".to_vec(), "a.txt", options)
            .await;
        assert!(!result.success);
        assert!(result.trace.stages.is_empty());
        assert_eq!(result.trace.skipped.len(), 6);
        assert!(result.errors[0].contains("cancelled"));
    }

    #[tokio::test]
    async fn rerun_uses_rotation_and_lineage() {
        let retry_extraction = extraction(vec![RawField::uniform(
            "invoice_number",
            "identifier",
            Some("INV-2"),
            0.95,
        )]);
        let mock = Arc::new(MockAnalysisService::invoice().with_model("gpt-4o-mini", retry_extraction));
        let o = PipelineOrchestrator::new(
            Arc::new(MockDocumentService::new()),
            mock.clone(),
            PipelineConfig::default(),
        );

        let first = o.run(b"x".to_vec(), "a.txt", RunOptions::default()).await;
        let previous = first.analysis.unwrap();
        let prepared = first.document.unwrap();

        let second = o.rerun(prepared.clone(), &previous, RunOptions::default()).await;
        assert!(second.success);
        let retried = second.analysis.unwrap();
        assert_eq!(retried.model, "gpt-4o-mini");
        assert_eq!(retried.retry_count, previous.retry_count + 1);
        assert_eq!(retried.previous_run_id, Some(previous.id));
        assert_eq!(retried.document_id, previous.document_id);
        assert_eq!(retried.fields[0].field_type, FieldType::Identifier);
        assert_eq!(
            second.trace.stage(PipelineStage::DocumentPreparation).unwrap().metrics["reused"],
            true
        );
        assert_eq!(mock.models_seen(), vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]);
    }

    #[tokio::test]
    async fn invalid_extraction_fails_analysis() {
        let mut bad = RawField::uniform("total", "currency", None, 0.9);
        bad.visual_clarity = 1.7;
        let result = orchestrator(MockAnalysisService::new(extraction(vec![bad])))
            .run(b"x".to_vec(), "a.txt", RunOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.trace.failed_stage, Some(PipelineStage::AiAnalysis));
        assert!(result.errors[0].contains("visual_clarity"));
    }

    #[tokio::test]
    async fn metadata_merged_into_document() {
        let mut options = RunOptions::default();
        options.metadata.insert("source".into(), json!("scanner-3"));
        let result = orchestrator(MockAnalysisService::invoice())
            .run(b"x".to_vec(), "a.txt", options)
            .await;
        assert_eq!(result.document.unwrap().metadata["source"], "scanner-3");
    }
}
