//! Analysis commands.
//!
//! - `analyze_document`: run the full pipeline and persist what it produced
//! - `retry_analysis`: re-run a stored document with another model and
//!   compare the two runs
//! - `get_analysis_results`: load one run with its rules and schemas

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CommandError;
use crate::core_state::CoreState;
use crate::db::{RunOutput, Storage, StorageError};
use crate::models::{AnalysisRun, ExtractedField, SchemaDraft};
use crate::pipeline::retry::{RetrySession, RetryState, RunComparison};
use crate::pipeline::types::RuleSet;
use crate::pipeline::{ConfidenceReport, PipelineResult, RunOptions};

/// Caller options for `analyze_document`. Unset values use the pipeline
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzeOptions {
    pub model: Option<String>,
    pub type_hint: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub threshold: Option<f64>,
    pub include_low_confidence: Option<bool>,
}

impl From<AnalyzeOptions> for RunOptions {
    fn from(options: AnalyzeOptions) -> Self {
        RunOptions {
            model: options.model,
            type_hint: options.type_hint,
            metadata: options.metadata,
            threshold: options.threshold,
            include_low_confidence: options.include_low_confidence,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub analysis: AnalysisRun,
    pub schema: Option<SchemaDraft>,
    pub confidence: Option<ConfidenceReport>,
    pub improved: bool,
    pub comparison: RunComparison,
    /// The run being retried scored below the low-confidence threshold.
    pub previous_was_low_confidence: bool,
    /// Recovered stage failures of the retried run.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResults {
    pub analysis: AnalysisRun,
    pub fields: Vec<ExtractedField>,
    pub rules: RuleSet,
    pub schemas: Vec<SchemaDraft>,
    /// Quality below the low-confidence threshold; a retry may help.
    pub retry_suggested: bool,
}

/// Run the pipeline on one document and persist the outputs.
///
/// Never fails: problems are reported through `success` and `errors`. A
/// persistence failure is reported the same way and flips `success`.
pub async fn analyze_document(
    state: &CoreState,
    bytes: Vec<u8>,
    filename: &str,
    options: AnalyzeOptions,
) -> PipelineResult {
    let run_number = state.note_run_started();
    tracing::info!(filename, size = bytes.len(), run_number, "Analyze document requested");

    let mut result = state.orchestrator().run(bytes, filename, options.into()).await;
    if let Err(e) = persist(state.storage(), &result, true) {
        tracing::error!(filename, error = %e, "Failed to persist analysis");
        result.errors.push(format!("Persistence failed: {e}"));
        result.success = false;
    }
    result
}

/// Retry a stored run with the next model in the rotation, or `model`
/// when given.
pub async fn retry_analysis(
    state: &CoreState,
    document_id: Uuid,
    previous_run_id: Uuid,
    model: Option<String>,
) -> Result<RetryOutcome, CommandError> {
    let storage = state.storage();
    let document = storage
        .get_document(&document_id)?
        .ok_or(CommandError::NotFound {
            entity: "document",
            id: document_id,
        })?;
    let previous = storage
        .get_run(&previous_run_id)?
        .ok_or(CommandError::NotFound {
            entity: "analysis run",
            id: previous_run_id,
        })?;
    if previous.document_id != document_id {
        return Err(CommandError::InvalidRequest(format!(
            "run {previous_run_id} does not belong to document {document_id}"
        )));
    }

    let strategy = state.orchestrator().retry_strategy();
    let mut session = RetrySession::new();
    let initial_state = session.record_analysis(previous.clone(), strategy)?;
    state.note_run_started();

    let options = RunOptions {
        model,
        ..Default::default()
    };
    let mut result = state.orchestrator().rerun(document, &previous, options).await;
    if let Err(e) = persist(storage, &result, false) {
        tracing::error!(document_id = %document_id, error = %e, "Failed to persist retry");
        result.errors.push(format!("Persistence failed: {e}"));
        result.success = false;
    }
    if !result.success {
        return Err(CommandError::PipelineFailed(result.errors));
    }
    let retried = result
        .analysis
        .ok_or_else(|| CommandError::PipelineFailed(vec!["retry produced no analysis".into()]))?;

    session.record_retry(retried.clone())?;
    let comparison = session.compare(strategy)?;
    tracing::info!(
        document_id = %document_id,
        previous_run = %previous.id,
        retried_run = %retried.id,
        model = %retried.model,
        overall_delta = comparison.overall_delta,
        "Retry compared"
    );

    Ok(RetryOutcome {
        analysis: retried,
        schema: result.schema,
        confidence: result.confidence,
        improved: comparison.improved,
        comparison,
        previous_was_low_confidence: initial_state == RetryState::LowConfidence,
        errors: result.errors,
    })
}

pub fn get_analysis_results(state: &CoreState, run_id: Uuid) -> Result<AnalysisResults, CommandError> {
    let storage = state.storage();
    let analysis = storage.get_run(&run_id)?.ok_or(CommandError::NotFound {
        entity: "analysis run",
        id: run_id,
    })?;
    let rules = storage.rules_for_run(&run_id)?;
    let schemas = storage.schemas_for_run(&run_id)?;

    Ok(AnalysisResults {
        fields: analysis.fields.clone(),
        retry_suggested: state.orchestrator().retry_strategy().is_low_confidence(&analysis),
        analysis,
        rules,
        schemas,
    })
}

/// Save whatever the run produced in one transaction. Retries reuse the
/// stored document.
fn persist(
    storage: &dyn Storage,
    result: &PipelineResult,
    save_document: bool,
) -> Result<(), StorageError> {
    storage.save_run_output(&RunOutput {
        document: result.document.as_ref().filter(|_| save_document),
        run: result.analysis.as_ref(),
        rules: &result.rules,
        schema: result.schema.as_ref(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::SqliteStorage;
    use crate::pipeline::services::{MockAnalysisService, MockDocumentService};
    use crate::pipeline::types::{PreparedDocument, RawExtraction, RawField};
    use crate::pipeline::PipelineOrchestrator;
    use crate::pipeline_config::PipelineConfig;

    fn extraction(confidence: f64, names: &[&str]) -> RawExtraction {
        RawExtraction {
            document_type: "invoice".into(),
            confidence,
            alternative_types: vec![],
            type_indicators: vec![],
            template_matches: vec![],
            fields: names
                .iter()
                .map(|n| RawField::uniform(n, "text", Some("value"), confidence))
                .collect(),
            quality: Some(confidence),
        }
    }

    fn state_with(analysis: MockAnalysisService, storage: Arc<dyn Storage>) -> CoreState {
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(MockDocumentService::new()),
            Arc::new(analysis),
            PipelineConfig::default(),
        );
        CoreState::new(orchestrator, storage)
    }

    fn state(analysis: MockAnalysisService) -> CoreState {
        state_with(analysis, Arc::new(SqliteStorage::in_memory().unwrap()))
    }

    /// Storage whose writes of run output always fail.
    struct BrokenRunStorage(SqliteStorage);

    impl Storage for BrokenRunStorage {
        fn save_document(&self, d: &PreparedDocument) -> Result<(), StorageError> {
            self.0.save_document(d)
        }
        fn get_document(&self, id: &Uuid) -> Result<Option<PreparedDocument>, StorageError> {
            self.0.get_document(id)
        }
        fn save_run(&self, _: &AnalysisRun) -> Result<(), StorageError> {
            Err(StorageError::LockPoisoned)
        }
        fn get_run(&self, id: &Uuid) -> Result<Option<AnalysisRun>, StorageError> {
            self.0.get_run(id)
        }
        fn runs_for_document(&self, id: &Uuid) -> Result<Vec<AnalysisRun>, StorageError> {
            self.0.runs_for_document(id)
        }
        fn save_rules(&self, r: &RuleSet) -> Result<(), StorageError> {
            self.0.save_rules(r)
        }
        fn rules_for_run(&self, id: &Uuid) -> Result<RuleSet, StorageError> {
            self.0.rules_for_run(id)
        }
        fn save_schema(&self, s: &SchemaDraft) -> Result<(), StorageError> {
            self.0.save_schema(s)
        }
        fn get_schema(&self, id: &Uuid) -> Result<Option<SchemaDraft>, StorageError> {
            self.0.get_schema(id)
        }
        fn schemas_for_run(&self, id: &Uuid) -> Result<Vec<SchemaDraft>, StorageError> {
            self.0.schemas_for_run(id)
        }
        fn save_run_output(&self, _: &RunOutput<'_>) -> Result<(), StorageError> {
            Err(StorageError::LockPoisoned)
        }
    }

    #[tokio::test]
    async fn analyze_persists_everything() {
        let state = state(MockAnalysisService::invoice());
        let result = analyze_document(&state, b"INVOICE".to_vec(), "inv.txt", AnalyzeOptions::default()).await;
        assert!(result.success, "errors: {:?}", result.errors);

        let run_id = result.analysis.as_ref().unwrap().id;
        let loaded = get_analysis_results(&state, run_id).unwrap();
        assert_eq!(loaded.analysis, result.analysis.unwrap());
        assert_eq!(loaded.fields.len(), 3);
        assert_eq!(loaded.rules, result.rules);
        assert_eq!(loaded.schemas.len(), 1);
        assert_eq!(loaded.schemas[0].id, result.schema.unwrap().id);
        assert!(!loaded.retry_suggested);
        assert_eq!(state.runs_started(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_flips_success() {
        let storage = Arc::new(BrokenRunStorage(SqliteStorage::in_memory().unwrap()));
        let state = state_with(MockAnalysisService::invoice(), storage);
        let result = analyze_document(&state, b"x".to_vec(), "a.txt", AnalyzeOptions::default()).await;
        assert!(!result.success);
        assert!(result.errors.last().unwrap().starts_with("Persistence failed"));
        // Pipeline output is still returned, nothing partial is stored.
        assert!(result.schema.is_some());
        let document_id = result.document_id.unwrap();
        assert!(state.storage().get_document(&document_id).unwrap().is_none());
        assert!(state.storage().runs_for_document(&document_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_analysis_is_still_recorded() {
        let state = state(MockAnalysisService::failing("quota exceeded"));
        let result = analyze_document(&state, b"x".to_vec(), "a.txt", AnalyzeOptions::default()).await;
        assert!(!result.success);
        let run = result.analysis.unwrap();
        let loaded = get_analysis_results(&state, run.id).unwrap();
        assert!(loaded.analysis.error_detail.unwrap().contains("quota exceeded"));
        assert!(loaded.schemas.is_empty());
    }

    #[test]
    fn unknown_run_is_not_found() {
        let state = state(MockAnalysisService::invoice());
        let err = get_analysis_results(&state, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, CommandError::NotFound { entity: "analysis run", .. }));
    }

    // Run A scores 0.3, run B 0.75 on the same fields: every shared field
    // improves and the improvement list is non-empty.
    #[tokio::test]
    async fn retry_improves_low_confidence_run() {
        let names = ["invoice_number", "vendor_name", "notes"];
        let mock = MockAnalysisService::new(extraction(0.3, &names))
            .with_model("gpt-4o-mini", extraction(0.75, &names));
        let state = state(mock);

        let first = analyze_document(&state, b"x".to_vec(), "a.txt", AnalyzeOptions::default()).await;
        let document_id = first.document_id.unwrap();
        let previous = first.analysis.unwrap();

        let outcome = retry_analysis(&state, document_id, previous.id, None).await.unwrap();
        assert!(outcome.previous_was_low_confidence);
        assert!(outcome.improved);
        assert_eq!(outcome.analysis.model, "gpt-4o-mini");
        assert_eq!(outcome.analysis.retry_count, 1);
        assert_eq!(outcome.analysis.previous_run_id, Some(previous.id));
        assert_eq!(outcome.comparison.confidence_changes.len(), names.len());
        assert!(outcome.comparison.confidence_changes.values().all(|d| *d > 0.0));
        assert!(!outcome.comparison.improvements.is_empty());

        let runs = state.storage().runs_for_document(&document_id).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(state.runs_started(), 2);
    }

    #[tokio::test]
    async fn retry_with_explicit_model() {
        let state = state(MockAnalysisService::invoice());
        let first = analyze_document(&state, b"x".to_vec(), "a.txt", AnalyzeOptions::default()).await;
        let outcome = retry_analysis(
            &state,
            first.document_id.unwrap(),
            first.analysis.unwrap().id,
            Some("gemini-1.5-pro".into()),
        )
        .await
        .unwrap();
        assert_eq!(outcome.analysis.model, "gemini-1.5-pro");
        assert!(!outcome.previous_was_low_confidence);
    }

    #[tokio::test]
    async fn retry_rejects_mismatched_run() {
        let state = state(MockAnalysisService::invoice());
        let a = analyze_document(&state, b"a".to_vec(), "a.txt", AnalyzeOptions::default()).await;
        let b = analyze_document(&state, b"b".to_vec(), "b.txt", AnalyzeOptions::default()).await;

        let err = retry_analysis(&state, a.document_id.unwrap(), b.analysis.unwrap().id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));

        let err = retry_analysis(&state, Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound { entity: "document", .. }));
    }

    #[test]
    fn analyze_options_deserialize_with_defaults() {
        let options: AnalyzeOptions =
            serde_json::from_str(r#"{"model": "gpt-4o-mini", "threshold": 0.7}"#).unwrap();
        let run: RunOptions = options.into();
        assert_eq!(run.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(run.threshold, Some(0.7));
        assert!(run.include_low_confidence.is_none());
        assert!(!run.cancellation.is_cancelled());
    }
}
