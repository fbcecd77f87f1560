use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::confidence::ConfidenceReport;
use super::error::{
    AiAnalysisError, ConfidenceScoringError, DocumentProcessingError, FieldEnhancementError,
    SchemaGenerationError, ValidationInferenceError,
};
use crate::models::{
    AnalysisRun, BoundingBox, ConfidenceScores, DocumentKind, ExtractedField, FieldDraft,
    FieldType, ModelError, SchemaDraft, TypeCandidate, ValidationRuleCandidate,
};

/// Rule candidates grouped by the id of the field they constrain.
pub type RuleSet = BTreeMap<Uuid, Vec<ValidationRuleCandidate>>;

/// One analyzable page of a prepared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedPage {
    pub page_number: u32,
    pub text: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

/// Output of document preparation, input of AI analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedDocument {
    pub document_id: Uuid,
    pub filename: String,
    pub kind: DocumentKind,
    pub pages: Vec<PreparedPage>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// SHA-256 of the original bytes, base64-encoded.
    pub content_hash: String,
    /// Original bytes, base64-encoded, for binary formats.
    pub payload_base64: Option<String>,
    pub page_height: Option<f64>,
    pub size_bytes: usize,
}

/// Raw field as reported by the analysis service. Not yet validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub value: Option<String>,
    pub visual_clarity: f64,
    pub label_confidence: f64,
    pub value_confidence: f64,
    pub type_confidence: f64,
    pub context_confidence: f64,
    #[serde(default)]
    pub overall_confidence: Option<f64>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub requires_review: Option<bool>,
    #[serde(default)]
    pub review_reason: Option<String>,
    #[serde(default)]
    pub alternative_names: Vec<String>,
}

impl RawField {
    /// Uniform-score convenience used by mocks and tests.
    pub fn uniform(name: &str, field_type: &str, value: Option<&str>, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            value: value.map(str::to_string),
            visual_clarity: confidence,
            label_confidence: confidence,
            value_confidence: confidence,
            type_confidence: confidence,
            context_confidence: confidence,
            overall_confidence: None,
            bounding_box: None,
            requires_review: None,
            review_reason: None,
            alternative_names: Vec::new(),
        }
    }

    pub fn into_field(self) -> Result<ExtractedField, ModelError> {
        let scores = ConfidenceScores::new(
            self.visual_clarity,
            self.label_confidence,
            self.value_confidence,
            self.type_confidence,
            self.context_confidence,
        );
        let mut draft = FieldDraft::new(self.name, FieldType::from_model_label(&self.field_type), scores);
        draft.sample_value = self.value;
        draft.overall_confidence = self.overall_confidence;
        draft.bounding_box = self.bounding_box;
        draft.requires_review = self.requires_review;
        draft.review_reason = self.review_reason;
        draft.alternative_names = self.alternative_names;
        ExtractedField::new(draft)
    }
}

/// Raw structured extraction returned by the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub document_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub alternative_types: Vec<TypeCandidate>,
    #[serde(default)]
    pub type_indicators: Vec<String>,
    #[serde(default)]
    pub template_matches: Vec<String>,
    #[serde(default)]
    pub fields: Vec<RawField>,
    /// Model-reported image quality; mean field confidence when absent.
    #[serde(default)]
    pub quality: Option<f64>,
}

// ─────────────────────────────────────────────
// External collaborators
// ─────────────────────────────────────────────

/// Normalizes raw bytes into analyzable pages (allows mocking).
pub trait DocumentService: Send + Sync {
    fn prepare(&self, bytes: &[u8], filename: &str)
        -> Result<PreparedDocument, DocumentProcessingError>;
}

/// AI model client abstraction (allows mocking).
pub trait AnalysisService: Send + Sync {
    fn analyze(
        &self,
        document: &PreparedDocument,
        model: &str,
        type_hint: Option<&str>,
    ) -> Result<RawExtraction, AiAnalysisError>;
}

// ─────────────────────────────────────────────
// Stage seams
// ─────────────────────────────────────────────

/// Stage 3: naming normalization and duplicate merging.
pub trait FieldEnhancer: Send + Sync {
    fn enhance(&self, fields: &[ExtractedField]) -> Result<Vec<ExtractedField>, FieldEnhancementError>;
}

/// Stage 4: proposes validation constraints per field.
pub trait RuleInferencer: Send + Sync {
    fn infer(&self, fields: &[ExtractedField]) -> Result<RuleSet, ValidationInferenceError>;
}

/// Stage 5: promotes fields into a schema draft.
pub trait SchemaBuilder: Send + Sync {
    fn select(
        &self,
        run: &AnalysisRun,
        rules: &RuleSet,
        threshold: f64,
        include_low_confidence: bool,
    ) -> Result<SchemaDraft, SchemaGenerationError>;
}

/// Stage 6: aggregates confidence signals into one report.
pub trait ConfidenceScorer: Send + Sync {
    fn score(&self, run: &AnalysisRun, rules: &RuleSet) -> Result<ConfidenceReport, ConfidenceScoringError>;
}
