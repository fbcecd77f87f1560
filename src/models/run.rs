use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::field::ExtractedField;
use super::{check_unit, mean, ModelError};

pub const UNKNOWN_DOCUMENT_TYPE: &str = "unknown";

/// An alternative document type the analysis model considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCandidate {
    pub document_type: String,
    pub confidence: f64,
}

impl TypeCandidate {
    pub fn new(document_type: impl Into<String>, confidence: f64) -> Result<Self, ModelError> {
        Ok(Self {
            document_type: document_type.into(),
            confidence: check_unit("type_candidate_confidence", confidence)?,
        })
    }
}

/// One attempt to analyze one document.
///
/// Field counts are derived from `fields` by [`AnalysisRun::set_fields`];
/// they are never assigned on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub document_id: Uuid,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub document_type: String,
    pub document_type_confidence: f64,
    pub alternative_types: Vec<TypeCandidate>,
    pub type_indicators: Vec<String>,
    pub template_matches: Vec<String>,
    pub fields: Vec<ExtractedField>,
    pub total_fields_detected: usize,
    pub high_confidence_fields: usize,
    pub requires_review_count: usize,
    pub overall_quality_score: f64,
    pub retry_count: u32,
    pub previous_run_id: Option<Uuid>,
    pub page_height: Option<f64>,
    pub error_detail: Option<String>,
}

impl AnalysisRun {
    /// Fresh run with placeholder values, created when analysis starts.
    pub fn placeholder(document_id: Uuid, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            model: model.into(),
            created_at: Utc::now(),
            document_type: UNKNOWN_DOCUMENT_TYPE.to_string(),
            document_type_confidence: 0.0,
            alternative_types: Vec::new(),
            type_indicators: Vec::new(),
            template_matches: Vec::new(),
            fields: Vec::new(),
            total_fields_detected: 0,
            high_confidence_fields: 0,
            requires_review_count: 0,
            overall_quality_score: 0.0,
            retry_count: 0,
            previous_run_id: None,
            page_height: None,
            error_detail: None,
        }
    }

    /// Replace the field list and recompute every derived count.
    pub fn set_fields(&mut self, fields: Vec<ExtractedField>) {
        self.fields = fields;
        self.total_fields_detected = self.fields.len();
        self.high_confidence_fields = self.fields.iter().filter(|f| f.is_high_confidence()).count();
        self.requires_review_count = self.fields.iter().filter(|f| f.requires_review).count();
    }

    pub fn set_document_type(
        &mut self,
        document_type: impl Into<String>,
        confidence: f64,
    ) -> Result<(), ModelError> {
        self.document_type_confidence = check_unit("document_type_confidence", confidence)?;
        self.document_type = document_type.into();
        Ok(())
    }

    pub fn set_quality(&mut self, score: f64) -> Result<(), ModelError> {
        self.overall_quality_score = check_unit("overall_quality_score", score)?;
        Ok(())
    }

    pub fn field(&self, id: &Uuid) -> Option<&ExtractedField> {
        self.fields.iter().find(|f| &f.id == id)
    }

    pub fn field_named(&self, name: &str) -> Option<&ExtractedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn mean_field_confidence(&self) -> f64 {
        let values: Vec<f64> = self.fields.iter().map(|f| f.overall_confidence).collect();
        mean(&values)
    }

    /// Verify count and range invariants, e.g. after reloading from storage.
    pub fn check_invariants(&self) -> Result<(), ModelError> {
        check_unit("document_type_confidence", self.document_type_confidence)?;
        check_unit("overall_quality_score", self.overall_quality_score)?;
        if self.total_fields_detected != self.fields.len() {
            return Err(ModelError::Invariant(format!(
                "total_fields_detected {} does not match {} fields",
                self.total_fields_detected,
                self.fields.len()
            )));
        }
        if self.high_confidence_fields > self.total_fields_detected {
            return Err(ModelError::Invariant(
                "high_confidence_fields exceeds total_fields_detected".into(),
            ));
        }
        if self.requires_review_count > self.total_fields_detected {
            return Err(ModelError::Invariant(
                "requires_review_count exceeds total_fields_detected".into(),
            ));
        }
        Ok(())
    }
}
