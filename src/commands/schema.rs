//! Schema review commands.
//!
//! Read a generated schema draft with its derived analysis, and apply the
//! human review actions: field edits, accuracy feedback and status changes.
//! Every mutation loads, edits and saves the whole draft.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use super::CommandError;
use crate::core_state::CoreState;
use crate::models::{
    mean, ConfidenceLevel, FieldUpdate, ModifiedBy, ReviewStatus, SchemaDraft, ValidationStatus,
};

#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceAnalysis {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Field count per confidence level. Levels without fields are omitted.
    pub distribution: BTreeMap<String, usize>,
    pub fields_requiring_review: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityMetrics {
    pub total_fields: usize,
    pub high_confidence_fields: usize,
    pub fields_with_rules: usize,
    pub rule_coverage: f64,
    pub generation_confidence: f64,
    pub overall_accuracy: f64,
    pub feedback_count: usize,
    pub validation_status: ValidationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub field_name: String,
    pub confidence: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub status: ReviewStatus,
    pub last_modified_by: ModifiedBy,
    pub modified_fields: Vec<String>,
    pub user_modified: usize,
    pub items: Vec<ReviewItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDetails {
    pub schema: SchemaDraft,
    pub confidence_analysis: ConfidenceAnalysis,
    pub quality_metrics: QualityMetrics,
    pub review_summary: ReviewSummary,
}

pub fn get_schema_details(state: &CoreState, schema_id: Uuid) -> Result<SchemaDetails, CommandError> {
    let schema = load(state, schema_id)?;
    Ok(SchemaDetails {
        confidence_analysis: confidence_analysis(&schema),
        quality_metrics: quality_metrics(&schema),
        review_summary: review_summary(&schema),
        schema,
    })
}

/// Apply a human edit to one field.
pub fn update_schema_field(
    state: &CoreState,
    schema_id: Uuid,
    field_name: &str,
    update: FieldUpdate,
) -> Result<SchemaDraft, CommandError> {
    let mut schema = load(state, schema_id)?;
    schema.update_field(field_name, update)?;
    state.storage().save_schema(&schema)?;
    tracing::info!(schema_id = %schema_id, field = field_name, "Schema field updated by user");
    Ok(schema)
}

/// Record a user accuracy rating in [0, 1]. Returns the new overall accuracy.
pub fn record_accuracy_feedback(
    state: &CoreState,
    schema_id: Uuid,
    accuracy: f64,
) -> Result<f64, CommandError> {
    let mut schema = load(state, schema_id)?;
    schema.record_accuracy_feedback(accuracy)?;
    state.storage().save_schema(&schema)?;
    let overall = schema.calculate_overall_accuracy();
    tracing::info!(schema_id = %schema_id, accuracy, overall, "Accuracy feedback recorded");
    Ok(overall)
}

pub fn set_review_status(
    state: &CoreState,
    schema_id: Uuid,
    status: ReviewStatus,
) -> Result<SchemaDraft, CommandError> {
    let mut schema = load(state, schema_id)?;
    let from = schema.review_status();
    schema.set_review_status(status)?;
    state.storage().save_schema(&schema)?;
    tracing::info!(
        schema_id = %schema_id,
        from = from.as_str(),
        to = status.as_str(),
        "Review status changed"
    );
    Ok(schema)
}

fn load(state: &CoreState, schema_id: Uuid) -> Result<SchemaDraft, CommandError> {
    state
        .storage()
        .get_schema(&schema_id)?
        .ok_or(CommandError::NotFound {
            entity: "schema",
            id: schema_id,
        })
}

// ─────────────────────────────────────────────
// Derived views
// ─────────────────────────────────────────────

fn confidence_analysis(schema: &SchemaDraft) -> ConfidenceAnalysis {
    let scores: Vec<f64> = schema
        .fields()
        .values()
        .map(|f| f.ai_metadata.confidence_score)
        .collect();

    let mut distribution = BTreeMap::new();
    for score in &scores {
        *distribution
            .entry(ConfidenceLevel::from_score(*score).as_str().to_string())
            .or_insert(0) += 1;
    }

    let (min, max) = if scores.is_empty() {
        (0.0, 0.0)
    } else {
        (
            scores.iter().copied().fold(f64::INFINITY, f64::min),
            scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        )
    };

    ConfidenceAnalysis {
        mean: mean(&scores),
        min,
        max,
        distribution,
        fields_requiring_review: schema.fields_requiring_review().len(),
    }
}

fn quality_metrics(schema: &SchemaDraft) -> QualityMetrics {
    let total = schema.total_fields_generated();
    let fields_with_rules = schema
        .fields()
        .values()
        .filter(|f| !f.validation_rules.is_empty())
        .count();
    QualityMetrics {
        total_fields: total,
        high_confidence_fields: schema.high_confidence_fields(),
        fields_with_rules,
        rule_coverage: if total == 0 {
            0.0
        } else {
            fields_with_rules as f64 / total as f64
        },
        generation_confidence: schema.generation_confidence(),
        overall_accuracy: schema.calculate_overall_accuracy(),
        feedback_count: schema.accuracy_feedback().len(),
        validation_status: schema.validation_status,
    }
}

fn review_summary(schema: &SchemaDraft) -> ReviewSummary {
    let items = schema
        .fields_requiring_review()
        .into_iter()
        .map(|f| ReviewItem {
            field_name: f.name.clone(),
            confidence: f.ai_metadata.confidence_score,
            reason: f.ai_metadata.review_reason.clone(),
        })
        .collect();

    ReviewSummary {
        status: schema.review_status(),
        last_modified_by: schema.last_modified_by,
        modified_fields: schema.modified_fields().to_vec(),
        user_modified: schema
            .fields()
            .values()
            .filter(|f| f.ai_metadata.user_modified)
            .count(),
        items,
    }
}
