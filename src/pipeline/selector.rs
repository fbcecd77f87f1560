use super::error::SchemaGenerationError;
use super::types::{RuleSet, SchemaBuilder};
use crate::models::{
    AiProvenance, AnalysisRun, ExtractedField, ModifiedBy, RuleKind, SchemaDraft,
    SchemaFieldConfig, ValidationStatus,
};

/// Default stage-5 implementation.
///
/// A field is promoted when its overall confidence reaches the threshold.
/// With `include_low_confidence` every field is promoted and those below
/// the threshold are flagged for review.
#[derive(Debug, Default)]
pub struct SchemaFieldSelector;

impl SchemaFieldSelector {
    pub fn new() -> Self {
        Self
    }
}

impl SchemaBuilder for SchemaFieldSelector {
    fn select(
        &self,
        run: &AnalysisRun,
        rules: &RuleSet,
        threshold: f64,
        include_low_confidence: bool,
    ) -> Result<SchemaDraft, SchemaGenerationError> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(SchemaGenerationError::InvalidThreshold(threshold));
        }

        let mut draft = SchemaDraft::new(run.id, run.document_id, schema_name(run));
        let mut with_rules = 0usize;
        let mut included = 0usize;

        for field in &run.fields {
            let above = field.overall_confidence >= threshold;
            if !above && !include_low_confidence {
                continue;
            }

            let validation_rules: Vec<RuleKind> = rules
                .get(&field.id)
                .map(|candidates| {
                    candidates
                        .iter()
                        .filter(|r| r.is_recommended)
                        .map(|r| r.kind.clone())
                        .collect()
                })
                .unwrap_or_default();
            if !validation_rules.is_empty() {
                with_rules += 1;
            }

            draft.add_field(field_config(field, validation_rules, above, threshold))?;
            included += 1;
        }

        draft.validation_status = match with_rules {
            0 => ValidationStatus::Pending,
            n if n == included => ValidationStatus::Complete,
            _ => ValidationStatus::Partial,
        };

        tracing::debug!(
            run_id = %run.id,
            threshold,
            included,
            skipped = run.fields.len() - included,
            "Schema fields selected"
        );
        Ok(draft)
    }
}

fn field_config(
    field: &ExtractedField,
    validation_rules: Vec<RuleKind>,
    above_threshold: bool,
    threshold: f64,
) -> SchemaFieldConfig {
    let (requires_review, review_reason) = if above_threshold {
        (field.requires_review, field.review_reason.clone())
    } else {
        (
            true,
            Some(format!(
                "confidence {:.2} below threshold {:.2}",
                field.overall_confidence, threshold
            )),
        )
    };

    SchemaFieldConfig {
        name: field.name.clone(),
        label: humanize(&field.name),
        field_type: field.field_type,
        required: field.is_high_confidence(),
        validation_rules,
        last_modified_by: ModifiedBy::Ai,
        ai_metadata: AiProvenance {
            source_field_id: field.id,
            confidence_score: field.overall_confidence,
            requires_review,
            review_reason,
            user_modified: false,
        },
    }
}

fn schema_name(run: &AnalysisRun) -> String {
    format!("{} schema", humanize(&run.document_type))
}

/// `invoice_number` -> `Invoice number`
fn humanize(name: &str) -> String {
    let spaced = name.replace(['_', '-'], " ");
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
