use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{FieldType, ModifiedBy, ReviewStatus, ValidationStatus};
use super::field::HIGH_CONFIDENCE_THRESHOLD;
use super::rule::RuleKind;
use super::{check_unit, mean, ModelError};

/// Where a schema field came from and how much the model trusted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiProvenance {
    pub source_field_id: Uuid,
    pub confidence_score: f64,
    pub requires_review: bool,
    pub review_reason: Option<String>,
    pub user_modified: bool,
}

/// Configuration of one field in a schema draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaFieldConfig {
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub validation_rules: Vec<RuleKind>,
    pub last_modified_by: ModifiedBy,
    pub ai_metadata: AiProvenance,
}

/// Changes a human author can make to a schema field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub label: Option<String>,
    pub field_type: Option<FieldType>,
    pub required: Option<bool>,
    pub validation_rules: Option<Vec<RuleKind>>,
}

/// The reviewable schema produced from one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaDraft {
    pub id: Uuid,
    pub run_id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    fields: BTreeMap<String, SchemaFieldConfig>,
    total_fields_generated: usize,
    high_confidence_fields: usize,
    generation_confidence: f64,
    pub validation_status: ValidationStatus,
    review_status: ReviewStatus,
    pub last_modified_by: ModifiedBy,
    modified_fields: Vec<String>,
    accuracy_feedback: Vec<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaDraft {
    pub fn new(run_id: Uuid, document_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            document_id,
            name: name.into(),
            fields: BTreeMap::new(),
            total_fields_generated: 0,
            high_confidence_fields: 0,
            generation_confidence: 0.0,
            validation_status: ValidationStatus::Pending,
            review_status: ReviewStatus::Pending,
            last_modified_by: ModifiedBy::Ai,
            modified_fields: Vec::new(),
            accuracy_feedback: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, SchemaFieldConfig> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaFieldConfig> {
        self.fields.get(name)
    }

    pub fn total_fields_generated(&self) -> usize {
        self.total_fields_generated
    }

    pub fn high_confidence_fields(&self) -> usize {
        self.high_confidence_fields
    }

    pub fn generation_confidence(&self) -> f64 {
        self.generation_confidence
    }

    pub fn review_status(&self) -> ReviewStatus {
        self.review_status
    }

    pub fn modified_fields(&self) -> &[String] {
        &self.modified_fields
    }

    pub fn accuracy_feedback(&self) -> &[f64] {
        &self.accuracy_feedback
    }

    /// Insert a field, suffixing the name on collision. Returns the name
    /// actually used.
    pub fn add_field(&mut self, mut config: SchemaFieldConfig) -> Result<String, ModelError> {
        check_unit("confidence_score", config.ai_metadata.confidence_score)?;
        let mut name = config.name.clone();
        let mut suffix = 2;
        while self.fields.contains_key(&name) {
            name = format!("{}_{suffix}", config.name);
            suffix += 1;
        }
        config.name = name.clone();
        self.fields.insert(name.clone(), config);
        self.recalculate();
        Ok(name)
    }

    pub fn remove_field(&mut self, name: &str) -> Option<SchemaFieldConfig> {
        let removed = self.fields.remove(name);
        if removed.is_some() {
            self.recalculate();
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Apply a human edit. The AI confidence is kept alongside the
    /// `user_modified` tag.
    pub fn update_field(&mut self, name: &str, update: FieldUpdate) -> Result<(), ModelError> {
        let field = self
            .fields
            .get_mut(name)
            .ok_or_else(|| ModelError::FieldNotFound(name.to_string()))?;

        if let Some(rules) = &update.validation_rules {
            for rule in rules {
                rule.validate()?;
            }
        }

        if let Some(label) = update.label {
            field.label = label;
        }
        if let Some(field_type) = update.field_type {
            field.field_type = field_type;
        }
        if let Some(required) = update.required {
            field.required = required;
        }
        if let Some(rules) = update.validation_rules {
            field.validation_rules = rules;
        }
        field.last_modified_by = ModifiedBy::User;
        field.ai_metadata.user_modified = true;

        self.last_modified_by = ModifiedBy::User;
        if !self.modified_fields.iter().any(|f| f == name) {
            self.modified_fields.push(name.to_string());
        }
        self.recalculate();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_accuracy_feedback(&mut self, accuracy: f64) -> Result<(), ModelError> {
        self.accuracy_feedback.push(check_unit("accuracy_feedback", accuracy)?);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mean AI confidence averaged with the mean of user accuracy feedback,
    /// when any has been recorded.
    pub fn calculate_overall_accuracy(&self) -> f64 {
        let ai: Vec<f64> = self
            .fields
            .values()
            .map(|f| f.ai_metadata.confidence_score)
            .collect();
        let ai_mean = mean(&ai);
        if self.accuracy_feedback.is_empty() {
            ai_mean
        } else {
            (ai_mean + mean(&self.accuracy_feedback)) / 2.0
        }
    }

    pub fn set_review_status(&mut self, next: ReviewStatus) -> Result<(), ModelError> {
        if !self.review_status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.review_status,
                to: next,
            });
        }
        self.review_status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fields_requiring_review(&self) -> Vec<&SchemaFieldConfig> {
        self.fields
            .values()
            .filter(|f| f.ai_metadata.requires_review)
            .collect()
    }

    /// Counts and generation confidence always come from the field map.
    fn recalculate(&mut self) {
        self.total_fields_generated = self.fields.len();
        self.high_confidence_fields = self
            .fields
            .values()
            .filter(|f| f.ai_metadata.confidence_score >= HIGH_CONFIDENCE_THRESHOLD)
            .count();
        let confidences: Vec<f64> = self
            .fields
            .values()
            .map(|f| f.ai_metadata.confidence_score)
            .collect();
        self.generation_confidence = mean(&confidences);
    }

    /// Rebuild a draft from persisted parts. Derived values are recomputed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: Uuid,
        run_id: Uuid,
        document_id: Uuid,
        name: String,
        fields: BTreeMap<String, SchemaFieldConfig>,
        validation_status: ValidationStatus,
        review_status: ReviewStatus,
        last_modified_by: ModifiedBy,
        modified_fields: Vec<String>,
        accuracy_feedback: Vec<f64>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        for feedback in &accuracy_feedback {
            check_unit("accuracy_feedback", *feedback)?;
        }
        for field in fields.values() {
            check_unit("confidence_score", field.ai_metadata.confidence_score)?;
        }
        let mut draft = Self {
            id,
            run_id,
            document_id,
            name,
            fields,
            total_fields_generated: 0,
            high_confidence_fields: 0,
            generation_confidence: 0.0,
            validation_status,
            review_status,
            last_modified_by,
            modified_fields,
            accuracy_feedback,
            created_at,
            updated_at,
        };
        draft.recalculate();
        Ok(draft)
    }
}
