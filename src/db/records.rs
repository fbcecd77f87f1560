//! Flat storage records.
//!
//! One record per table row: strings and numbers only, nested values
//! JSON-encoded. `from_record` re-validates through the model
//! constructors.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::DatabaseError;
use crate::models::{
    AnalysisRun, ConfidenceScores, DocumentKind, ExtractedField, FieldDraft, FieldType,
    ModifiedBy, ReviewStatus, RuleKind, SchemaDraft, ValidationRuleCandidate, ValidationStatus,
};
use crate::pipeline::types::PreparedDocument;

// ═══════════════════════════════════════════
// Column codecs
// ═══════════════════════════════════════════

pub(crate) fn parse_uuid(column: &'static str, value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|e| DatabaseError::Corrupt {
        column,
        reason: e.to_string(),
    })
}

fn parse_time(column: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            column,
            reason: e.to_string(),
        })
}

fn to_json<T: Serialize + ?Sized>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|source| DatabaseError::Encode { column, source })
}

fn from_json<T: DeserializeOwned>(column: &'static str, value: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(value).map_err(|e| DatabaseError::Corrupt {
        column,
        reason: e.to_string(),
    })
}

fn to_count(column: &'static str, value: i64) -> Result<usize, DatabaseError> {
    usize::try_from(value).map_err(|_| DatabaseError::Corrupt {
        column,
        reason: format!("negative count {value}"),
    })
}

// ═══════════════════════════════════════════
// documents
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub kind: String,
    pub pages: String,
    pub metadata: String,
    pub content_hash: String,
    pub payload_base64: Option<String>,
    pub page_height: Option<f64>,
    pub size_bytes: i64,
}

impl DocumentRecord {
    pub fn to_record(doc: &PreparedDocument) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: doc.document_id.to_string(),
            filename: doc.filename.clone(),
            kind: doc.kind.as_str().to_string(),
            pages: to_json("documents.pages", &doc.pages)?,
            metadata: to_json("documents.metadata", &doc.metadata)?,
            content_hash: doc.content_hash.clone(),
            payload_base64: doc.payload_base64.clone(),
            page_height: doc.page_height,
            size_bytes: doc.size_bytes as i64,
        })
    }

    pub fn from_record(record: &Self) -> Result<PreparedDocument, DatabaseError> {
        Ok(PreparedDocument {
            document_id: parse_uuid("documents.id", &record.id)?,
            filename: record.filename.clone(),
            kind: DocumentKind::from_str(&record.kind)?,
            pages: from_json("documents.pages", &record.pages)?,
            metadata: from_json("documents.metadata", &record.metadata)?,
            content_hash: record.content_hash.clone(),
            payload_base64: record.payload_base64.clone(),
            page_height: record.page_height,
            size_bytes: to_count("documents.size_bytes", record.size_bytes)?,
        })
    }
}

// ═══════════════════════════════════════════
// analysis_runs
// ═══════════════════════════════════════════

/// Run header. Fields live in [`ExtractedFieldRecord`] rows.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRunRecord {
    pub id: String,
    pub document_id: String,
    pub model: String,
    pub created_at: String,
    pub document_type: String,
    pub document_type_confidence: f64,
    pub alternative_types: String,
    pub type_indicators: String,
    pub template_matches: String,
    pub total_fields_detected: i64,
    pub high_confidence_fields: i64,
    pub requires_review_count: i64,
    pub overall_quality_score: f64,
    pub retry_count: i64,
    pub previous_run_id: Option<String>,
    pub page_height: Option<f64>,
    pub error_detail: Option<String>,
}

impl AnalysisRunRecord {
    pub fn to_record(run: &AnalysisRun) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: run.id.to_string(),
            document_id: run.document_id.to_string(),
            model: run.model.clone(),
            created_at: run.created_at.to_rfc3339(),
            document_type: run.document_type.clone(),
            document_type_confidence: run.document_type_confidence,
            alternative_types: to_json("analysis_runs.alternative_types", &run.alternative_types)?,
            type_indicators: to_json("analysis_runs.type_indicators", &run.type_indicators)?,
            template_matches: to_json("analysis_runs.template_matches", &run.template_matches)?,
            total_fields_detected: run.total_fields_detected as i64,
            high_confidence_fields: run.high_confidence_fields as i64,
            requires_review_count: run.requires_review_count as i64,
            overall_quality_score: run.overall_quality_score,
            retry_count: i64::from(run.retry_count),
            previous_run_id: run.previous_run_id.map(|id| id.to_string()),
            page_height: run.page_height,
            error_detail: run.error_detail.clone(),
        })
    }

    /// Rebuild the run around its already-decoded fields, in stored order.
    /// Stored counts must agree with the fields.
    pub fn from_record(
        record: &Self,
        fields: Vec<ExtractedField>,
    ) -> Result<AnalysisRun, DatabaseError> {
        let mut run = AnalysisRun::placeholder(
            parse_uuid("analysis_runs.document_id", &record.document_id)?,
            record.model.clone(),
        );
        run.id = parse_uuid("analysis_runs.id", &record.id)?;
        run.created_at = parse_time("analysis_runs.created_at", &record.created_at)?;
        run.set_document_type(record.document_type.clone(), record.document_type_confidence)?;
        run.alternative_types = from_json("analysis_runs.alternative_types", &record.alternative_types)?;
        run.type_indicators = from_json("analysis_runs.type_indicators", &record.type_indicators)?;
        run.template_matches = from_json("analysis_runs.template_matches", &record.template_matches)?;
        run.set_fields(fields);
        run.set_quality(record.overall_quality_score)?;
        run.retry_count = u32::try_from(record.retry_count).map_err(|_| DatabaseError::Corrupt {
            column: "analysis_runs.retry_count",
            reason: format!("out of range {}", record.retry_count),
        })?;
        run.previous_run_id = record
            .previous_run_id
            .as_deref()
            .map(|id| parse_uuid("analysis_runs.previous_run_id", id))
            .transpose()?;
        run.page_height = record.page_height;
        run.error_detail = record.error_detail.clone();

        let stored = (
            to_count("analysis_runs.total_fields_detected", record.total_fields_detected)?,
            to_count("analysis_runs.high_confidence_fields", record.high_confidence_fields)?,
            to_count("analysis_runs.requires_review_count", record.requires_review_count)?,
        );
        let derived = (
            run.total_fields_detected,
            run.high_confidence_fields,
            run.requires_review_count,
        );
        if stored != derived {
            return Err(DatabaseError::Corrupt {
                column: "analysis_runs.total_fields_detected",
                reason: format!("stored counts {stored:?} disagree with fields {derived:?}"),
            });
        }
        Ok(run)
    }
}

// ═══════════════════════════════════════════
// extracted_fields
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFieldRecord {
    pub id: String,
    pub run_id: String,
    pub position: i64,
    pub name: String,
    pub field_type: String,
    pub sample_value: Option<String>,
    pub visual_clarity: f64,
    pub label_confidence: f64,
    pub value_confidence: f64,
    pub type_confidence: f64,
    pub context_confidence: f64,
    pub overall_confidence: f64,
    pub bounding_box: Option<String>,
    pub requires_review: bool,
    pub review_reason: Option<String>,
    pub alternative_names: String,
    pub alternative_types: String,
}

impl ExtractedFieldRecord {
    pub fn to_record(field: &ExtractedField, run_id: &Uuid, position: usize) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: field.id.to_string(),
            run_id: run_id.to_string(),
            position: position as i64,
            name: field.name.clone(),
            field_type: field.field_type.as_str().to_string(),
            sample_value: field.sample_value.clone(),
            visual_clarity: field.scores.visual_clarity,
            label_confidence: field.scores.label_confidence,
            value_confidence: field.scores.value_confidence,
            type_confidence: field.scores.type_confidence,
            context_confidence: field.scores.context_confidence,
            overall_confidence: field.overall_confidence,
            bounding_box: field
                .bounding_box
                .as_ref()
                .map(|b| to_json("extracted_fields.bounding_box", b))
                .transpose()?,
            requires_review: field.requires_review,
            review_reason: field.review_reason.clone(),
            alternative_names: to_json("extracted_fields.alternative_names", &field.alternative_names)?,
            alternative_types: to_json("extracted_fields.alternative_types", &field.alternative_types)?,
        })
    }

    pub fn from_record(record: &Self) -> Result<ExtractedField, DatabaseError> {
        let scores = ConfidenceScores::new(
            record.visual_clarity,
            record.label_confidence,
            record.value_confidence,
            record.type_confidence,
            record.context_confidence,
        );
        let mut draft = FieldDraft::new(
            record.name.clone(),
            FieldType::from_str(&record.field_type)?,
            scores,
        )
        .with_overall(record.overall_confidence)
        .with_review(record.requires_review, record.review_reason.clone());
        draft.sample_value = record.sample_value.clone();
        draft.bounding_box = record
            .bounding_box
            .as_deref()
            .map(|b| from_json("extracted_fields.bounding_box", b))
            .transpose()?;
        draft.alternative_names = from_json("extracted_fields.alternative_names", &record.alternative_names)?;
        draft.alternative_types = from_json("extracted_fields.alternative_types", &record.alternative_types)?;

        let id = parse_uuid("extracted_fields.id", &record.id)?;
        Ok(ExtractedField::with_id(id, draft)?)
    }
}

// ═══════════════════════════════════════════
// validation_rules
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRuleRecord {
    pub id: String,
    pub field_id: String,
    /// Tag of `rule`, kept as its own column for filtering.
    pub rule_type: String,
    pub rule: String,
    pub confidence: f64,
    pub is_recommended: bool,
    pub examples: String,
    pub description: String,
}

impl ValidationRuleRecord {
    pub fn to_record(rule: &ValidationRuleCandidate) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: rule.id.to_string(),
            field_id: rule.field_id.to_string(),
            rule_type: rule.kind.name().to_string(),
            rule: to_json("validation_rules.rule", &rule.kind)?,
            confidence: rule.confidence,
            is_recommended: rule.is_recommended,
            examples: to_json("validation_rules.examples", &rule.examples)?,
            description: rule.description.clone(),
        })
    }

    pub fn from_record(record: &Self) -> Result<ValidationRuleCandidate, DatabaseError> {
        let kind: RuleKind = from_json("validation_rules.rule", &record.rule)?;
        if kind.name() != record.rule_type {
            return Err(DatabaseError::Corrupt {
                column: "validation_rules.rule_type",
                reason: format!("{} does not match rule {}", record.rule_type, kind.name()),
            });
        }
        let mut rule = ValidationRuleCandidate::with_id(
            parse_uuid("validation_rules.id", &record.id)?,
            parse_uuid("validation_rules.field_id", &record.field_id)?,
            kind,
            record.confidence,
            record.description.clone(),
        )?;
        rule.examples = from_json("validation_rules.examples", &record.examples)?;
        Ok(rule)
    }
}

// ═══════════════════════════════════════════
// schema_drafts
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDraftRecord {
    pub id: String,
    pub run_id: String,
    pub document_id: String,
    pub name: String,
    pub fields: String,
    pub total_fields_generated: i64,
    pub high_confidence_fields: i64,
    pub generation_confidence: f64,
    pub validation_status: String,
    pub review_status: String,
    pub last_modified_by: String,
    pub modified_fields: String,
    pub accuracy_feedback: String,
    pub created_at: String,
    pub updated_at: String,
}

impl SchemaDraftRecord {
    pub fn to_record(schema: &SchemaDraft) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: schema.id.to_string(),
            run_id: schema.run_id.to_string(),
            document_id: schema.document_id.to_string(),
            name: schema.name.clone(),
            fields: to_json("schema_drafts.fields", schema.fields())?,
            total_fields_generated: schema.total_fields_generated() as i64,
            high_confidence_fields: schema.high_confidence_fields() as i64,
            generation_confidence: schema.generation_confidence(),
            validation_status: schema.validation_status.as_str().to_string(),
            review_status: schema.review_status().as_str().to_string(),
            last_modified_by: schema.last_modified_by.as_str().to_string(),
            modified_fields: to_json("schema_drafts.modified_fields", schema.modified_fields())?,
            accuracy_feedback: to_json("schema_drafts.accuracy_feedback", schema.accuracy_feedback())?,
            created_at: schema.created_at.to_rfc3339(),
            updated_at: schema.updated_at.to_rfc3339(),
        })
    }

    /// Derived totals are recomputed from the fields, not read back.
    pub fn from_record(record: &Self) -> Result<SchemaDraft, DatabaseError> {
        Ok(SchemaDraft::restore(
            parse_uuid("schema_drafts.id", &record.id)?,
            parse_uuid("schema_drafts.run_id", &record.run_id)?,
            parse_uuid("schema_drafts.document_id", &record.document_id)?,
            record.name.clone(),
            from_json("schema_drafts.fields", &record.fields)?,
            ValidationStatus::from_str(&record.validation_status)?,
            ReviewStatus::from_str(&record.review_status)?,
            ModifiedBy::from_str(&record.last_modified_by)?,
            from_json("schema_drafts.modified_fields", &record.modified_fields)?,
            from_json("schema_drafts.accuracy_feedback", &record.accuracy_feedback)?,
            parse_time("schema_drafts.created_at", &record.created_at)?,
            parse_time("schema_drafts.updated_at", &record.updated_at)?,
        )?)
    }
}
