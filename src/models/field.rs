use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::FieldType;
use super::{check_unit, ModelError};

/// Fields below this overall confidence are flagged for review.
pub const REVIEW_THRESHOLD: f64 = 0.6;

/// Fields at or above this overall confidence count as high confidence.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.8;

pub const DEFAULT_REVIEW_REASON: &str = "low overall confidence";

/// The five independent confidence dimensions reported per field.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub visual_clarity: f64,
    pub label_confidence: f64,
    pub value_confidence: f64,
    pub type_confidence: f64,
    pub context_confidence: f64,
}

impl ConfidenceScores {
    pub fn new(
        visual_clarity: f64,
        label_confidence: f64,
        value_confidence: f64,
        type_confidence: f64,
        context_confidence: f64,
    ) -> Self {
        Self {
            visual_clarity,
            label_confidence,
            value_confidence,
            type_confidence,
            context_confidence,
        }
    }

    /// Same value on every dimension.
    pub fn uniform(value: f64) -> Self {
        Self::new(value, value, value, value, value)
    }

    fn named(&self) -> [(&'static str, f64); 5] {
        [
            ("visual_clarity", self.visual_clarity),
            ("label_confidence", self.label_confidence),
            ("value_confidence", self.value_confidence),
            ("type_confidence", self.type_confidence),
            ("context_confidence", self.context_confidence),
        ]
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, value) in self.named() {
            check_unit(name, value)?;
        }
        Ok(())
    }

    /// Mean of the non-zero dimensions; 0.0 when every dimension is zero.
    pub fn derived_overall(&self) -> f64 {
        let non_zero: Vec<f64> = self
            .named()
            .iter()
            .map(|(_, v)| *v)
            .filter(|v| *v > 0.0)
            .collect();
        super::mean(&non_zero)
    }
}

/// Location of a field on the page, in page pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Unvalidated input for [`ExtractedField::new`].
#[derive(Debug, Clone)]
pub struct FieldDraft {
    pub name: String,
    pub field_type: FieldType,
    pub sample_value: Option<String>,
    pub scores: ConfidenceScores,
    /// Explicit overall confidence; derived from `scores` when absent.
    pub overall_confidence: Option<f64>,
    pub bounding_box: Option<BoundingBox>,
    /// Explicit review flag; derived by [`derive_review_flag`] when absent.
    pub requires_review: Option<bool>,
    pub review_reason: Option<String>,
    pub alternative_names: Vec<String>,
    pub alternative_types: Vec<FieldType>,
}

impl FieldDraft {
    pub fn new(name: impl Into<String>, field_type: FieldType, scores: ConfidenceScores) -> Self {
        Self {
            name: name.into(),
            field_type,
            sample_value: None,
            scores,
            overall_confidence: None,
            bounding_box: None,
            requires_review: None,
            review_reason: None,
            alternative_names: Vec::new(),
            alternative_types: Vec::new(),
        }
    }

    pub fn with_sample(mut self, value: impl Into<String>) -> Self {
        self.sample_value = Some(value.into());
        self
    }

    pub fn with_overall(mut self, overall: f64) -> Self {
        self.overall_confidence = Some(overall);
        self
    }

    pub fn with_bounding_box(mut self, bbox: BoundingBox) -> Self {
        self.bounding_box = Some(bbox);
        self
    }

    pub fn with_review(mut self, requires_review: bool, reason: Option<String>) -> Self {
        self.requires_review = Some(requires_review);
        self.review_reason = reason;
        self
    }
}

/// One candidate field proposed by the analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub id: Uuid,
    pub name: String,
    pub field_type: FieldType,
    pub sample_value: Option<String>,
    pub scores: ConfidenceScores,
    pub overall_confidence: f64,
    pub bounding_box: Option<BoundingBox>,
    pub requires_review: bool,
    pub review_reason: Option<String>,
    pub alternative_names: Vec<String>,
    pub alternative_types: Vec<FieldType>,
}

impl ExtractedField {
    pub fn new(draft: FieldDraft) -> Result<Self, ModelError> {
        Self::with_id(Uuid::new_v4(), draft)
    }

    /// Build a field with a known id (storage reload, tests).
    pub fn with_id(id: Uuid, draft: FieldDraft) -> Result<Self, ModelError> {
        draft.scores.validate()?;
        let overall = match draft.overall_confidence {
            Some(explicit) => check_unit("overall_confidence", explicit)?,
            None => draft.scores.derived_overall(),
        };

        let mut field = Self {
            id,
            name: draft.name,
            field_type: draft.field_type,
            sample_value: draft.sample_value,
            scores: draft.scores,
            overall_confidence: overall,
            bounding_box: draft.bounding_box,
            requires_review: draft.requires_review.unwrap_or(false),
            review_reason: draft.review_reason,
            alternative_names: Vec::new(),
            alternative_types: Vec::new(),
        };

        if draft.requires_review.is_none() {
            field.requires_review = derive_review_flag(&field);
            if field.requires_review && field.review_reason.is_none() {
                field.review_reason = Some(DEFAULT_REVIEW_REASON.to_string());
            }
        }

        for name in draft.alternative_names {
            field.add_alternative_name(name);
        }
        for field_type in draft.alternative_types {
            field.add_alternative_type(field_type);
        }

        Ok(field)
    }

    pub fn is_high_confidence(&self) -> bool {
        self.overall_confidence >= HIGH_CONFIDENCE_THRESHOLD
    }

    /// Append an alternative name unless it is already known.
    pub fn add_alternative_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name != self.name && !self.alternative_names.contains(&name) {
            self.alternative_names.push(name);
        }
    }

    /// Append an alternative type unless it is already known.
    pub fn add_alternative_type(&mut self, field_type: FieldType) {
        if field_type != self.field_type && !self.alternative_types.contains(&field_type) {
            self.alternative_types.push(field_type);
        }
    }

    /// First token of the name, used to group related fields.
    pub fn name_group(&self) -> &str {
        self.name
            .split(|c: char| c == '_' || c == ' ' || c == '-')
            .find(|t| !t.is_empty())
            .unwrap_or("")
    }
}

/// Review rule applied once after construction when no explicit flag was set.
pub fn derive_review_flag(field: &ExtractedField) -> bool {
    field.overall_confidence < REVIEW_THRESHOLD
}
