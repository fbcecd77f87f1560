use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::FormatKind;
use super::{check_unit, ModelError};

/// Rules at or above this confidence are recommended for the schema.
pub const RECOMMENDED_THRESHOLD: f64 = 0.7;

const SUPPORT_BOOST_PER_SAMPLE: f64 = 0.05;
const SUPPORT_BOOST_CAP: f64 = 0.2;
const CONTRADICTION_PENALTY_PER_SAMPLE: f64 = 0.1;
const CONTRADICTION_PENALTY_CAP: f64 = 0.4;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9()\-.\s]{7,20}$").unwrap());
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").unwrap());
static CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[$€£¥]\s?)?-?\d+(?:[.,]\d{3})*(?:[.,]\d{1,2})?(?:\s?(?:USD|EUR|GBP|JPY))?$")
        .unwrap()
});
static POSTAL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\- ]{2,9}$").unwrap());

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%d %B %Y",
    "%b %d, %Y",
];

/// Parse a date in any of the common document formats.
pub fn parse_document_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Parse a number, tolerating currency symbols, codes and thousands separators.
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c.is_whitespace())
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" || cleaned == "." {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

impl FormatKind {
    pub fn matches(&self, value: &str) -> bool {
        let value = value.trim();
        match self {
            Self::Email => EMAIL.is_match(value),
            Self::Phone => PHONE.is_match(value),
            Self::Date => parse_document_date(value).is_some(),
            Self::Url => URL.is_match(value),
            Self::Currency => CURRENCY.is_match(value),
            Self::PostalCode => POSTAL_CODE.is_match(value),
        }
    }
}

/// A typed validation constraint. The payload shape depends on the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleKind {
    Pattern { regex: String },
    Length { min_length: usize, max_length: usize },
    Range { min: f64, max: f64 },
    Format { format: FormatKind },
    Custom { payload: serde_json::Value },
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pattern { .. } => "pattern",
            Self::Length { .. } => "length",
            Self::Range { .. } => "range",
            Self::Format { .. } => "format",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            Self::Pattern { regex } => Regex::new(regex)
                .map(|_| ())
                .map_err(|e| ModelError::InvalidPattern {
                    pattern: regex.clone(),
                    reason: e.to_string(),
                }),
            Self::Length {
                min_length,
                max_length,
            } if min_length > max_length => Err(ModelError::InvalidBounds {
                kind: "length",
                min: *min_length as f64,
                max: *max_length as f64,
            }),
            Self::Range { min, max } if !min.is_finite() || !max.is_finite() || min > max => {
                Err(ModelError::InvalidBounds {
                    kind: "range",
                    min: *min,
                    max: *max,
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether a sample value satisfies this constraint. Custom rules cannot
    /// be evaluated locally and always pass.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Pattern { regex } => Regex::new(regex)
                .map(|re| re.is_match(value.trim()))
                .unwrap_or(false),
            Self::Length {
                min_length,
                max_length,
            } => {
                let len = value.trim().chars().count();
                len >= *min_length && len <= *max_length
            }
            Self::Range { min, max } => {
                parse_number(value).is_some_and(|n| n >= *min && n <= *max)
            }
            Self::Format { format } => format.matches(value),
            Self::Custom { .. } => true,
        }
    }
}

/// A proposed constraint for one extracted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRuleCandidate {
    pub id: Uuid,
    pub field_id: Uuid,
    pub kind: RuleKind,
    pub confidence: f64,
    pub is_recommended: bool,
    pub examples: Vec<String>,
    pub description: String,
}

impl ValidationRuleCandidate {
    pub fn new(
        field_id: Uuid,
        kind: RuleKind,
        confidence: f64,
        description: impl Into<String>,
    ) -> Result<Self, ModelError> {
        Self::with_id(Uuid::new_v4(), field_id, kind, confidence, description)
    }

    pub fn with_id(
        id: Uuid,
        field_id: Uuid,
        kind: RuleKind,
        confidence: f64,
        description: impl Into<String>,
    ) -> Result<Self, ModelError> {
        kind.validate()?;
        let confidence = check_unit("rule_confidence", confidence)?;
        Ok(Self {
            id,
            field_id,
            kind,
            confidence,
            is_recommended: confidence >= RECOMMENDED_THRESHOLD,
            examples: Vec::new(),
            description: description.into(),
        })
    }

    /// Adjust strength by sample evidence. Boosts and penalties are bounded
    /// and the result is clamped to `[0, 1]`.
    pub fn adjust_for_evidence(&mut self, supporting: usize, contradicting: usize) {
        let boost = (supporting as f64 * SUPPORT_BOOST_PER_SAMPLE).min(SUPPORT_BOOST_CAP);
        let penalty =
            (contradicting as f64 * CONTRADICTION_PENALTY_PER_SAMPLE).min(CONTRADICTION_PENALTY_CAP);
        self.confidence = (self.confidence + boost - penalty).clamp(0.0, 1.0);
        self.is_recommended = self.confidence >= RECOMMENDED_THRESHOLD;
    }

    /// Test each sample against the rule, keep matching samples as examples
    /// and adjust confidence accordingly.
    pub fn apply_samples(&mut self, samples: &[&str]) {
        let mut supporting = 0;
        let mut contradicting = 0;
        for sample in samples {
            if self.kind.matches(sample) {
                supporting += 1;
                let sample = sample.trim().to_string();
                if !self.examples.contains(&sample) {
                    self.examples.push(sample);
                }
            } else {
                contradicting += 1;
            }
        }
        self.adjust_for_evidence(supporting, contradicting);
    }
}
