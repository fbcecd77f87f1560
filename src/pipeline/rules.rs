//! Validation rule inference.
//!
//! Each field gets zero or more typed rule candidates derived from its type,
//! its name and its sample value. Candidate strength starts from a per-kind
//! base and is then adjusted by sample evidence.

use super::error::ValidationInferenceError;
use super::types::{RuleInferencer, RuleSet};
use crate::models::rule::parse_number;
use crate::models::{ExtractedField, FieldType, FormatKind, RuleKind, ValidationRuleCandidate};

const FORMAT_BASE: f64 = 0.75;
const PATTERN_BASE: f64 = 0.65;
const LENGTH_BASE: f64 = 0.5;
const RANGE_BASE: f64 = 0.45;
const BOOLEAN_BASE: f64 = 0.7;

/// Fields with a sample longer than this get no inferred pattern.
const MAX_PATTERN_SAMPLE: usize = 40;

/// Default stage-4 implementation.
#[derive(Debug, Default)]
pub struct ValidationRuleInferenceEngine;

impl ValidationRuleInferenceEngine {
    pub fn new() -> Self {
        Self
    }

    /// Propose rule candidates for one field, evidence already applied.
    pub fn infer_field(
        &self,
        field: &ExtractedField,
    ) -> Result<Vec<ValidationRuleCandidate>, ValidationInferenceError> {
        let sample = field.sample_value.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let mut proposals: Vec<(RuleKind, f64, String)> = Vec::new();

        if let Some(format) = format_for(field) {
            proposals.push((
                RuleKind::Format { format },
                FORMAT_BASE,
                format!("{} must be a valid {}", field.name, format.as_str().replace('_', " ")),
            ));
        }

        match field.field_type {
            FieldType::Identifier => {
                if let Some(regex) = sample.and_then(generalize_pattern) {
                    proposals.push((
                        RuleKind::Pattern { regex },
                        PATTERN_BASE,
                        format!("{} follows the observed identifier layout", field.name),
                    ));
                }
            }
            FieldType::Number | FieldType::Currency => {
                if let Some((min, max)) = sample.and_then(parse_number).and_then(plausible_range) {
                    proposals.push((
                        RuleKind::Range { min, max },
                        RANGE_BASE,
                        format!("{} expected between {min} and {max}", field.name),
                    ));
                }
            }
            FieldType::Boolean => proposals.push((
                RuleKind::Pattern {
                    regex: r"^(?i)(true|false|yes|no|y|n|x)$".to_string(),
                },
                BOOLEAN_BASE,
                format!("{} is a yes/no value", field.name),
            )),
            FieldType::Text | FieldType::Address | FieldType::Other => {
                let max_length = sample
                    .map(|s| (s.chars().count() * 4).max(50))
                    .unwrap_or(255);
                proposals.push((
                    RuleKind::Length {
                        min_length: 1,
                        max_length,
                    },
                    LENGTH_BASE,
                    format!("{} must be between 1 and {max_length} characters", field.name),
                ));
            }
            _ => {}
        }

        let mut candidates = Vec::with_capacity(proposals.len());
        for (kind, base, description) in proposals {
            let mut candidate = match ValidationRuleCandidate::new(field.id, kind, base, description) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(field = %field.name, error = %e, "Skipping invalid rule candidate");
                    continue;
                }
            };
            if let Some(sample) = sample {
                candidate.apply_samples(&[sample]);
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }
}

impl RuleInferencer for ValidationRuleInferenceEngine {
    fn infer(&self, fields: &[ExtractedField]) -> Result<RuleSet, ValidationInferenceError> {
        let mut rules = RuleSet::new();
        for field in fields {
            let candidates = self.infer_field(field)?;
            if !candidates.is_empty() {
                rules.insert(field.id, candidates);
            }
        }
        tracing::debug!(
            fields = fields.len(),
            fields_with_rules = rules.len(),
            "Validation rules inferred"
        );
        Ok(rules)
    }
}

fn format_for(field: &ExtractedField) -> Option<FormatKind> {
    let name = field.name.to_ascii_lowercase();
    if name.contains("zip") || name.contains("postal") || name.contains("postcode") {
        return Some(FormatKind::PostalCode);
    }
    match field.field_type {
        FieldType::Email => Some(FormatKind::Email),
        FieldType::Phone => Some(FormatKind::Phone),
        FieldType::Date => Some(FormatKind::Date),
        FieldType::Url => Some(FormatKind::Url),
        FieldType::Currency => Some(FormatKind::Currency),
        _ => None,
    }
}

/// Generalize a sample into a character-class pattern, e.g.
/// `INV-2024-001` becomes `^[A-Z]{3}-\d{4}-\d{3}$`.
pub fn generalize_pattern(sample: &str) -> Option<String> {
    if sample.is_empty() || sample.chars().count() > MAX_PATTERN_SAMPLE {
        return None;
    }

    let mut pattern = String::from("^");
    let mut chars = sample.chars().peekable();
    while let Some(c) = chars.next() {
        let class = char_class(c);
        let mut run = 1;
        while chars.peek().is_some_and(|next| char_class(*next) == class && class.is_some()) {
            chars.next();
            run += 1;
        }
        match class {
            Some(class) if run > 1 => pattern.push_str(&format!("{class}{{{run}}}")),
            Some(class) => pattern.push_str(class),
            None => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Some(pattern)
}

fn char_class(c: char) -> Option<&'static str> {
    if c.is_ascii_digit() {
        Some(r"\d")
    } else if c.is_ascii_uppercase() {
        Some("[A-Z]")
    } else if c.is_ascii_lowercase() {
        Some("[a-z]")
    } else {
        None
    }
}

/// Order-of-magnitude bounds around an observed value. None when the
/// bounds would not be finite.
fn plausible_range(value: f64) -> Option<(f64, f64)> {
    let magnitude = value.abs().max(1.0) * 10.0;
    if !value.is_finite() || !magnitude.is_finite() {
        return None;
    }
    if value < 0.0 {
        Some((-magnitude, magnitude))
    } else {
        Some((0.0, magnitude))
    }
}
