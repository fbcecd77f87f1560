use std::collections::HashMap;

use super::error::FieldEnhancementError;
use super::types::FieldEnhancer;
use crate::models::ExtractedField;

/// Normalize a field name to `snake_case` ASCII.
///
/// Runs of non-alphanumeric characters collapse into one underscore;
/// leading and trailing underscores are dropped.
pub fn normalize_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Default stage-3 implementation: name normalization, then merging of
/// fields that normalize to the same name.
///
/// The most confident duplicate survives and absorbs the others' names and
/// types as alternatives. First-appearance order is preserved.
#[derive(Debug, Default)]
pub struct StandardFieldEnhancer;

impl StandardFieldEnhancer {
    pub fn new() -> Self {
        Self
    }
}

impl FieldEnhancer for StandardFieldEnhancer {
    fn enhance(
        &self,
        fields: &[ExtractedField],
    ) -> Result<Vec<ExtractedField>, FieldEnhancementError> {
        let mut merged: Vec<ExtractedField> = Vec::with_capacity(fields.len());
        let mut index_by_name: HashMap<String, usize> = HashMap::new();

        for field in fields {
            let normalized = normalize_field_name(&field.name);
            if normalized.is_empty() {
                return Err(FieldEnhancementError::EmptyName { field_id: field.id });
            }

            let mut candidate = field.clone();
            if normalized != candidate.name {
                let original = std::mem::replace(&mut candidate.name, normalized.clone());
                candidate.add_alternative_name(original);
            }

            match index_by_name.get(&normalized) {
                Some(&i) => {
                    let existing = &mut merged[i];
                    if candidate.overall_confidence > existing.overall_confidence {
                        let weaker = std::mem::replace(existing, candidate);
                        absorb(existing, weaker);
                    } else {
                        absorb(existing, candidate);
                    }
                    tracing::debug!(field = %normalized, "Merged duplicate field");
                }
                None => {
                    index_by_name.insert(normalized, merged.len());
                    merged.push(candidate);
                }
            }
        }

        Ok(merged)
    }
}

/// Fold a weaker duplicate into the surviving field.
fn absorb(survivor: &mut ExtractedField, weaker: ExtractedField) {
    for name in weaker.alternative_names {
        survivor.add_alternative_name(name);
    }
    survivor.add_alternative_type(weaker.field_type);
    for field_type in weaker.alternative_types {
        survivor.add_alternative_type(field_type);
    }
    if survivor.sample_value.is_none() {
        survivor.sample_value = weaker.sample_value;
    }
    if survivor.bounding_box.is_none() {
        survivor.bounding_box = weaker.bounding_box;
    }
}
