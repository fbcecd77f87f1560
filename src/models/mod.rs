//! Domain model: analysis runs, extracted fields, validation rule
//! candidates and schema drafts.
//!
//! Every type is built through a validating constructor that returns
//! `Result<_, ModelError>`. Range checks happen once, at construction.

pub mod enums;
pub mod field;
pub mod rule;
pub mod run;
pub mod schema;

pub use enums::*;
pub use field::*;
pub use rule::*;
pub use run::*;
pub use schema::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Invalid regular expression '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid bounds for {kind} rule: min {min} > max {max}")]
    InvalidBounds {
        kind: &'static str,
        min: f64,
        max: f64,
    },

    #[error("Invalid review transition from {from} to {to}")]
    InvalidTransition { from: ReviewStatus, to: ReviewStatus },

    #[error("Schema field not found: {0}")]
    FieldNotFound(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Reject anything outside `[0, 1]`, including NaN and infinities.
pub(crate) fn check_unit(field: &'static str, value: f64) -> Result<f64, ModelError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ModelError::OutOfRange { field, value })
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_unit_accepts_bounds() {
        assert_eq!(check_unit("x", 0.0), Ok(0.0));
        assert_eq!(check_unit("x", 1.0), Ok(1.0));
    }

    #[test]
    fn check_unit_rejects_nan_and_overflow() {
        assert!(check_unit("x", f64::NAN).is_err());
        assert!(check_unit("x", 1.01).is_err());
        assert!(check_unit("x", -0.01).is_err());
    }

    #[test]
    fn std_dev_of_constant_is_zero() {
        assert_eq!(std_dev(&[0.5, 0.5, 0.5]), 0.0);
        assert!((std_dev(&[0.0, 1.0]) - 0.5).abs() < 1e-12);
    }
}
