//! Retry with an alternate model.
//!
//! Retries are always caller-initiated. The strategy picks the next model
//! from an injected rotation, stamps retry lineage on the new run and
//! compares the two runs field by field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::AnalysisRun;

/// Runs whose quality score falls below this are candidates for a retry.
pub const DEFAULT_LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    #[error("Cannot {action} while retry session is {from:?}")]
    InvalidTransition {
        from: RetryState,
        action: &'static str,
    },
}

/// Lifecycle of one retry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Initial,
    Analyzed,
    LowConfidence,
    Retried,
    Compared,
}

/// Ordered model rotation. The model after the last wraps to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRotation {
    models: Vec<String>,
}

impl ModelRotation {
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Next model after `current`. Unknown models start the rotation over;
    /// an empty rotation repeats the current model.
    pub fn next_after(&self, current: &str) -> String {
        match self.models.iter().position(|m| m == current) {
            Some(i) => self.models[(i + 1) % self.models.len()].clone(),
            None => self
                .models
                .first()
                .cloned()
                .unwrap_or_else(|| current.to_string()),
        }
    }
}

/// What a retry should run with.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPlan {
    pub model: String,
    pub retry_count: u32,
    pub previous_run_id: Uuid,
}

/// Field-level comparison of a retried run against its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunComparison {
    pub previous_run_id: Uuid,
    pub retried_run_id: Uuid,
    pub improvements: Vec<String>,
    /// Retried field id -> signed confidence delta, for fields present by
    /// name in both runs.
    pub confidence_changes: BTreeMap<Uuid, f64>,
    pub overall_delta: f64,
    pub improved: bool,
}

#[derive(Debug, Clone)]
pub struct RetryAnalysisStrategy {
    rotation: ModelRotation,
    low_confidence_threshold: f64,
}

impl RetryAnalysisStrategy {
    pub fn new(rotation: ModelRotation, low_confidence_threshold: f64) -> Self {
        Self {
            rotation,
            low_confidence_threshold,
        }
    }

    pub fn rotation(&self) -> &ModelRotation {
        &self.rotation
    }

    /// Low-confidence check for upstream surfacing. Never triggers a retry.
    pub fn is_low_confidence(&self, run: &AnalysisRun) -> bool {
        is_low_confidence(run, self.low_confidence_threshold)
    }

    /// An explicit caller model wins over the rotation.
    pub fn plan(&self, previous: &AnalysisRun, requested_model: Option<&str>) -> RetryPlan {
        let model = match requested_model.map(str::trim).filter(|m| !m.is_empty()) {
            Some(model) => model.to_string(),
            None => self.rotation.next_after(&previous.model),
        };
        RetryPlan {
            model,
            retry_count: previous.retry_count + 1,
            previous_run_id: previous.id,
        }
    }

    /// Deterministic comparison of two runs.
    pub fn compare(&self, previous: &AnalysisRun, retried: &AnalysisRun) -> RunComparison {
        let mut improvements = Vec::new();
        let mut confidence_changes = BTreeMap::new();

        for field in &retried.fields {
            match previous.field_named(&field.name) {
                Some(before) => {
                    let delta = field.overall_confidence - before.overall_confidence;
                    confidence_changes.insert(field.id, delta);
                    if delta > 0.0 {
                        improvements.push(format!(
                            "{}: confidence {:.2} -> {:.2}",
                            field.name, before.overall_confidence, field.overall_confidence
                        ));
                    }
                }
                None => improvements.push(format!("{}: newly detected", field.name)),
            }
        }

        if retried.document_type != previous.document_type {
            improvements.push(format!(
                "document type {} -> {}",
                previous.document_type, retried.document_type
            ));
        }

        let overall_delta = retried.overall_quality_score - previous.overall_quality_score;
        RunComparison {
            previous_run_id: previous.id,
            retried_run_id: retried.id,
            improvements,
            confidence_changes,
            overall_delta,
            improved: overall_delta > 0.0,
        }
    }
}

pub fn is_low_confidence(run: &AnalysisRun, threshold: f64) -> bool {
    run.overall_quality_score < threshold
}

/// Tracks one document through analyze, optional retry, and comparison.
#[derive(Debug, Clone)]
pub struct RetrySession {
    state: RetryState,
    initial: Option<AnalysisRun>,
    retried: Option<AnalysisRun>,
}

impl Default for RetrySession {
    fn default() -> Self {
        Self::new()
    }
}

impl RetrySession {
    pub fn new() -> Self {
        Self {
            state: RetryState::Initial,
            initial: None,
            retried: None,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn record_analysis(
        &mut self,
        run: AnalysisRun,
        strategy: &RetryAnalysisStrategy,
    ) -> Result<RetryState, RetryError> {
        if self.state != RetryState::Initial {
            return Err(RetryError::InvalidTransition {
                from: self.state,
                action: "record analysis",
            });
        }
        self.state = if strategy.is_low_confidence(&run) {
            RetryState::LowConfidence
        } else {
            RetryState::Analyzed
        };
        self.initial = Some(run);
        Ok(self.state)
    }

    pub fn record_retry(&mut self, run: AnalysisRun) -> Result<(), RetryError> {
        if !matches!(self.state, RetryState::Analyzed | RetryState::LowConfidence) {
            return Err(RetryError::InvalidTransition {
                from: self.state,
                action: "record retry",
            });
        }
        self.retried = Some(run);
        self.state = RetryState::Retried;
        Ok(())
    }

    pub fn compare(&mut self, strategy: &RetryAnalysisStrategy) -> Result<RunComparison, RetryError> {
        match (&self.initial, &self.retried, self.state) {
            (Some(initial), Some(retried), RetryState::Retried) => {
                let comparison = strategy.compare(initial, retried);
                self.state = RetryState::Compared;
                Ok(comparison)
            }
            _ => Err(RetryError::InvalidTransition {
                from: self.state,
                action: "compare",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfidenceScores, ExtractedField, FieldDraft, FieldType};

    fn rotation() -> ModelRotation {
        ModelRotation::new(vec!["gpt-4o".into(), "gpt-4o-mini".into(), "gemini-1.5-pro".into()])
    }

    fn strategy() -> RetryAnalysisStrategy {
        RetryAnalysisStrategy::new(rotation(), DEFAULT_LOW_CONFIDENCE_THRESHOLD)
    }

    fn field(name: &str, confidence: f64) -> ExtractedField {
        ExtractedField::new(FieldDraft::new(name, FieldType::Text, ConfidenceScores::uniform(confidence)))
            .unwrap()
    }

    fn run(model: &str, fields: Vec<ExtractedField>, quality: f64) -> AnalysisRun {
        let mut run = AnalysisRun::placeholder(Uuid::nil(), model);
        run.set_fields(fields);
        run.set_quality(quality).unwrap();
        run
    }

    #[test]
    fn rotation_wraps_around() {
        let r = rotation();
        assert_eq!(r.next_after("gpt-4o"), "gpt-4o-mini");
        assert_eq!(r.next_after("gemini-1.5-pro"), "gpt-4o");
        assert_eq!(r.next_after("unknown"), "gpt-4o");
        assert_eq!(ModelRotation::new(vec![]).next_after("solo"), "solo");
    }

    #[test]
    fn explicit_model_wins() {
        let previous = run("gpt-4o", vec![], 0.4);
        let plan = strategy().plan(&previous, Some("claude-custom"));
        assert_eq!(plan.model, "claude-custom");
        assert_eq!(plan.retry_count, 1);
        assert_eq!(plan.previous_run_id, previous.id);

        let plan = strategy().plan(&previous, None);
        assert_eq!(plan.model, "gpt-4o-mini");
    }

    #[test]
    fn comparison_keys_on_retried_field_ids() {
        let previous = run("gpt-4o", vec![field("total", 0.5), field("date", 0.8)], 0.5);
        let retried = run(
            "gpt-4o-mini",
            vec![field("total", 0.9), field("date", 0.7), field("vendor", 0.8)],
            0.7,
        );
        let cmp = strategy().compare(&previous, &retried);

        assert_eq!(cmp.confidence_changes.len(), 2);
        let total_id = retried.field_named("total").unwrap().id;
        let date_id = retried.field_named("date").unwrap().id;
        assert!((cmp.confidence_changes[&total_id] - 0.4).abs() < 1e-9);
        assert!((cmp.confidence_changes[&date_id] + 0.1).abs() < 1e-9);
        assert!((cmp.overall_delta - 0.2).abs() < 1e-9);
        assert!(cmp.improved);
        assert!(cmp.improvements.iter().any(|i| i.starts_with("total")));
        assert!(cmp.improvements.iter().any(|i| i == "vendor: newly detected"));
    }

    #[test]
    fn comparison_is_deterministic() {
        let previous = run("gpt-4o", vec![field("a", 0.5)], 0.5);
        let retried = run("gpt-4o-mini", vec![field("a", 0.6)], 0.4);
        let s = strategy();
        let first = s.compare(&previous, &retried);
        assert_eq!(first, s.compare(&previous, &retried));
        assert!(!first.improved);
    }

    #[test]
    fn session_follows_state_machine() {
        let s = strategy();
        let mut session = RetrySession::new();
        assert!(session.compare(&s).is_err());
        assert!(session.record_retry(run("gpt-4o", vec![], 0.5)).is_err());

        let state = session.record_analysis(run("gpt-4o", vec![], 0.4), &s).unwrap();
        assert_eq!(state, RetryState::LowConfidence);

        session.record_retry(run("gpt-4o-mini", vec![], 0.7)).unwrap();
        assert_eq!(session.state(), RetryState::Retried);

        let cmp = session.compare(&s).unwrap();
        assert!(cmp.improved);
        assert_eq!(session.state(), RetryState::Compared);
        assert!(session.compare(&s).is_err());
    }

    #[test]
    fn confident_run_is_analyzed_not_low() {
        let mut session = RetrySession::new();
        let state = session.record_analysis(run("gpt-4o", vec![], 0.85), &strategy()).unwrap();
        assert_eq!(state, RetryState::Analyzed);
        assert!(!is_low_confidence(&run("gpt-4o", vec![], 0.6), 0.6));
    }
}
