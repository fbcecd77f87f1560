//! Confidence aggregation.
//!
//! Five independent component scores are combined with fixed weights into a
//! single overall score, adjusted per model. Component formulas:
//!
//! - field extraction: mean field confidence, penalized for spread and for a
//!   large share of weak fields, with a small bonus for field count
//! - document type: model type confidence, adjusted by indicator evidence,
//!   template matches and the number of competing types
//! - validation coverage: recommended-rule strength plus coverage bonus
//! - visual quality: mean visual clarity
//! - consistency: type agreement, confidence spread and layout spread

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::error::ConfidenceScoringError;
use super::types::{ConfidenceScorer, RuleSet};
use crate::models::{mean, std_dev, AnalysisRun, ConfidenceLevel, FieldType, ValidationRuleCandidate};

pub const WEIGHT_FIELD_EXTRACTION: f64 = 0.30;
pub const WEIGHT_DOCUMENT_TYPE: f64 = 0.20;
pub const WEIGHT_VALIDATION_COVERAGE: f64 = 0.20;
pub const WEIGHT_VISUAL_QUALITY: f64 = 0.15;
pub const WEIGHT_CONSISTENCY: f64 = 0.15;

pub const DEFAULT_REFERENCE_PAGE_HEIGHT: f64 = 500.0;

/// Score reported when stage 6 fails and the run continues.
pub const NEUTRAL_SCORE: f64 = 0.5;

const WEAK_FIELD_CONFIDENCE: f64 = 0.4;
const WEAK_FIELD_SHARE: f64 = 0.3;
const WEAK_FIELD_PENALTY: f64 = 0.15;
const POOR_CLARITY: f64 = 0.5;
const VALIDATION_BASELINE: f64 = 0.3;
/// Field extraction below this calls for a better source document.
const POOR_EXTRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub field_extraction: f64,
    pub document_type: f64,
    pub validation_coverage: f64,
    pub visual_quality: f64,
    pub consistency: f64,
}

impl ComponentScores {
    pub fn uniform(value: f64) -> Self {
        Self {
            field_extraction: value,
            document_type: value,
            validation_coverage: value,
            visual_quality: value,
            consistency: value,
        }
    }

    fn named(&self) -> [(&'static str, f64); 5] {
        [
            ("field_extraction", self.field_extraction),
            ("document_type", self.document_type),
            ("validation_coverage", self.validation_coverage),
            ("visual_quality", self.visual_quality),
            ("consistency", self.consistency),
        ]
    }

    pub fn weighted_sum(&self) -> f64 {
        self.field_extraction * WEIGHT_FIELD_EXTRACTION
            + self.document_type * WEIGHT_DOCUMENT_TYPE
            + self.validation_coverage * WEIGHT_VALIDATION_COVERAGE
            + self.visual_quality * WEIGHT_VISUAL_QUALITY
            + self.consistency * WEIGHT_CONSISTENCY
    }
}

/// Aggregated confidence for one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub overall_score: f64,
    pub level: ConfidenceLevel,
    pub components: ComponentScores,
    pub model_adjustment: f64,
    pub recommendations: Vec<String>,
    /// True when this is the stand-in report of a failed scoring stage.
    pub is_fallback: bool,
}

impl ConfidenceReport {
    /// Neutral report used when confidence scoring fails.
    pub fn neutral() -> Self {
        Self {
            overall_score: NEUTRAL_SCORE,
            level: ConfidenceLevel::Medium,
            components: ComponentScores::uniform(NEUTRAL_SCORE),
            model_adjustment: 1.0,
            recommendations: vec![
                "Confidence could not be computed; review all fields manually.".to_string(),
            ],
            is_fallback: true,
        }
    }
}

/// Default stage-6 implementation. Pure apart from a report counter.
pub struct ConfidenceAggregator {
    model_adjustments: BTreeMap<String, f64>,
    reference_page_height: f64,
    reports_produced: AtomicU64,
}

impl Default for ConfidenceAggregator {
    fn default() -> Self {
        Self::new(BTreeMap::new(), DEFAULT_REFERENCE_PAGE_HEIGHT)
    }
}

impl ConfidenceAggregator {
    pub fn new(model_adjustments: BTreeMap<String, f64>, reference_page_height: f64) -> Self {
        let reference_page_height = if reference_page_height.is_finite() && reference_page_height > 0.0 {
            reference_page_height
        } else {
            DEFAULT_REFERENCE_PAGE_HEIGHT
        };
        Self {
            model_adjustments,
            reference_page_height,
            reports_produced: AtomicU64::new(0),
        }
    }

    pub fn reports_produced(&self) -> u64 {
        self.reports_produced.load(Ordering::Relaxed)
    }

    /// Adjustment factor for a model; 1.0 when unconfigured.
    pub fn model_adjustment(&self, model: &str) -> f64 {
        self.model_adjustments
            .get(model)
            .copied()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .unwrap_or(1.0)
    }

    pub fn components(&self, run: &AnalysisRun, rules: &RuleSet) -> ComponentScores {
        ComponentScores {
            field_extraction: field_extraction_score(run),
            document_type: document_type_score(run),
            validation_coverage: validation_coverage_score(run, rules),
            visual_quality: visual_quality_score(run),
            consistency: consistency_score(run, self.reference_page_height),
        }
    }
}

impl ConfidenceScorer for ConfidenceAggregator {
    fn score(
        &self,
        run: &AnalysisRun,
        rules: &RuleSet,
    ) -> Result<ConfidenceReport, ConfidenceScoringError> {
        let components = self.components(run, rules);
        for (component, value) in components.named() {
            if !value.is_finite() {
                return Err(ConfidenceScoringError::NonFinite { component });
            }
        }

        let model_adjustment = self.model_adjustment(&run.model);
        let overall_score = (components.weighted_sum() * model_adjustment).clamp(0.0, 1.0);
        let level = ConfidenceLevel::from_score(overall_score);
        let recommendations = recommendations(overall_score, &components);

        self.reports_produced.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            run_id = %run.id,
            overall = overall_score,
            level = level.as_str(),
            "Confidence aggregated"
        );

        Ok(ConfidenceReport {
            overall_score,
            level,
            components,
            model_adjustment,
            recommendations,
            is_fallback: false,
        })
    }
}

// ═══════════════════════════════════════════
// Components
// ═══════════════════════════════════════════

fn share_below(values: &[f64], limit: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|v| **v < limit).count() as f64 / values.len() as f64
}

pub fn field_extraction_score(run: &AnalysisRun) -> f64 {
    let confidences: Vec<f64> = run.fields.iter().map(|f| f.overall_confidence).collect();
    if confidences.is_empty() {
        return 0.0;
    }
    let mut score = mean(&confidences);
    score -= (0.5 * std_dev(&confidences)).min(0.2);
    score += (0.01 * confidences.len() as f64).min(0.1);
    if share_below(&confidences, WEAK_FIELD_CONFIDENCE) > WEAK_FIELD_SHARE {
        score -= WEAK_FIELD_PENALTY;
    }
    score.clamp(0.0, 1.0)
}

pub fn document_type_score(run: &AnalysisRun) -> f64 {
    let mut score = run.document_type_confidence;
    score += (0.02 * run.type_indicators.len() as f64).min(0.1);
    score += (0.025 * run.template_matches.len() as f64).min(0.05);
    let alternatives = run.alternative_types.len();
    if alternatives > 3 {
        score -= (0.05 * (alternatives - 3) as f64).min(0.15);
    }
    score.clamp(0.0, 1.0)
}

pub fn validation_coverage_score(run: &AnalysisRun, rules: &RuleSet) -> f64 {
    // Only rules attached to this run's fields count.
    let own: Vec<&Vec<ValidationRuleCandidate>> = run
        .fields
        .iter()
        .filter_map(|f| rules.get(&f.id))
        .filter(|r| !r.is_empty())
        .collect();
    if own.is_empty() {
        return VALIDATION_BASELINE;
    }

    let recommended: Vec<f64> = own
        .iter()
        .copied()
        .flatten()
        .filter(|r| r.is_recommended)
        .map(|r| r.confidence)
        .collect();
    let strength = if recommended.is_empty() {
        VALIDATION_BASELINE
    } else {
        mean(&recommended)
    };
    let coverage = own.len() as f64 / run.fields.len() as f64;
    (strength + 0.2 * coverage).clamp(0.0, 1.0)
}

pub fn visual_quality_score(run: &AnalysisRun) -> f64 {
    let clarity: Vec<f64> = run.fields.iter().map(|f| f.scores.visual_clarity).collect();
    if clarity.is_empty() {
        return 0.5;
    }
    let mut score = mean(&clarity);
    if std_dev(&clarity) < 0.1 {
        score += 0.05;
    }
    if share_below(&clarity, POOR_CLARITY) > WEAK_FIELD_SHARE {
        score -= 0.1;
    }
    score.clamp(0.0, 1.0)
}

pub fn consistency_score(run: &AnalysisRun, reference_page_height: f64) -> f64 {
    if run.fields.len() <= 1 {
        return 0.8;
    }

    let mut parts = vec![type_agreement(run)];

    let confidences: Vec<f64> = run.fields.iter().map(|f| f.overall_confidence).collect();
    parts.push(1.0 - (2.0 * std_dev(&confidences)).min(1.0));

    let ys: Vec<f64> = run
        .fields
        .iter()
        .filter_map(|f| f.bounding_box.map(|b| b.y))
        .collect();
    if ys.len() >= 2 {
        let page_height = run
            .page_height
            .filter(|h| h.is_finite() && *h > 0.0)
            .unwrap_or(reference_page_height);
        let min = ys.iter().copied().fold(f64::INFINITY, f64::min);
        let max = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        parts.push(((max - min) / page_height).clamp(0.0, 1.0));
    }

    mean(&parts).clamp(0.0, 1.0)
}

/// Share of fields agreeing with the dominant type of their name group,
/// averaged over groups with more than one member.
fn type_agreement(run: &AnalysisRun) -> f64 {
    let mut groups: HashMap<&str, Vec<FieldType>> = HashMap::new();
    for field in &run.fields {
        groups.entry(field.name_group()).or_default().push(field.field_type);
    }

    let agreements: Vec<f64> = groups
        .values()
        .filter(|types| types.len() > 1)
        .map(|types| {
            let mut counts: HashMap<FieldType, usize> = HashMap::new();
            for t in types {
                *counts.entry(*t).or_default() += 1;
            }
            let dominant = counts.values().copied().max().unwrap_or(0);
            dominant as f64 / types.len() as f64
        })
        .collect();

    if agreements.is_empty() {
        1.0
    } else {
        mean(&agreements)
    }
}

// ═══════════════════════════════════════════
// Recommendations
// ═══════════════════════════════════════════

fn recommendations(overall: f64, components: &ComponentScores) -> Vec<String> {
    let mut out = Vec::new();
    if overall < 0.6 {
        out.push("Overall confidence is low; consider retrying with a different model.".to_string());
    } else if overall >= 0.9 {
        out.push("High confidence extraction; spot-check before approving.".to_string());
    }
    if components.field_extraction < POOR_EXTRACTION {
        out.push(
            "Field extraction is weak; rescan the document or provide a clearer source.".to_string(),
        );
    } else if components.field_extraction < 0.6 {
        out.push("Many fields were extracted with low confidence; review flagged fields.".to_string());
    }
    if components.document_type < 0.7 {
        out.push("Document type is uncertain; confirm it before using the schema.".to_string());
    }
    if components.validation_coverage < 0.5 {
        out.push("Few validation rules were inferred; add constraints manually.".to_string());
    }
    if components.visual_quality < 0.6 {
        out.push("Scan quality is poor; rescan at a higher resolution if possible.".to_string());
    }
    if components.consistency < 0.6 {
        out.push("Related fields disagree; check field types and positions.".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BoundingBox, ConfidenceScores, ExtractedField, FieldDraft, FormatKind, RuleKind,
        TypeCandidate, ValidationRuleCandidate,
    };
    use uuid::Uuid;

    fn field(name: &str, field_type: FieldType, confidence: f64) -> ExtractedField {
        ExtractedField::new(FieldDraft::new(name, field_type, ConfidenceScores::uniform(confidence)))
            .unwrap()
    }

    fn run_with(fields: Vec<ExtractedField>) -> AnalysisRun {
        let mut run = AnalysisRun::placeholder(Uuid::new_v4(), "model-a");
        run.set_document_type("invoice", 0.9).unwrap();
        run.set_fields(fields);
        run
    }

    fn email_rule(field_id: Uuid, confidence: f64) -> ValidationRuleCandidate {
        ValidationRuleCandidate::new(
            field_id,
            RuleKind::Format { format: FormatKind::Email },
            confidence,
            "email",
        )
        .unwrap()
    }

    #[test]
    fn empty_run_component_defaults() {
        let run = run_with(vec![]);
        let rules = RuleSet::new();
        let agg = ConfidenceAggregator::default();
        let c = agg.components(&run, &rules);
        assert_eq!(c.field_extraction, 0.0);
        assert_eq!(c.validation_coverage, 0.3);
        assert_eq!(c.visual_quality, 0.5);
        assert_eq!(c.consistency, 0.8);
    }

    #[test]
    fn extraction_penalizes_weak_majority() {
        let run = run_with(vec![
            field("a", FieldType::Text, 0.3),
            field("b", FieldType::Text, 0.3),
            field("c", FieldType::Text, 0.9),
        ]);
        // mean 0.5, std ~0.283 -> -0.1414, +0.03, weak share 2/3 -> -0.15
        let expected = 0.5 - 0.5 * std_dev(&[0.3, 0.3, 0.9]) + 0.03 - 0.15;
        assert!((field_extraction_score(&run) - expected).abs() < 1e-9);
    }

    #[test]
    fn document_type_adjustments_are_capped() {
        let mut run = run_with(vec![]);
        run.set_document_type("invoice", 0.7).unwrap();
        run.type_indicators = (0..10).map(|i| format!("ind{i}")).collect();
        run.template_matches = vec!["t1".into(), "t2".into(), "t3".into()];
        run.alternative_types = (0..8)
            .map(|i| TypeCandidate::new(format!("alt{i}"), 0.1).unwrap())
            .collect();
        // 0.7 + 0.1 + 0.05 - 0.15
        assert!((document_type_score(&run) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn validation_uses_baseline_without_recommended_rules() {
        let a = field("a", FieldType::Email, 0.9);
        let b = field("b", FieldType::Text, 0.9);
        let mut rules = RuleSet::new();
        rules.insert(a.id, vec![email_rule(a.id, 0.5)]);
        let run = run_with(vec![a, b]);
        // baseline 0.3 + 0.2 * 0.5
        assert!((validation_coverage_score(&run, &rules) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn validation_averages_recommended_rules() {
        let a = field("a", FieldType::Email, 0.9);
        let mut rules = RuleSet::new();
        rules.insert(a.id, vec![email_rule(a.id, 0.8), email_rule(a.id, 0.5)]);
        let run = run_with(vec![a]);
        assert!((validation_coverage_score(&run, &rules) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn validation_ignores_rules_of_other_fields() {
        let a = field("a", FieldType::Text, 0.9);
        let stranger = Uuid::new_v4();
        let mut rules = RuleSet::new();
        rules.insert(stranger, vec![email_rule(stranger, 0.95)]);
        let run = run_with(vec![a.clone()]);
        assert_eq!(validation_coverage_score(&run, &rules), VALIDATION_BASELINE);

        rules.insert(a.id, vec![email_rule(a.id, 0.5)]);
        // own rule is not recommended: baseline 0.3 + full coverage 0.2
        assert!((validation_coverage_score(&run, &rules) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn weak_extraction_asks_for_better_source() {
        let mut components = ComponentScores::uniform(0.8);
        components.field_extraction = 0.49;
        let weak = recommendations(0.7, &components);
        assert!(weak.iter().any(|r| r.contains("rescan the document")));
        assert!(!weak.iter().any(|r| r.contains("review flagged fields")));

        components.field_extraction = 0.5;
        let borderline = recommendations(0.7, &components);
        assert!(!borderline.iter().any(|r| r.contains("rescan the document")));
        assert!(borderline.iter().any(|r| r.contains("review flagged fields")));
    }

    #[test]
    fn visual_bonus_for_uniform_clarity() {
        let run = run_with(vec![field("a", FieldType::Text, 0.7), field("b", FieldType::Text, 0.7)]);
        assert!((visual_quality_score(&run) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn consistency_uses_page_height() {
        let bbox = |y: f64| BoundingBox { page: 1, x: 0.0, y, width: 10.0, height: 10.0 };
        let a = ExtractedField::new(
            FieldDraft::new("a", FieldType::Text, ConfidenceScores::uniform(0.8)).with_bounding_box(bbox(100.0)),
        )
        .unwrap();
        let b = ExtractedField::new(
            FieldDraft::new("b", FieldType::Text, ConfidenceScores::uniform(0.8)).with_bounding_box(bbox(600.0)),
        )
        .unwrap();
        let mut run = run_with(vec![a, b]);

        // types agree (no groups) 1.0, no spread 1.0, layout 500/1000
        run.page_height = Some(1000.0);
        assert!((consistency_score(&run, 500.0) - (2.5 / 3.0)).abs() < 1e-9);

        // reference height fallback: 500/500
        run.page_height = None;
        assert!((consistency_score(&run, 500.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn type_disagreement_lowers_consistency() {
        let run = run_with(vec![
            field("total_amount", FieldType::Currency, 0.8),
            field("total_tax", FieldType::Text, 0.8),
        ]);
        // group "total" agreement 0.5, no spread 1.0
        assert!((consistency_score(&run, 500.0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn overall_is_weighted_and_model_adjusted() {
        let run = run_with(vec![field("a", FieldType::Text, 0.9), field("b", FieldType::Text, 0.9)]);
        let rules = RuleSet::new();

        let plain = ConfidenceAggregator::default();
        let base = plain.score(&run, &rules).unwrap();
        assert!((base.overall_score - base.components.weighted_sum()).abs() < 1e-12);
        assert_eq!(base.model_adjustment, 1.0);

        let mut factors = BTreeMap::new();
        factors.insert("model-a".to_string(), 0.9);
        let adjusted = ConfidenceAggregator::new(factors, 500.0).score(&run, &rules).unwrap();
        assert!((adjusted.overall_score - base.overall_score * 0.9).abs() < 1e-12);
    }

    #[test]
    fn overall_is_clamped_to_one() {
        let run = run_with(vec![field("a", FieldType::Text, 1.0), field("b", FieldType::Text, 1.0)]);
        let mut factors = BTreeMap::new();
        factors.insert("model-a".to_string(), 3.0);
        let report = ConfidenceAggregator::new(factors, 500.0)
            .score(&run, &RuleSet::new())
            .unwrap();
        assert_eq!(report.overall_score, 1.0);
        assert_eq!(report.level, ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn scoring_is_pure() {
        let run = run_with(vec![field("a", FieldType::Text, 0.7), field("b", FieldType::Date, 0.5)]);
        let before = run.clone();
        let agg = ConfidenceAggregator::default();
        let first = agg.score(&run, &RuleSet::new()).unwrap();
        let second = agg.score(&run, &RuleSet::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(run, before);
        assert_eq!(agg.reports_produced(), 2);
    }

    #[test]
    fn low_scores_produce_recommendations() {
        let run = run_with(vec![field("a", FieldType::Text, 0.2), field("b", FieldType::Text, 0.3)]);
        let report = ConfidenceAggregator::default().score(&run, &RuleSet::new()).unwrap();
        assert!(report.overall_score < 0.6);
        assert!(report.recommendations.iter().any(|r| r.contains("retrying")));
        assert!(report.recommendations.iter().any(|r| r.contains("Scan quality")));
    }

    #[test]
    fn neutral_report_is_medium() {
        let report = ConfidenceReport::neutral();
        assert_eq!(report.overall_score, 0.5);
        assert_eq!(report.level, ConfidenceLevel::Medium);
        assert!(report.is_fallback);
    }
}
