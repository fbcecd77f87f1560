use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The six ordered stages of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    DocumentPreparation,
    AiAnalysis,
    FieldEnhancement,
    ValidationInference,
    SchemaGeneration,
    ConfidenceScoring,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        Self::DocumentPreparation,
        Self::AiAnalysis,
        Self::FieldEnhancement,
        Self::ValidationInference,
        Self::SchemaGeneration,
        Self::ConfidenceScoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentPreparation => "document_preparation",
            Self::AiAnalysis => "ai_analysis",
            Self::FieldEnhancement => "field_enhancement",
            Self::ValidationInference => "validation_inference",
            Self::SchemaGeneration => "schema_generation",
            Self::ConfidenceScoring => "confidence_scoring",
        }
    }

    /// 1-based position in the run.
    pub fn number(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).map_or(0, |i| i + 1)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    /// Abort the run; remaining stages are skipped.
    Fatal,
    /// Substitute the stage fallback and continue.
    Recoverable,
}

/// Failure policy per stage.
///
/// A stage marked recoverable only degrades when it has a fallback value;
/// stages whose output every later stage needs stay fatal in practice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicyTable {
    policies: [(PipelineStage, StagePolicy); 6],
}

impl Default for StagePolicyTable {
    fn default() -> Self {
        Self {
            policies: [
                (PipelineStage::DocumentPreparation, StagePolicy::Fatal),
                (PipelineStage::AiAnalysis, StagePolicy::Fatal),
                (PipelineStage::FieldEnhancement, StagePolicy::Recoverable),
                (PipelineStage::ValidationInference, StagePolicy::Recoverable),
                (PipelineStage::SchemaGeneration, StagePolicy::Fatal),
                (PipelineStage::ConfidenceScoring, StagePolicy::Recoverable),
            ],
        }
    }
}

impl StagePolicyTable {
    pub fn policy_for(&self, stage: PipelineStage) -> StagePolicy {
        self.policies
            .iter()
            .find(|(s, _)| *s == stage)
            .map_or(StagePolicy::Fatal, |(_, p)| *p)
    }

    pub fn with_policy(mut self, stage: PipelineStage, policy: StagePolicy) -> Self {
        if let Some(entry) = self.policies.iter_mut().find(|(s, _)| *s == stage) {
            entry.1 = policy;
        }
        self
    }
}

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
