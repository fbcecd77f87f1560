//! Error taxonomy for the document analysis pipeline.
//!
//! One error type per stage. `PipelineError` wraps them together with the
//! orchestrator's own failures (timeouts, cancellation, panics).

use thiserror::Error;
use uuid::Uuid;

use super::stage::PipelineStage;
use crate::models::ModelError;

#[derive(Error, Debug)]
pub enum DocumentProcessingError {
    #[error("Document is empty")]
    Empty,

    #[error("Document too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Document decoding failed: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum AiAnalysisError {
    #[error("Analysis service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model not available: {0}")]
    ModelUnavailable(String),

    #[error("Malformed analysis response: {0}")]
    MalformedResponse(String),

    #[error("Invalid extraction: {0}")]
    InvalidExtraction(#[from] ModelError),
}

#[derive(Error, Debug)]
pub enum FieldEnhancementError {
    #[error("Field {field_id} has no usable name")]
    EmptyName { field_id: Uuid },

    #[error("Field enhancement failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ValidationInferenceError {
    #[error("Validation rule inference failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum SchemaGenerationError {
    #[error("Confidence threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("Schema field rejected: {0}")]
    InvalidField(#[from] ModelError),
}

#[derive(Error, Debug)]
pub enum ConfidenceScoringError {
    #[error("Component '{component}' produced a non-finite score")]
    NonFinite { component: &'static str },

    #[error("Confidence scoring failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Document processing failed: {0}")]
    DocumentProcessing(#[from] DocumentProcessingError),

    #[error("AI analysis failed: {0}")]
    AiAnalysis(#[from] AiAnalysisError),

    #[error("Field enhancement failed: {0}")]
    FieldEnhancement(#[from] FieldEnhancementError),

    #[error("Validation inference failed: {0}")]
    ValidationInference(#[from] ValidationInferenceError),

    #[error("Schema generation failed: {0}")]
    SchemaGeneration(#[from] SchemaGenerationError),

    #[error("Confidence scoring failed: {0}")]
    ConfidenceScoring(#[from] ConfidenceScoringError),

    #[error("Stage {stage} timed out after {timeout_secs}s")]
    Timeout {
        stage: PipelineStage,
        timeout_secs: u64,
    },

    #[error("Pipeline cancelled before {0}")]
    Cancelled(PipelineStage),

    #[error("Uncaught failure in {stage}: {message}")]
    Internal {
        stage: PipelineStage,
        message: String,
    },
}

impl PipelineError {
    /// The stage this error originated from.
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::DocumentProcessing(_) => PipelineStage::DocumentPreparation,
            Self::AiAnalysis(_) => PipelineStage::AiAnalysis,
            Self::FieldEnhancement(_) => PipelineStage::FieldEnhancement,
            Self::ValidationInference(_) => PipelineStage::ValidationInference,
            Self::SchemaGeneration(_) => PipelineStage::SchemaGeneration,
            Self::ConfidenceScoring(_) => PipelineStage::ConfidenceScoring,
            Self::Timeout { stage, .. } | Self::Cancelled(stage) | Self::Internal { stage, .. } => {
                *stage
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_their_stage() {
        let e: PipelineError = DocumentProcessingError::Empty.into();
        assert_eq!(e.stage(), PipelineStage::DocumentPreparation);

        let e: PipelineError = AiAnalysisError::ServiceUnavailable("down".into()).into();
        assert_eq!(e.stage(), PipelineStage::AiAnalysis);

        let e = PipelineError::Timeout {
            stage: PipelineStage::AiAnalysis,
            timeout_secs: 5,
        };
        assert_eq!(e.stage(), PipelineStage::AiAnalysis);
        assert_eq!(e.to_string(), "Stage ai_analysis timed out after 5s");
    }

    #[test]
    fn display_includes_source() {
        let e: PipelineError = SchemaGenerationError::InvalidThreshold(1.5).into();
        assert!(e.to_string().contains("1.5"));
    }
}
