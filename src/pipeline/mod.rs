pub mod confidence;
pub mod enhancer;
pub mod error;
pub mod orchestrator; // Six-stage document analysis run
pub mod retry;
pub mod rules;
pub mod selector;
pub mod services;
pub mod stage;
pub mod trace;
pub mod types;

pub use confidence::{ConfidenceAggregator, ConfidenceReport};
pub use enhancer::StandardFieldEnhancer;
pub use error::PipelineError;
pub use orchestrator::{PipelineOrchestrator, PipelineResult, RunOptions};
pub use retry::{RetryAnalysisStrategy, RetrySession, RunComparison};
pub use rules::ValidationRuleInferenceEngine;
pub use selector::SchemaFieldSelector;
pub use stage::{CancellationToken, PipelineStage, StagePolicy, StagePolicyTable};
pub use trace::{PipelineTrace, StageRecord};
pub use types::{AnalysisService, DocumentService, PreparedDocument, RawExtraction, RuleSet};
