use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::stage::PipelineStage;

/// Outcome of one executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub success: bool,
    pub duration_ms: u64,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
    /// The stage failed and its fallback value was used.
    pub used_fallback: bool,
}

impl StageRecord {
    pub fn success(
        stage: PipelineStage,
        elapsed: Duration,
        metrics: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            stage,
            success: true,
            duration_ms: elapsed.as_millis() as u64,
            metrics,
            error: None,
            used_fallback: false,
        }
    }

    pub fn failure(stage: PipelineStage, elapsed: Duration, error: String, used_fallback: bool) -> Self {
        Self {
            stage,
            success: false,
            duration_ms: elapsed.as_millis() as u64,
            metrics: BTreeMap::new(),
            error: Some(error),
            used_fallback,
        }
    }
}

/// Per-run record of every stage outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineTrace {
    /// Executed stages, in order.
    pub stages: Vec<StageRecord>,
    /// Stages never executed because the run aborted.
    pub skipped: Vec<PipelineStage>,
    pub failed_stage: Option<PipelineStage>,
    /// Set when a stage panicked.
    pub fatal_error: Option<String>,
    pub total_duration_ms: u64,
}

impl PipelineTrace {
    pub fn record(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn executed(&self, stage: PipelineStage) -> bool {
        self.stage(stage).is_some()
    }

    /// Mark every stage that neither ran nor is `failed` as skipped.
    pub fn skip_remaining(&mut self, failed: Option<PipelineStage>) {
        self.skipped = PipelineStage::ALL
            .iter()
            .copied()
            .filter(|s| !self.executed(*s) && Some(*s) != failed)
            .collect();
    }
}

/// Build a stage metric map.
pub fn metrics<const N: usize>(
    pairs: [(&str, serde_json::Value); N],
) -> BTreeMap<String, serde_json::Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
