//! Shared application state.
//!
//! `CoreState` owns the pipeline orchestrator and the storage backend and
//! is handed to every command. Wrapped in `Arc` at startup so concurrent
//! callers share one instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config;
use crate::db::{SqliteStorage, Storage, StorageError};
use crate::pipeline::services::FormatSniffingDocumentService;
use crate::pipeline::types::AnalysisService;
use crate::pipeline::PipelineOrchestrator;
use crate::pipeline_config::{ConfigError, PipelineConfig};

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

pub struct CoreState {
    orchestrator: PipelineOrchestrator,
    storage: Arc<dyn Storage>,
    /// Pipeline runs started through this state, including retries.
    runs_started: AtomicU64,
}

impl CoreState {
    pub fn new(orchestrator: PipelineOrchestrator, storage: Arc<dyn Storage>) -> Self {
        Self {
            orchestrator,
            storage,
            runs_started: AtomicU64::new(0),
        }
    }

    /// Production wiring: configuration from the environment, the SQLite
    /// database under the app data directory, the format-sniffing document
    /// service and the given analysis client.
    pub fn from_env(analysis_service: Arc<dyn AnalysisService>) -> Result<Self, CoreError> {
        let pipeline_config = PipelineConfig::from_env()?;
        let storage = SqliteStorage::open(&config::database_path())?;
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(FormatSniffingDocumentService::new()),
            analysis_service,
            pipeline_config,
        );
        tracing::info!(
            default_model = %orchestrator.config().default_model,
            threshold = orchestrator.config().confidence_threshold,
            "Core state ready"
        );
        Ok(Self::new(orchestrator, Arc::new(storage)))
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn note_run_started(&self) -> u64 {
        self.runs_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }
}

/// Errors from CoreState construction.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
