//! Operations exposed to callers. Every command takes the shared
//! [`CoreState`](crate::core_state::CoreState).

pub mod analysis;
pub mod schema;

use thiserror::Error;
use uuid::Uuid;

use crate::db::StorageError;
use crate::models::ModelError;
use crate::pipeline::retry::RetryError;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Model(#[from] ModelError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Analysis failed: {}", .0.join("; "))]
    PipelineFailed(Vec<String>),
}
