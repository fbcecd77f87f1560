//! Storage seam used by the command surface.
//!
//! `Storage` is the trait the commands depend on (allows mocking);
//! `SqliteStorage` serializes access to one connection behind a `Mutex`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use super::{repository, sqlite, DatabaseError, RunOutput};
use crate::models::{AnalysisRun, SchemaDraft};
use crate::pipeline::types::{PreparedDocument, RuleSet};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Internal lock error")]
    LockPoisoned,
}

pub trait Storage: Send + Sync {
    fn save_document(&self, document: &PreparedDocument) -> Result<(), StorageError>;
    fn get_document(&self, id: &Uuid) -> Result<Option<PreparedDocument>, StorageError>;

    /// Saves the run together with its fields.
    fn save_run(&self, run: &AnalysisRun) -> Result<(), StorageError>;
    fn get_run(&self, id: &Uuid) -> Result<Option<AnalysisRun>, StorageError>;
    fn runs_for_document(&self, document_id: &Uuid) -> Result<Vec<AnalysisRun>, StorageError>;

    fn save_rules(&self, rules: &RuleSet) -> Result<(), StorageError>;
    fn rules_for_run(&self, run_id: &Uuid) -> Result<RuleSet, StorageError>;

    /// Insert or replace.
    fn save_schema(&self, schema: &SchemaDraft) -> Result<(), StorageError>;
    fn get_schema(&self, id: &Uuid) -> Result<Option<SchemaDraft>, StorageError>;
    fn schemas_for_run(&self, run_id: &Uuid) -> Result<Vec<SchemaDraft>, StorageError>;

    /// Saves everything a pipeline run produced, all or nothing.
    fn save_run_output(&self, output: &RunOutput<'_>) -> Result<(), StorageError>;
}

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Wrap an already migrated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        tracing::info!(path = %path.display(), "Opening database");
        Ok(Self::new(sqlite::open_database(path)?))
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(sqlite::open_memory_database()?))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl Storage for SqliteStorage {
    fn save_document(&self, document: &PreparedDocument) -> Result<(), StorageError> {
        Ok(repository::insert_document(&*self.conn()?, document)?)
    }

    fn get_document(&self, id: &Uuid) -> Result<Option<PreparedDocument>, StorageError> {
        Ok(repository::get_document(&*self.conn()?, id)?)
    }

    fn save_run(&self, run: &AnalysisRun) -> Result<(), StorageError> {
        Ok(repository::insert_analysis_run(&*self.conn()?, run)?)
    }

    fn get_run(&self, id: &Uuid) -> Result<Option<AnalysisRun>, StorageError> {
        Ok(repository::get_analysis_run(&*self.conn()?, id)?)
    }

    fn runs_for_document(&self, document_id: &Uuid) -> Result<Vec<AnalysisRun>, StorageError> {
        Ok(repository::get_runs_for_document(&*self.conn()?, document_id)?)
    }

    fn save_rules(&self, rules: &RuleSet) -> Result<(), StorageError> {
        Ok(repository::insert_rules(&*self.conn()?, rules)?)
    }

    fn rules_for_run(&self, run_id: &Uuid) -> Result<RuleSet, StorageError> {
        Ok(repository::get_rules_for_run(&*self.conn()?, run_id)?)
    }

    fn save_schema(&self, schema: &SchemaDraft) -> Result<(), StorageError> {
        Ok(repository::save_schema_draft(&*self.conn()?, schema)?)
    }

    fn get_schema(&self, id: &Uuid) -> Result<Option<SchemaDraft>, StorageError> {
        Ok(repository::get_schema_draft(&*self.conn()?, id)?)
    }

    fn schemas_for_run(&self, run_id: &Uuid) -> Result<Vec<SchemaDraft>, StorageError> {
        Ok(repository::get_schemas_for_run(&*self.conn()?, run_id)?)
    }

    fn save_run_output(&self, output: &RunOutput<'_>) -> Result<(), StorageError> {
        Ok(repository::save_run_output(&*self.conn()?, output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::services::MockDocumentService;
    use crate::pipeline::types::DocumentService;

    #[test]
    fn document_through_storage() {
        let storage = SqliteStorage::in_memory().unwrap();
        let doc = MockDocumentService::new().prepare(b"x", "a.txt").unwrap();
        storage.save_document(&doc).unwrap();
        assert_eq!(storage.get_document(&doc.document_id).unwrap(), Some(doc));
    }

    #[test]
    fn run_before_document_is_a_database_error() {
        let storage = SqliteStorage::in_memory().unwrap();
        let run = AnalysisRun::placeholder(Uuid::new_v4(), "gpt-4o");
        assert!(matches!(storage.save_run(&run), Err(StorageError::Database(_))));
    }

    #[test]
    fn on_disk_storage_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docschema.db");
        let doc = MockDocumentService::new().prepare(b"x", "a.txt").unwrap();
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_document(&doc).unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        assert!(reopened.get_document(&doc.document_id).unwrap().is_some());
    }
}
