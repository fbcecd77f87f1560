use rusqlite::Connection;

use super::analysis::write_analysis_run;
use super::document::insert_document;
use super::rules::write_rules;
use super::schema::save_schema_draft;
use crate::db::DatabaseError;
use crate::models::{AnalysisRun, SchemaDraft};
use crate::pipeline::types::{PreparedDocument, RuleSet};

/// What one pipeline run produced. Absent parts are skipped.
#[derive(Debug, Clone, Copy)]
pub struct RunOutput<'a> {
    pub document: Option<&'a PreparedDocument>,
    pub run: Option<&'a AnalysisRun>,
    pub rules: &'a RuleSet,
    pub schema: Option<&'a SchemaDraft>,
}

/// Store a run's output in one transaction, parents first. Either all of
/// it lands or none of it does.
pub fn save_run_output(conn: &Connection, output: &RunOutput<'_>) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    if let Some(document) = output.document {
        insert_document(&tx, document)?;
    }
    if let Some(run) = output.run {
        write_analysis_run(&tx, run)?;
    }
    write_rules(&tx, output.rules)?;
    if let Some(schema) = output.schema {
        save_schema_draft(&tx, schema)?;
    }
    tx.commit()?;

    tracing::debug!(
        document = output.document.is_some(),
        run_id = ?output.run.map(|r| r.id),
        rules = output.rules.values().map(Vec::len).sum::<usize>(),
        schema = output.schema.is_some(),
        "Run output stored"
    );
    Ok(())
}
