use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{DatabaseError, SchemaDraftRecord};
use crate::models::SchemaDraft;

const SCHEMA_COLUMNS: &str = "id, run_id, document_id, name, fields, total_fields_generated,
     high_confidence_fields, generation_confidence, validation_status, review_status,
     last_modified_by, modified_fields, accuracy_feedback, created_at, updated_at";

/// Insert or overwrite a schema draft. Drafts are edited after generation,
/// so saving the same id twice replaces the stored copy.
pub fn save_schema_draft(conn: &Connection, schema: &SchemaDraft) -> Result<(), DatabaseError> {
    let r = SchemaDraftRecord::to_record(schema)?;
    conn.execute(
        "INSERT INTO schema_drafts (id, run_id, document_id, name, fields,
         total_fields_generated, high_confidence_fields, generation_confidence,
         validation_status, review_status, last_modified_by, modified_fields,
         accuracy_feedback, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            fields = excluded.fields,
            total_fields_generated = excluded.total_fields_generated,
            high_confidence_fields = excluded.high_confidence_fields,
            generation_confidence = excluded.generation_confidence,
            validation_status = excluded.validation_status,
            review_status = excluded.review_status,
            last_modified_by = excluded.last_modified_by,
            modified_fields = excluded.modified_fields,
            accuracy_feedback = excluded.accuracy_feedback,
            updated_at = excluded.updated_at",
        params![
            r.id,
            r.run_id,
            r.document_id,
            r.name,
            r.fields,
            r.total_fields_generated,
            r.high_confidence_fields,
            r.generation_confidence,
            r.validation_status,
            r.review_status,
            r.last_modified_by,
            r.modified_fields,
            r.accuracy_feedback,
            r.created_at,
            r.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_schema_draft(conn: &Connection, id: &Uuid) -> Result<Option<SchemaDraft>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("SELECT {SCHEMA_COLUMNS} FROM schema_drafts WHERE id = ?1"))?;
    let result = stmt.query_row(params![id.to_string()], schema_record_from_row);

    match result {
        Ok(record) => Ok(Some(SchemaDraftRecord::from_record(&record)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get_schemas_for_run(conn: &Connection, run_id: &Uuid) -> Result<Vec<SchemaDraft>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCHEMA_COLUMNS} FROM schema_drafts WHERE run_id = ?1 ORDER BY created_at"
    ))?;
    let records = stmt
        .query_map(params![run_id.to_string()], schema_record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    records.iter().map(SchemaDraftRecord::from_record).collect()
}

fn schema_record_from_row(row: &Row<'_>) -> rusqlite::Result<SchemaDraftRecord> {
    Ok(SchemaDraftRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        document_id: row.get(2)?,
        name: row.get(3)?,
        fields: row.get(4)?,
        total_fields_generated: row.get(5)?,
        high_confidence_fields: row.get(6)?,
        generation_confidence: row.get(7)?,
        validation_status: row.get(8)?,
        review_status: row.get(9)?,
        last_modified_by: row.get(10)?,
        modified_fields: row.get(11)?,
        accuracy_feedback: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
