use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{AnalysisRunRecord, DatabaseError, ExtractedFieldRecord};
use crate::models::{AnalysisRun, ExtractedField};

const RUN_COLUMNS: &str = "id, document_id, model, created_at, document_type,
     document_type_confidence, alternative_types, type_indicators, template_matches,
     total_fields_detected, high_confidence_fields, requires_review_count,
     overall_quality_score, retry_count, previous_run_id, page_height, error_detail";

const FIELD_COLUMNS: &str = "id, run_id, position, name, field_type, sample_value,
     visual_clarity, label_confidence, value_confidence, type_confidence, context_confidence,
     overall_confidence, bounding_box, requires_review, review_reason,
     alternative_names, alternative_types";

/// Insert a run and all its fields atomically.
pub fn insert_analysis_run(conn: &Connection, run: &AnalysisRun) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    write_analysis_run(&tx, run)?;
    tx.commit()?;
    tracing::debug!(run_id = %run.id, fields = run.fields.len(), "Analysis run stored");
    Ok(())
}

/// Run and field inserts without a transaction of their own.
pub(crate) fn write_analysis_run(conn: &Connection, run: &AnalysisRun) -> Result<(), DatabaseError> {
    let record = AnalysisRunRecord::to_record(run)?;

    conn.execute(
        "INSERT INTO analysis_runs (id, document_id, model, created_at, document_type,
         document_type_confidence, alternative_types, type_indicators, template_matches,
         total_fields_detected, high_confidence_fields, requires_review_count,
         overall_quality_score, retry_count, previous_run_id, page_height, error_detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            record.id,
            record.document_id,
            record.model,
            record.created_at,
            record.document_type,
            record.document_type_confidence,
            record.alternative_types,
            record.type_indicators,
            record.template_matches,
            record.total_fields_detected,
            record.high_confidence_fields,
            record.requires_review_count,
            record.overall_quality_score,
            record.retry_count,
            record.previous_run_id,
            record.page_height,
            record.error_detail,
        ],
    )?;

    for (position, field) in run.fields.iter().enumerate() {
        let f = ExtractedFieldRecord::to_record(field, &run.id, position)?;
        conn.execute(
            "INSERT INTO extracted_fields (id, run_id, position, name, field_type, sample_value,
             visual_clarity, label_confidence, value_confidence, type_confidence,
             context_confidence, overall_confidence, bounding_box, requires_review,
             review_reason, alternative_names, alternative_types)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                f.id,
                f.run_id,
                f.position,
                f.name,
                f.field_type,
                f.sample_value,
                f.visual_clarity,
                f.label_confidence,
                f.value_confidence,
                f.type_confidence,
                f.context_confidence,
                f.overall_confidence,
                f.bounding_box,
                f.requires_review,
                f.review_reason,
                f.alternative_names,
                f.alternative_types,
            ],
        )?;
    }
    Ok(())
}

/// Run with its fields in extraction order.
pub fn get_analysis_run(conn: &Connection, id: &Uuid) -> Result<Option<AnalysisRun>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM analysis_runs WHERE id = ?1"))?;
    let result = stmt.query_row(params![id.to_string()], run_record_from_row);

    match result {
        Ok(record) => {
            let fields = get_fields_for_run(conn, id)?;
            Ok(Some(AnalysisRunRecord::from_record(&record, fields)?))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All runs of a document, oldest first.
pub fn get_runs_for_document(
    conn: &Connection,
    document_id: &Uuid,
) -> Result<Vec<AnalysisRun>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM analysis_runs WHERE document_id = ?1
         ORDER BY created_at ASC, retry_count ASC"
    ))?;
    let records = stmt
        .query_map(params![document_id.to_string()], run_record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut runs = Vec::with_capacity(records.len());
    for record in records {
        let run_id = crate::db::records::parse_uuid("analysis_runs.id", &record.id)?;
        let fields = get_fields_for_run(conn, &run_id)?;
        runs.push(AnalysisRunRecord::from_record(&record, fields)?);
    }
    Ok(runs)
}

pub fn get_fields_for_run(
    conn: &Connection,
    run_id: &Uuid,
) -> Result<Vec<ExtractedField>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIELD_COLUMNS} FROM extracted_fields WHERE run_id = ?1 ORDER BY position"
    ))?;
    let records = stmt
        .query_map(params![run_id.to_string()], field_record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    records.iter().map(ExtractedFieldRecord::from_record).collect()
}

fn run_record_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRunRecord> {
    Ok(AnalysisRunRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        model: row.get(2)?,
        created_at: row.get(3)?,
        document_type: row.get(4)?,
        document_type_confidence: row.get(5)?,
        alternative_types: row.get(6)?,
        type_indicators: row.get(7)?,
        template_matches: row.get(8)?,
        total_fields_detected: row.get(9)?,
        high_confidence_fields: row.get(10)?,
        requires_review_count: row.get(11)?,
        overall_quality_score: row.get(12)?,
        retry_count: row.get(13)?,
        previous_run_id: row.get(14)?,
        page_height: row.get(15)?,
        error_detail: row.get(16)?,
    })
}

fn field_record_from_row(row: &Row<'_>) -> rusqlite::Result<ExtractedFieldRecord> {
    Ok(ExtractedFieldRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        position: row.get(2)?,
        name: row.get(3)?,
        field_type: row.get(4)?,
        sample_value: row.get(5)?,
        visual_clarity: row.get(6)?,
        label_confidence: row.get(7)?,
        value_confidence: row.get(8)?,
        type_confidence: row.get(9)?,
        context_confidence: row.get(10)?,
        overall_confidence: row.get(11)?,
        bounding_box: row.get(12)?,
        requires_review: row.get(13)?,
        review_reason: row.get(14)?,
        alternative_names: row.get(15)?,
        alternative_types: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_document, open_memory_database};
    use crate::models::{ConfidenceScores, FieldDraft, FieldType};
    use crate::pipeline::services::MockDocumentService;
    use crate::pipeline::types::DocumentService;

    fn stored_document(conn: &Connection) -> Uuid {
        let doc = MockDocumentService::new().prepare(b"x", "a.txt").unwrap();
        insert_document(conn, &doc).unwrap();
        doc.document_id
    }

    fn run_for(document_id: Uuid) -> AnalysisRun {
        let fields = ["invoice_number", "invoice_date", "notes"]
            .iter()
            .zip([0.92, 0.88, 0.41])
            .map(|(name, c)| {
                ExtractedField::new(
                    FieldDraft::new(*name, FieldType::Text, ConfidenceScores::uniform(c))
                        .with_sample("value"),
                )
                .unwrap()
            })
            .collect();
        let mut run = AnalysisRun::placeholder(document_id, "gpt-4o");
        run.set_document_type("invoice", 0.9).unwrap();
        run.set_fields(fields);
        run.set_quality(0.8).unwrap();
        run
    }

    #[test]
    fn run_round_trips_with_field_order() {
        let conn = open_memory_database().unwrap();
        let run = run_for(stored_document(&conn));
        insert_analysis_run(&conn, &run).unwrap();

        let loaded = get_analysis_run(&conn, &run.id).unwrap().unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.fields[2].name, "notes");
        assert_eq!(loaded.requires_review_count, 1);
    }

    #[test]
    fn run_requires_existing_document() {
        let conn = open_memory_database().unwrap();
        let run = run_for(Uuid::new_v4());
        assert!(insert_analysis_run(&conn, &run).is_err());
        // Nothing half-written.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM extracted_fields", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn runs_for_document_include_retries() {
        let conn = open_memory_database().unwrap();
        let document_id = stored_document(&conn);
        let first = run_for(document_id);
        insert_analysis_run(&conn, &first).unwrap();

        let mut retry = run_for(document_id);
        retry.model = "gpt-4o-mini".into();
        retry.retry_count = 1;
        retry.previous_run_id = Some(first.id);
        insert_analysis_run(&conn, &retry).unwrap();

        let runs = get_runs_for_document(&conn, &document_id).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].previous_run_id, Some(first.id));
        assert!(get_analysis_run(&conn, &Uuid::new_v4()).unwrap().is_none());
    }
}
