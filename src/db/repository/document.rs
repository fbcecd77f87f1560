use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{DatabaseError, DocumentRecord};
use crate::pipeline::types::PreparedDocument;

const DOCUMENT_COLUMNS: &str = "id, filename, kind, pages, metadata, content_hash,
     payload_base64, page_height, size_bytes";

pub fn insert_document(conn: &Connection, doc: &PreparedDocument) -> Result<(), DatabaseError> {
    let record = DocumentRecord::to_record(doc)?;
    conn.execute(
        "INSERT INTO documents (id, filename, kind, pages, metadata, content_hash,
         payload_base64, page_height, size_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.filename,
            record.kind,
            record.pages,
            record.metadata,
            record.content_hash,
            record.payload_base64,
            record.page_height,
            record.size_bytes,
        ],
    )?;
    Ok(())
}

pub fn get_document(conn: &Connection, id: &Uuid) -> Result<Option<PreparedDocument>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"
    ))?;

    let result = stmt.query_row(params![id.to_string()], document_record_from_row);

    match result {
        Ok(record) => Ok(Some(DocumentRecord::from_record(&record)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Latest document with the same content, for duplicate detection.
pub fn get_document_by_hash(
    conn: &Connection,
    content_hash: &str,
) -> Result<Option<PreparedDocument>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = ?1
         ORDER BY ingested_at DESC LIMIT 1"
    ))?;

    let result = stmt.query_row(params![content_hash], document_record_from_row);

    match result {
        Ok(record) => Ok(Some(DocumentRecord::from_record(&record)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn document_record_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        kind: row.get(2)?,
        pages: row.get(3)?,
        metadata: row.get(4)?,
        content_hash: row.get(5)?,
        payload_base64: row.get(6)?,
        page_height: row.get(7)?,
        size_bytes: row.get(8)?,
    })
}
