//! In-crate collaborators: a format-sniffing document service and the
//! mock services used by tests and offline runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use base64::Engine;
use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{AiAnalysisError, DocumentProcessingError};
use super::types::{
    AnalysisService, DocumentService, PreparedDocument, PreparedPage, RawExtraction, RawField,
};
use crate::models::{DocumentKind, TypeCandidate};

const MAX_DOCUMENT_SIZE: usize = 50 * 1024 * 1024; // 50MB

static PDF_PAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/Type\s*/Page\b").unwrap());

/// Compute SHA-256 content hash, base64-encoded.
pub fn compute_content_hash(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Classify bytes by magic number (NOT by file extension).
pub fn sniff_kind(bytes: &[u8]) -> Option<(DocumentKind, &'static str)> {
    match bytes {
        [0x25, 0x50, 0x44, 0x46, ..] => Some((DocumentKind::Pdf, "application/pdf")),
        [0xFF, 0xD8, 0xFF, ..] => Some((DocumentKind::Image, "image/jpeg")),
        [0x89, 0x50, 0x4E, 0x47, ..] => Some((DocumentKind::Image, "image/png")),
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => {
            Some((DocumentKind::Image, "image/tiff"))
        }
        _ if is_likely_text(bytes) => Some((DocumentKind::PlainText, "text/plain")),
        _ => None,
    }
}

fn is_likely_text(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(8192)];
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte char may straddle the cut.
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 >= head.len(),
    }
}

/// PNG dimensions from the IHDR chunk.
fn png_dimensions(bytes: &[u8]) -> Option<(f64, f64)> {
    if bytes.len() < 24 || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width as f64, height as f64))
}

/// Document service that identifies the format and passes the payload
/// through without rasterizing. Real decoders plug in behind the same trait.
pub struct FormatSniffingDocumentService {
    max_size: usize,
}

impl FormatSniffingDocumentService {
    pub fn new() -> Self {
        Self {
            max_size: MAX_DOCUMENT_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for FormatSniffingDocumentService {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentService for FormatSniffingDocumentService {
    fn prepare(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<PreparedDocument, DocumentProcessingError> {
        if bytes.is_empty() {
            return Err(DocumentProcessingError::Empty);
        }
        if bytes.len() > self.max_size {
            return Err(DocumentProcessingError::TooLarge {
                size: bytes.len(),
                max: self.max_size,
            });
        }

        let (kind, mime_type) = sniff_kind(bytes).ok_or_else(|| {
            DocumentProcessingError::UnsupportedFormat(format!("unrecognized content in {filename}"))
        })?;

        let mut metadata = BTreeMap::new();
        metadata.insert("mime_type".to_string(), serde_json::json!(mime_type));

        let (pages, payload_base64, page_height) = match kind {
            DocumentKind::PlainText => {
                let text = String::from_utf8_lossy(bytes);
                let pages: Vec<PreparedPage> = text
                    .split('\x0C')
                    .enumerate()
                    .map(|(i, page)| PreparedPage {
                        page_number: i as u32 + 1,
                        text: Some(page.to_string()),
                        width: None,
                        height: None,
                    })
                    .collect();
                (pages, None, None)
            }
            DocumentKind::Pdf => {
                let count = PDF_PAGE.find_iter(bytes).count().max(1);
                let pages = (1..=count as u32)
                    .map(|page_number| PreparedPage {
                        page_number,
                        text: None,
                        width: None,
                        height: None,
                    })
                    .collect();
                let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
                (pages, Some(payload), None)
            }
            DocumentKind::Image | DocumentKind::Unknown => {
                let dims = png_dimensions(bytes);
                let page = PreparedPage {
                    page_number: 1,
                    text: None,
                    width: dims.map(|(w, _)| w),
                    height: dims.map(|(_, h)| h),
                };
                let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
                (vec![page], Some(payload), dims.map(|(_, h)| h))
            }
        };

        metadata.insert("page_count".to_string(), serde_json::json!(pages.len()));

        tracing::debug!(
            filename,
            kind = kind.as_str(),
            pages = pages.len(),
            "Document prepared"
        );

        Ok(PreparedDocument {
            document_id: Uuid::new_v4(),
            filename: filename.to_string(),
            kind,
            pages,
            metadata,
            content_hash: compute_content_hash(bytes),
            payload_base64,
            page_height,
            size_bytes: bytes.len(),
        })
    }
}

// ─────────────────────────────────────────────
// Mocks
// ─────────────────────────────────────────────

/// Mock document service that returns a one-page text document, or a
/// configured failure.
pub struct MockDocumentService {
    page_height: Option<f64>,
    failure: Option<String>,
}

impl MockDocumentService {
    pub fn new() -> Self {
        Self {
            page_height: Some(1000.0),
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            page_height: None,
            failure: Some(message.to_string()),
        }
    }
}

impl Default for MockDocumentService {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentService for MockDocumentService {
    fn prepare(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<PreparedDocument, DocumentProcessingError> {
        if let Some(message) = &self.failure {
            return Err(DocumentProcessingError::Decode(message.clone()));
        }
        Ok(PreparedDocument {
            document_id: Uuid::new_v4(),
            filename: filename.to_string(),
            kind: DocumentKind::PlainText,
            pages: vec![PreparedPage {
                page_number: 1,
                text: Some(String::from_utf8_lossy(bytes).into_owned()),
                width: None,
                height: self.page_height,
            }],
            metadata: BTreeMap::new(),
            content_hash: compute_content_hash(bytes),
            payload_base64: None,
            page_height: self.page_height,
            size_bytes: bytes.len(),
        })
    }
}

/// Mock analysis service with a default extraction, optional per-model
/// overrides, an optional failure and an optional artificial delay.
pub struct MockAnalysisService {
    default: RawExtraction,
    per_model: HashMap<String, RawExtraction>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    models_seen: Mutex<Vec<String>>,
}

impl MockAnalysisService {
    pub fn new(extraction: RawExtraction) -> Self {
        Self {
            default: extraction,
            per_model: HashMap::new(),
            failure: None,
            delay: None,
            calls: AtomicUsize::new(0),
            models_seen: Mutex::new(Vec::new()),
        }
    }

    /// A small invoice extraction with three confident fields.
    pub fn invoice() -> Self {
        Self::new(sample_invoice_extraction())
    }

    pub fn failing(message: &str) -> Self {
        let mut mock = Self::new(sample_invoice_extraction());
        mock.failure = Some(message.to_string());
        mock
    }

    pub fn with_model(mut self, model: &str, extraction: RawExtraction) -> Self {
        self.per_model.insert(model.to_string(), extraction);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn models_seen(&self) -> Vec<String> {
        self.models_seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

impl AnalysisService for MockAnalysisService {
    fn analyze(
        &self,
        _document: &PreparedDocument,
        model: &str,
        _type_hint: Option<&str>,
    ) -> Result<RawExtraction, AiAnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.models_seen.lock() {
            seen.push(model.to_string());
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = &self.failure {
            return Err(AiAnalysisError::ServiceUnavailable(message.clone()));
        }
        Ok(self
            .per_model
            .get(model)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

fn sample_invoice_extraction() -> RawExtraction {
    RawExtraction {
        document_type: "invoice".to_string(),
        confidence: 0.9,
        alternative_types: vec![TypeCandidate {
            document_type: "receipt".to_string(),
            confidence: 0.3,
        }],
        type_indicators: vec!["invoice number".to_string(), "total due".to_string()],
        template_matches: vec![],
        fields: vec![
            RawField::uniform("invoice_number", "identifier", Some("INV-2024-001"), 0.92),
            RawField::uniform("invoice_date", "date", Some("2024-01-15"), 0.88),
            RawField::uniform("total_amount", "currency", Some("$1,250.00"), 0.9),
        ],
        quality: Some(0.9),
    }
}
