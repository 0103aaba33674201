//! Turns uploaded files into text blocks the model can read.
//!
//! Plain-text formats are decoded here. Office and PDF formats are handed to a
//! [`DocumentExtractor`]; extraction failures stay attached to the individual
//! file so one bad upload never blocks the rest of the message.

use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::conversation::AttachmentMeta;

mod blob;

pub use blob::{
    AttachmentBlobStore, BlobFuture, BlobStoreError, InMemoryBlobStore, LocalDirBlobStore,
    StoredAttachment, StoredAttachmentMetadata,
};

pub const DEFAULT_MAX_ATTACHMENT_CHARS: usize = 100_000;
const MAX_FILE_NAME_CHARS: usize = 100;
const TRUNCATION_MARKER: &str = "\n[... content truncated]";

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "csv", "json", "md", "js", "ts", "py", "java", "cpp", "c", "html", "css", "xml",
    "yaml", "yml", "toml", "rs", "log",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Xlsx,
    Pptx,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
            Self::Pptx => "pptx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Text,
    Document(DocumentFormat),
    Unsupported,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("file content is not valid base64")]
    InvalidEncoding,
    #[error("unsupported file type: {declared_type} (.{extension})")]
    UnsupportedFormat {
        declared_type: String,
        extension: String,
    },
    #[error("text extraction is not available for {0} files")]
    ExtractorUnavailable(&'static str),
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("no text found in file")]
    EmptyText,
}

/// Text extraction for binary document formats.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, format: DocumentFormat, bytes: &[u8]) -> Result<String, AttachmentError>;
}

/// Extractor used when no document backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedDocumentExtractor;

impl DocumentExtractor for UnsupportedDocumentExtractor {
    fn extract(&self, format: DocumentFormat, _bytes: &[u8]) -> Result<String, AttachmentError> {
        Err(AttachmentError::ExtractorUnavailable(format.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub declared_type: String,
    pub content_base64: String,
}

/// Extracted text for one file, ready to be wrapped into the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBlock {
    pub name: String,
    pub declared_type: String,
    pub text: String,
}

impl AttachmentBlock {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: sanitize_file_name(&name.into()),
            declared_type: "text/plain".to_string(),
            text: text.into(),
        }
    }

    pub fn meta(&self) -> AttachmentMeta {
        AttachmentMeta {
            name: self.name.clone(),
            declared_type: self.declared_type.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedAttachment {
    pub block: AttachmentBlock,
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub error: Option<AttachmentError>,
}

pub fn classify(file_name: &str, declared_type: &str) -> AttachmentKind {
    let extension = file_extension(file_name);
    let mime = declared_type.trim().to_ascii_lowercase();

    if mime == "application/pdf" || extension == "pdf" {
        return AttachmentKind::Document(DocumentFormat::Pdf);
    }
    if mime == "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        || extension == "docx"
    {
        return AttachmentKind::Document(DocumentFormat::Docx);
    }
    if mime == "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        || extension == "xlsx"
    {
        return AttachmentKind::Document(DocumentFormat::Xlsx);
    }
    if mime == "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        || extension == "pptx"
    {
        return AttachmentKind::Document(DocumentFormat::Pptx);
    }
    if mime.starts_with("text/")
        || mime == "application/json"
        || TEXT_EXTENSIONS.contains(&extension.as_str())
    {
        return AttachmentKind::Text;
    }

    AttachmentKind::Unsupported
}

pub fn decode_base64_content(raw: &str) -> Result<Vec<u8>, AttachmentError> {
    let trimmed = raw.trim();
    // Browsers hand over data URLs when reading files with FileReader.
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => trimmed,
    };

    STANDARD
        .decode(payload)
        .map_err(|_| AttachmentError::InvalidEncoding)
}

/// Decodes and extracts one upload. Never fails: errors are carried on the
/// result and rendered into the block text.
pub fn normalize_attachment(
    upload: &AttachmentUpload,
    extractor: &dyn DocumentExtractor,
    max_chars: usize,
) -> NormalizedAttachment {
    let name = sanitize_file_name(&upload.file_name);
    let declared_type = upload.declared_type.trim().to_string();

    let (bytes, extracted) = match decode_base64_content(&upload.content_base64) {
        Ok(bytes) => {
            let extracted = extract_text(&name, &declared_type, &bytes, extractor);
            (bytes, extracted)
        }
        Err(err) => (Vec::new(), Err(err)),
    };

    let (text, truncated, error) = match extracted {
        Ok(text) => {
            let (text, truncated) = truncate_chars(&text, max_chars);
            (text, truncated, None)
        }
        Err(err) => (format!("[File {name} could not be read: {err}]"), false, Some(err)),
    };

    NormalizedAttachment {
        block: AttachmentBlock {
            name,
            declared_type,
            text,
        },
        bytes,
        truncated,
        error,
    }
}

pub fn extract_text(
    file_name: &str,
    declared_type: &str,
    bytes: &[u8],
    extractor: &dyn DocumentExtractor,
) -> Result<String, AttachmentError> {
    let text = match classify(file_name, declared_type) {
        AttachmentKind::Text => decode_text(bytes),
        AttachmentKind::Document(format) => extractor.extract(format, bytes)?,
        AttachmentKind::Unsupported => {
            return Err(AttachmentError::UnsupportedFormat {
                declared_type: declared_type.to_string(),
                extension: file_extension(file_name),
            });
        }
    };

    if text.trim().is_empty() && !bytes.is_empty() {
        return Err(AttachmentError::EmptyText);
    }

    Ok(text)
}

/// UTF-8 first, Latin-1 otherwise. Latin-1 maps every byte, so this cannot fail.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|byte| char::from(*byte)).collect(),
    }
}

pub fn sanitize_file_name(raw: &str) -> String {
    let sanitized = raw
        .trim()
        .chars()
        .map(|ch| match ch {
            '"' | '\'' | '<' | '>' | '\\' | '/' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect::<String>();

    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

/// Breaks up `<file_` and `</file_` sequences (any case) inside file text so
/// content can neither close its own block nor open a forged one.
pub fn neutralize_block_tags(text: &str) -> Cow<'_, str> {
    const TAG: &[u8] = b"file_";
    let bytes = text.as_bytes();
    let mut rewritten: Option<String> = None;
    let mut copied = 0;

    for (index, _) in text.match_indices('<') {
        let mut name_start = index + 1;
        if bytes.get(name_start) == Some(&b'/') {
            name_start += 1;
        }
        let is_block_tag = bytes
            .get(name_start..name_start + TAG.len())
            .is_some_and(|candidate| candidate.eq_ignore_ascii_case(TAG));
        if is_block_tag {
            let out = rewritten.get_or_insert_with(|| String::with_capacity(text.len() + 8));
            out.push_str(&text[copied..name_start]);
            out.push('_');
            copied = name_start;
        }
    }

    match rewritten {
        Some(mut out) => {
            out.push_str(&text[copied..]);
            Cow::Owned(out)
        }
        None => Cow::Borrowed(text),
    }
}

fn file_extension(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(_, extension)| extension.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}
