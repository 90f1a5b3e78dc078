//! On-disk document formats.
//!
//! Supported layouts:
//! - `.tid`: `name: value` header lines, a blank line, then the body text
//! - `.json`: an array of field objects (one file may hold several documents)
//! - `<name>.<ext>` + `<name>.<ext>.meta`: raw body in the primary file, the
//!   remaining fields in a sidecar using the `.tid` header syntax

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use super::{Document, Fields, TEXT_FIELD, TITLE_FIELD, TYPE_FIELD, stringify_list};

/// Content type assumed when a document declares none.
pub const DEFAULT_CONTENT_TYPE: &str = "text/vnd.tiddlywiki";

/// Suffix appended to a primary file name to form its sidecar.
pub const SIDECAR_SUFFIX: &str = ".meta";

/// Text content types stored as raw files with a sidecar.
const TEXT_TYPES: &[(&str, &str)] = &[
    ("text/plain", "txt"),
    ("text/markdown", "md"),
    ("text/x-markdown", "md"),
    ("text/css", "css"),
    ("text/html", "html"),
    ("text/csv", "csv"),
    ("application/javascript", "js"),
    ("application/json", "json"),
    ("image/svg+xml", "svg"),
];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {reason}")]
    Json { path: PathBuf, reason: String },

    #[error("No documents found in {path}")]
    Empty { path: PathBuf },

    #[error("Unsupported file type: {path}")]
    Unsupported { path: PathBuf },

    #[error("Failed to encode '{title}': {reason}")]
    Encode { title: String, reason: String },
}

/// A document rendered to file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedDocument {
    /// Extension of the primary file, without the dot.
    pub extension: &'static str,
    pub content: String,
    /// Sidecar contents, when the primary file holds only the body.
    pub sidecar: Option<String>,
    pub content_type: String,
}

/// Extension for a text content type stored raw, if any.
pub fn extension_for_type(content_type: &str) -> Option<&'static str> {
    TEXT_TYPES
        .iter()
        .find(|(ty, _)| *ty == content_type)
        .map(|(_, ext)| *ext)
}

/// Content type implied by a raw file's extension.
pub fn type_for_extension(extension: &str) -> Option<&'static str> {
    TEXT_TYPES
        .iter()
        .find(|(_, ext)| ext.eq_ignore_ascii_case(extension))
        .map(|(ty, _)| *ty)
}

/// Path of the sidecar belonging to `primary`.
pub fn sidecar_path(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// If `path` is a sidecar, the primary file it describes.
pub fn primary_for_sidecar(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SIDECAR_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(stem))
}

/// Render a document into the format its content type calls for.
pub fn encode(doc: &Document) -> Result<EncodedDocument, CodecError> {
    let content_type = doc.content_type().to_string();
    let header_is_multiline = doc
        .fields()
        .iter()
        .any(|(name, value)| name != TEXT_FIELD && value.contains('\n'));

    if header_is_multiline {
        return encode_json(doc, content_type);
    }

    if content_type == DEFAULT_CONTENT_TYPE {
        return Ok(EncodedDocument {
            extension: "tid",
            content: encode_tid(doc.fields()),
            sidecar: None,
            content_type,
        });
    }

    match extension_for_type(&content_type) {
        Some(extension) => {
            let body = doc.field(TEXT_FIELD).unwrap_or_default().to_string();
            Ok(EncodedDocument {
                extension,
                content: body,
                sidecar: Some(encode_header(doc.fields())),
                content_type,
            })
        }
        // Unknown types keep every field, body included, in JSON.
        None => encode_json(doc, content_type),
    }
}

fn encode_json(doc: &Document, content_type: String) -> Result<EncodedDocument, CodecError> {
    let content = serde_json::to_string_pretty(&[doc.fields()]).map_err(|e| CodecError::Encode {
        title: doc.title().to_string(),
        reason: e.to_string(),
    })?;
    Ok(EncodedDocument {
        extension: "json",
        content,
        sidecar: None,
        content_type,
    })
}

fn encode_header(fields: &Fields) -> String {
    let mut out = String::new();
    for (name, value) in fields {
        if name == TEXT_FIELD {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn encode_tid(fields: &Fields) -> String {
    let mut out = encode_header(fields);
    out.push('\n');
    if let Some(text) = fields.get(TEXT_FIELD) {
        out.push_str(text);
    }
    out
}

fn parse_header(raw: &str, fields: &mut Fields) {
    for line in raw.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        fields.insert(name.to_string(), value.trim().to_string());
    }
}

fn parse_tid(raw: &str) -> Fields {
    let normalized;
    let raw = if raw.contains("\r\n") {
        normalized = raw.replace("\r\n", "\n");
        normalized.as_str()
    } else {
        raw
    };

    let (header, body) = match raw.split_once("\n\n") {
        Some((header, body)) => (header, Some(body)),
        None => (raw, None),
    };

    let mut fields = Fields::new();
    parse_header(header, &mut fields);
    if let Some(body) = body {
        if !body.is_empty() {
            fields.insert(TEXT_FIELD.to_string(), body.to_string());
        }
    }
    fields
}

fn json_field_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let items: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            stringify_list(&items)
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_json(path: &Path, raw: &str) -> Result<Vec<Fields>, CodecError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| CodecError::Json {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let objects = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => {
            return Err(CodecError::Json {
                path: path.to_path_buf(),
                reason: "expected an array of objects".to_string(),
            });
        }
    };

    let documents = objects
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(
                map.iter()
                    .map(|(name, value)| (name.clone(), json_field_value(value)))
                    .collect::<Fields>(),
            ),
            _ => None,
        })
        .filter(|fields| fields.contains_key(TITLE_FIELD))
        .collect();

    Ok(documents)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decode the documents held by a primary file.
///
/// `sidecar` carries the contents of the matching `.meta` file, if any.
pub fn decode(path: &Path, raw: &str, sidecar: Option<&str>) -> Result<Vec<Fields>, CodecError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let documents = if let Some(meta) = sidecar {
        let mut fields = Fields::new();
        parse_header(meta, &mut fields);
        fields
            .entry(TITLE_FIELD.to_string())
            .or_insert_with(|| file_stem(path));
        if let Some(ty) = type_for_extension(&extension) {
            fields
                .entry(TYPE_FIELD.to_string())
                .or_insert_with(|| ty.to_string());
        }
        fields.insert(TEXT_FIELD.to_string(), raw.to_string());
        vec![fields]
    } else {
        match extension.as_str() {
            "tid" => vec![parse_tid(raw)],
            "json" => parse_json(path, raw)?,
            other => match type_for_extension(other) {
                Some(ty) => {
                    let mut fields = Fields::new();
                    fields.insert(TITLE_FIELD.to_string(), file_stem(path));
                    fields.insert(TYPE_FIELD.to_string(), ty.to_string());
                    fields.insert(TEXT_FIELD.to_string(), raw.to_string());
                    vec![fields]
                }
                None => {
                    return Err(CodecError::Unsupported {
                        path: path.to_path_buf(),
                    });
                }
            },
        }
    };

    let documents: Vec<Fields> = documents
        .into_iter()
        .filter(|fields| fields.get(TITLE_FIELD).is_some_and(|t| !t.is_empty()))
        .collect();

    if documents.is_empty() {
        return Err(CodecError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(documents)
}

/// Read and decode the documents held by `path`, including its sidecar.
pub fn read_documents(path: &Path) -> Result<Vec<Fields>, CodecError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CodecError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let meta_path = sidecar_path(path);
    let sidecar = if meta_path.is_file() {
        Some(
            std::fs::read_to_string(&meta_path).map_err(|source| CodecError::Read {
                path: meta_path.clone(),
                source,
            })?,
        )
    } else {
        None
    };

    decode(path, &raw, sidecar.as_deref())
}

/// Pick the document titled `title` out of a decoded file.
///
/// Falls back to the first document when none matches.
pub fn select_document(mut documents: Vec<Fields>, title: &str) -> Option<Fields> {
    let position = documents
        .iter()
        .position(|fields| fields.get(TITLE_FIELD).is_some_and(|t| t == title))
        .unwrap_or(0);
    if position < documents.len() {
        Some(documents.swap_remove(position))
    } else {
        None
    }
}
