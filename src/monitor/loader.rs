//! Credentials record loading
//!
//! The record is a JSON document with case-insensitive field names:
//!
//! ```json
//! { "Username": "svc", "Password": "...", "LastModified": "2024-01-01T00:00:00Z" }
//! ```
//!
//! `LastModified` is informational only. A record's `observed_at` always comes
//! from the storage-reported modification time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::error::Category;
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::RecordError;
use crate::record::{generate_secret, CredentialRecord};

const PLACEHOLDER_USERNAME: &str = "serviceaccount";

/// Source of the current credentials record.
///
/// `Ok(None)` means the record does not exist. A parse or read failure never
/// yields a partial record.
pub trait RecordLoader: Send + Sync {
    fn load(&self) -> Result<Option<CredentialRecord>, RecordError>;
}

/// Loads the record from a JSON file
#[derive(Debug, Clone)]
pub struct FileRecordLoader {
    path: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RecordDocument<'a> {
    username: &'a str,
    password: &'a str,
    last_modified: DateTime<Utc>,
}

impl FileRecordLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a placeholder record if none exists so there is something to watch.
    ///
    /// Returns `true` when a placeholder was written.
    pub fn ensure_placeholder(&self, secret_length: usize) -> Result<bool, RecordError> {
        if self.path.exists() {
            return Ok(false);
        }

        let write_error = |source| RecordError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let secret = generate_secret(secret_length);
        let document = RecordDocument {
            username: PLACEHOLDER_USERNAME,
            password: &secret,
            last_modified: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&document)
            .map_err(|e| write_error(std::io::Error::from(e)))?;

        fs::write(&self.path, contents).map_err(write_error)?;
        info!("Created placeholder credentials record at {:?}", self.path);
        Ok(true)
    }
}

impl RecordLoader for FileRecordLoader {
    fn load(&self) -> Result<Option<CredentialRecord>, RecordError> {
        let read_error = |source| RecordError::Read {
            path: self.path.clone(),
            source,
        };

        let modified = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.modified().map_err(read_error)?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(read_error(e)),
        };

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(read_error(e)),
        };

        parse_record(&contents, DateTime::<Utc>::from(modified))
            .map(Some)
            .map_err(|reason| RecordError::Parse {
                path: self.path.clone(),
                reason,
            })
    }
}

/// Parse record contents. Errors never include field values.
fn parse_record(contents: &str, observed_at: DateTime<Utc>) -> Result<CredentialRecord, String> {
    let document: Map<String, Value> =
        serde_json::from_str(contents).map_err(|e| describe_json_error(&e))?;

    let username = string_field(&document, "username")?;
    let secret = string_field(&document, "password")?;

    if username.is_empty() {
        return Err("username is empty".to_string());
    }

    match field(&document, "lastmodified") {
        Some(Value::String(raw)) if DateTime::parse_from_rfc3339(raw).is_err() => {
            debug!("Ignoring unparsable LastModified value in credentials record");
        }
        _ => {}
    }

    Ok(CredentialRecord::new(username, secret, observed_at))
}

/// Position and category only; serde_json messages can quote the document
fn describe_json_error(e: &serde_json::Error) -> String {
    let category = match e.classify() {
        Category::Io => "unreadable",
        Category::Syntax => "invalid JSON syntax",
        Category::Data => "expected a JSON object",
        Category::Eof => "unexpected end of input",
    };
    format!("{} at line {} column {}", category, e.line(), e.column())
}

fn field<'a>(document: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    document
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn string_field<'a>(document: &'a Map<String, Value>, name: &str) -> Result<&'a str, String> {
    match field(document, name) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(format!("field '{}' must be a string", name)),
        None => Err(format!("missing field '{}'", name)),
    }
}
