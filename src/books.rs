//! Book records and seed files.
//!
//! A seed file is a JSON array of book records. Records are validated against
//! [`BookRecord`] and converted to documents for
//! [`DocumentStore::insert_many`](crate::db::DocumentStore::insert_many).

use crate::db::Document;
use crate::error::{Result, ShelfError};
use crate::query::ID_FIELD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

/// A book as stored in the collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub published_year: i64,
    pub price: f64,
    pub in_stock: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    /// Any further fields, kept as given.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BookRecord {
    /// Converts the record into a document. A supplied `_id` is dropped.
    pub fn into_document(mut self) -> Result<Document> {
        if self.extra.remove(ID_FIELD).is_some() {
            warn!("Ignoring '{ID_FIELD}' on '{}'; ids are store-assigned", self.title);
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ShelfError::internal(format!(
                "book record serialized to a non-object: {other}"
            ))),
            Err(e) => Err(ShelfError::internal(format!("Cannot encode book record: {e}"))),
        }
    }
}

/// Parses seed content into documents.
pub fn parse_seed(content: &str) -> Result<Vec<Document>> {
    let records: Vec<BookRecord> = serde_json::from_str(content)
        .map_err(|e| ShelfError::config(format!("Invalid seed data: {e}")))?;
    records.into_iter().map(BookRecord::into_document).collect()
}

/// Loads a seed file.
pub fn load_seed(path: &Path) -> Result<Vec<Document>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ShelfError::config(format!("Failed to read seed file {}: {e}", path.display()))
    })?;
    let docs = parse_seed(&content)?;
    debug!("Loaded {} books from {}", docs.len(), path.display());
    Ok(docs)
}
