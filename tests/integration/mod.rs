//! Integration tests for shelfscan.

pub mod postgres_test;
pub mod report_test;
pub mod sqlite_test;

use serde_json::Value;
use shelfscan::books::parse_seed;
use shelfscan::db::Document;

/// The sample dataset shipped in `data/books.json`.
pub fn sample_books() -> Vec<Document> {
    parse_seed(include_str!("../../data/books.json")).expect("sample dataset parses")
}

/// Builds documents from JSON object literals.
pub fn documents(values: &[Value]) -> Vec<Document> {
    values
        .iter()
        .map(|v| v.as_object().cloned().expect("object literal"))
        .collect()
}
