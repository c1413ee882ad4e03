//! Rendering of labeled result blocks.
//!
//! Text output prints one block per query: a header line with the label,
//! then one line per result item. JSON output prints one object per query.

use crate::db::{BucketId, BucketRow, Document, ExecutionPlan, IndexInfo, QueryOutput};
use crate::error::{Result, ShelfError};
use crate::query::{LabeledOutput, ID_FIELD};
use serde_json::Value;
use std::fmt::Write as _;
use std::io::Write;

/// Output format for result blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Labeled plain text blocks.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: text or json")),
        }
    }
}

/// Renders one result block in the given format.
pub fn render(item: &LabeledOutput, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(item)),
        OutputFormat::Json => render_json(item),
    }
}

/// Writes one result block, followed by a newline.
pub fn write_block(out: &mut impl Write, item: &LabeledOutput, format: OutputFormat) -> Result<()> {
    let block = render(item, format)?;
    writeln!(out, "{block}")
        .and_then(|_| out.flush())
        .map_err(|e| ShelfError::internal(format!("Failed to write output: {e}")))
}

/// Renders a block as a single-line JSON object.
///
/// Group and bucket rows use the same documents as the text output.
pub fn render_json(item: &LabeledOutput) -> Result<String> {
    let rows: Option<Vec<Value>> = match &item.output {
        QueryOutput::Groups(rows) => Some(
            rows.iter()
                .map(|row| Value::Object(row.to_document()))
                .collect(),
        ),
        QueryOutput::Buckets(rows) => Some(
            rows.iter()
                .map(|row| Value::Object(bucket_document(row)))
                .collect(),
        ),
        _ => None,
    };

    let mut value = serde_json::to_value(item).map_err(encode_error)?;
    if let Some(rows) = rows {
        if let Some(result) = value.get_mut("result").and_then(Value::as_object_mut) {
            result.insert("data".to_string(), Value::Array(rows));
        }
    }
    serde_json::to_string(&value).map_err(encode_error)
}

fn encode_error(e: serde_json::Error) -> ShelfError {
    ShelfError::internal(format!("Failed to encode result: {e}"))
}

/// Renders a block as labeled text.
pub fn render_text(item: &LabeledOutput) -> String {
    let mut out = format!("=== {} ===\n", item.label);

    match &item.output {
        QueryOutput::Documents(docs) => {
            for doc in docs {
                let _ = writeln!(out, "{}", document_line(doc));
            }
            let _ = write!(out, "({} document{})", docs.len(), plural(docs.len()));
        }
        QueryOutput::Groups(rows) => {
            for row in rows {
                let _ = writeln!(out, "{}", document_line(&row.to_document()));
            }
            let _ = write!(out, "({} group{})", rows.len(), plural(rows.len()));
        }
        QueryOutput::Buckets(rows) => {
            for row in rows {
                let _ = writeln!(out, "{}", document_line(&bucket_document(row)));
            }
            let _ = write!(out, "({} bucket{})", rows.len(), plural(rows.len()));
        }
        QueryOutput::IndexCreated(outcome) if outcome.created => {
            let _ = write!(out, "created index {}", outcome.name);
        }
        QueryOutput::IndexCreated(outcome) => {
            let _ = write!(out, "index {} already exists", outcome.name);
        }
        QueryOutput::Indexes(indexes) => {
            let lines: Vec<String> = indexes.iter().map(index_line).collect();
            out.push_str(&lines.join("\n"));
            if indexes.is_empty() {
                out.push_str("(no indexes)");
            }
        }
        QueryOutput::Plan(plan) => out.push_str(&plan_lines(plan)),
    }

    out
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn document_line(doc: &Document) -> String {
    Value::Object(doc.clone()).to_string()
}

/// Renders a bucket the way the bucket stage reports it: `_id` is the lower
/// boundary, or the overflow label.
fn bucket_document(row: &BucketRow) -> Document {
    let id = match &row.id {
        BucketId::Range { lower, .. } => lower.clone(),
        BucketId::Overflow(label) => Value::String(label.clone()),
    };
    let mut doc = Document::new();
    doc.insert(ID_FIELD.to_string(), id);
    doc.insert("count".to_string(), Value::from(row.count));
    doc
}

fn index_line(index: &IndexInfo) -> String {
    format!("{}  {}", index.name, index.key_document())
}

fn plan_lines(plan: &ExecutionPlan) -> String {
    let stage = match &plan.index_name {
        Some(name) => format!("{} ({name})", plan.stage),
        None => plan.stage.to_string(),
    };
    let examined = plan
        .docs_examined
        .map(|n| n.to_string())
        .unwrap_or_else(|| "n/a".to_string());

    let mut out = String::new();
    let _ = writeln!(out, "query:    {}", plan.parsed_query);
    let _ = writeln!(out, "stage:    {stage}");
    let _ = writeln!(out, "examined: {examined}");
    let _ = writeln!(out, "returned: {}", plan.docs_returned);
    let _ = write!(
        out,
        "time:     {:.3} ms",
        plan.execution_time.as_secs_f64() * 1000.0
    );
    for detail in &plan.details {
        let _ = write!(out, "\n  {detail}");
    }
    out
}
