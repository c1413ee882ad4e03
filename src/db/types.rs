//! Query result types for shelfscan.
//!
//! Defines the structures used to represent what a store returns for each
//! kind of query.

use crate::query::{BucketSpec, IndexKey, Projection, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::time::Duration;

/// A JSON document as stored in a collection.
pub type Document = Map<String, Value>;

/// Result of executing one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QueryOutput {
    /// Whole or projected documents.
    Documents(Vec<Document>),
    /// One row per group.
    Groups(Vec<GroupRow>),
    /// One row per non-empty bucket.
    Buckets(Vec<BucketRow>),
    /// Outcome of an index creation request.
    IndexCreated(IndexOutcome),
    /// Index definitions of the collection.
    Indexes(Vec<IndexInfo>),
    /// How the store satisfied a query.
    Plan(ExecutionPlan),
}

impl QueryOutput {
    /// Number of items in the result, for log output.
    pub fn len(&self) -> usize {
        match self {
            Self::Documents(docs) => docs.len(),
            Self::Groups(rows) => rows.len(),
            Self::Buckets(rows) => rows.len(),
            Self::Indexes(indexes) => indexes.len(),
            Self::IndexCreated(_) | Self::Plan(_) => 1,
        }
    }

    /// Returns true if the result holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A group key and its computed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    /// Group key; `null` collects documents missing the field.
    pub key: Value,
    /// Name of the computed value (e.g. `averagePrice`).
    pub output: String,
    /// Computed value; `null` when no numeric input was seen.
    pub value: Value,
}

impl GroupRow {
    /// Renders the row as `{ "_id": key, output: value }`.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), self.key.clone());
        doc.insert(self.output.clone(), self.value.clone());
        doc
    }

    /// Computed value as a float, if numeric.
    pub fn value_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

/// Identity of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BucketId {
    /// `[lower, upper)`.
    Range { lower: Value, upper: Value },
    /// Values outside every range.
    Overflow(String),
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { lower, upper } => write!(f, "[{lower}, {upper})"),
            Self::Overflow(label) => write!(f, "{label}"),
        }
    }
}

/// Number of documents that fell into one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    pub id: BucketId,
    pub count: u64,
}

/// Builds bucket rows from `(bucket index, count)` pairs.
///
/// Index `-1` (or any index outside the boundaries) is the overflow bucket.
/// Rows come out by lower boundary ascending, overflow last; empty buckets are
/// omitted.
pub fn assemble_buckets(
    spec: &BucketSpec,
    counts: impl IntoIterator<Item = (i64, u64)>,
) -> Vec<BucketRow> {
    let ranges = spec.boundaries.len().saturating_sub(1);
    let mut per_bucket = vec![0u64; ranges];
    let mut overflow = 0u64;

    for (index, count) in counts {
        match usize::try_from(index).ok().filter(|i| *i < ranges) {
            Some(i) => per_bucket[i] += count,
            None => overflow += count,
        }
    }

    let mut rows: Vec<BucketRow> = per_bucket
        .into_iter()
        .enumerate()
        .filter(|(_, count)| *count > 0)
        .map(|(i, count)| BucketRow {
            id: BucketId::Range {
                lower: json_number(spec.boundaries[i]),
                upper: json_number(spec.boundaries[i + 1]),
            },
            count,
        })
        .collect();

    if overflow > 0 {
        rows.push(BucketRow {
            id: BucketId::Overflow(spec.default.clone()),
            count: overflow,
        });
    }
    rows
}

/// Result of an index creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub name: String,
    /// False when an identical index already existed.
    pub created: bool,
}

/// An index definition as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Vec<IndexKey>,
}

impl IndexInfo {
    /// The implicit index on `_id`.
    pub fn id_index() -> Self {
        Self {
            name: crate::query::ID_INDEX_NAME.to_string(),
            keys: vec![IndexKey::asc(ID_FIELD)],
        }
    }

    /// Renders keys as `{ field: 1, other: -1 }`.
    pub fn key_document(&self) -> Value {
        let mut map = Map::new();
        for key in &self.keys {
            map.insert(key.field.clone(), Value::from(key.direction.as_i32()));
        }
        Value::Object(map)
    }
}

/// How the engine scanned the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStage {
    /// Every document was read.
    #[serde(rename = "COLLSCAN")]
    CollectionScan,
    /// An index narrowed the documents read.
    #[serde(rename = "IXSCAN")]
    IndexScan,
}

impl fmt::Display for ScanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollectionScan => write!(f, "COLLSCAN"),
            Self::IndexScan => write!(f, "IXSCAN"),
        }
    }
}

/// Execution statistics for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The filter that was explained, as a filter document.
    pub parsed_query: Value,
    pub stage: ScanStage,
    /// Index chosen by the engine, by its logical name.
    pub index_name: Option<String>,
    /// Documents read; `None` when the engine does not report it.
    pub docs_examined: Option<u64>,
    pub docs_returned: u64,
    #[serde(with = "duration_serde")]
    pub execution_time: Duration,
    /// Engine-specific plan lines.
    pub details: Vec<String>,
}

/// Converts a float to a JSON number, as an integer when it has no fraction.
pub fn json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Applies an inclusion projection to a document.
///
/// `_id` is kept first when included; requested fields missing from the
/// document are skipped.
pub fn project(doc: &Document, projection: &Projection) -> Document {
    let mut out = Document::new();
    if projection.include_id {
        if let Some(id) = doc.get(ID_FIELD) {
            out.insert(ID_FIELD.to_string(), id.clone());
        }
    }
    for field in &projection.fields {
        if let Some(value) = doc.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// Builds the document returned to callers: `_id` first, then stored fields.
pub fn with_id(id: i64, body: Document) -> Document {
    let mut doc = Document::new();
    doc.insert(ID_FIELD.to_string(), Value::from(id));
    for (key, value) in body {
        if key != ID_FIELD {
            doc.insert(key, value);
        }
    }
    doc
}

/// Serde support for Duration (not natively supported by serde).
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_secs_f64() * 1000.0).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(millis.max(0.0) / 1000.0))
    }
}
