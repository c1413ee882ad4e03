//! Query specifications.
//!
//! A [`QuerySpec`] is a labeled, immutable request. Its [`QueryKind`] is one of
//! the tagged variants the runner dispatches on.

use super::filter::Filter;
use crate::error::{Result, ShelfError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field name reserved for the store-assigned document identity.
pub const ID_FIELD: &str = "_id";

/// Name of the implicit index on `_id`.
pub const ID_INDEX_NAME: &str = "_id_";

/// Longest index name, in bytes, that Postgres keeps without truncating.
pub const MAX_INDEX_NAME_LEN: usize = 63;

/// A named query in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Label printed above the result block.
    pub label: String,

    #[serde(flatten)]
    pub kind: QueryKind,
}

impl QuerySpec {
    /// Creates a spec from a label and a kind.
    pub fn new(label: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            label: label.into(),
            kind,
        }
    }

    /// Validates field names, bounds and operands without touching a store.
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            QueryKind::Filter(spec) | QueryKind::Explain(spec) => spec.validate(),
            QueryKind::Sort(spec) => validate_field(&spec.field),
            QueryKind::Page(spec) => spec.validate(),
            QueryKind::Group(spec) => spec.validate(),
            QueryKind::Bucket(spec) => spec.validate(),
            QueryKind::CreateIndex(spec) => spec.validate(),
            QueryKind::ListIndexes => Ok(()),
        }
    }
}

/// The tagged variants of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryKind {
    /// Predicate match, optionally projected.
    Filter(FilterSpec),
    /// Whole collection ordered by one field.
    Sort(SortSpec),
    /// Offset/limit window in natural order.
    Page(PageSpec),
    /// Group by one field with an accumulator.
    Group(GroupSpec),
    /// Count documents per numeric range.
    Bucket(BucketSpec),
    /// Create an index if it does not exist.
    CreateIndex(IndexSpec),
    /// List the collection's indexes.
    ListIndexes,
    /// Report how the store satisfies a filter.
    Explain(FilterSpec),
}

impl QueryKind {
    /// Short name of the variant, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Filter(_) => "filter",
            Self::Sort(_) => "sort",
            Self::Page(_) => "page",
            Self::Group(_) => "group",
            Self::Bucket(_) => "bucket",
            Self::CreateIndex(_) => "create_index",
            Self::ListIndexes => "list_indexes",
            Self::Explain(_) => "explain",
        }
    }
}

/// A filter with an optional projection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub filter: Filter,

    /// Fields to return. `None` returns whole documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
}

impl FilterSpec {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            projection: None,
        }
    }

    /// Restricts returned documents to `projection`.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        for field in self.filter.fields() {
            validate_field(field)?;
        }
        if let Some(projection) = &self.projection {
            projection.validate()?;
        }
        Ok(())
    }
}

/// Inclusion projection: only the listed fields (plus `_id` when included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub fields: Vec<String>,

    #[serde(default = "default_true")]
    pub include_id: bool,
}

fn default_true() -> bool {
    true
}

impl Projection {
    /// Projects onto `fields`, suppressing `_id`.
    pub fn without_id<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            include_id: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.fields.is_empty() && !self.include_id {
            return Err(ShelfError::query("projection selects no fields"));
        }
        for field in &self.fields {
            if field.contains('.') {
                return Err(ShelfError::query(format!(
                    "projection supports top-level fields only, got '{field}'"
                )));
            }
            validate_field(field)?;
        }
        Ok(())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Returns `1` or `-1`, as index keys are written.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }

    /// Returns the SQL keyword.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Orders the whole collection by one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// An offset/limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpec {
    #[serde(default)]
    pub offset: u64,
    pub limit: u64,
}

impl PageSpec {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ShelfError::query("page limit must be at least 1"));
        }
        Ok(())
    }
}

/// Accumulator computed per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accumulator {
    /// Number of documents in the group.
    Count,
    /// Arithmetic mean of a numeric field; non-numeric values are ignored.
    Avg(String),
    /// Sum of a numeric field; non-numeric values are ignored.
    Sum(String),
}

impl Accumulator {
    /// The field the accumulator reads, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Count => None,
            Self::Avg(field) | Self::Sum(field) => Some(field),
        }
    }
}

/// Groups documents by one field and computes a value per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub group_by: String,
    pub accumulator: Accumulator,

    /// Name of the computed value in the output (e.g. `averagePrice`).
    pub output: String,

    /// Order on the computed value. `None` leaves engine order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortDirection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl GroupSpec {
    pub fn new(
        group_by: impl Into<String>,
        accumulator: Accumulator,
        output: impl Into<String>,
    ) -> Self {
        Self {
            group_by: group_by.into(),
            accumulator,
            output: output.into(),
            sort: None,
            limit: None,
        }
    }

    pub fn sorted(mut self, direction: SortDirection) -> Self {
        self.sort = Some(direction);
        self
    }

    pub fn limited(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn validate(&self) -> Result<()> {
        validate_field(&self.group_by)?;
        if let Some(field) = self.accumulator.field() {
            validate_field(field)?;
        }
        if self.output.is_empty() || self.output.starts_with('$') || self.output == ID_FIELD {
            return Err(ShelfError::query(format!("invalid output name '{}'", self.output)));
        }
        if self.limit == Some(0) {
            return Err(ShelfError::query("group limit must be at least 1"));
        }
        Ok(())
    }
}

/// Partitions documents into contiguous numeric ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub group_by: String,

    /// Strictly increasing; bucket `i` is `[boundaries[i], boundaries[i + 1])`.
    pub boundaries: Vec<f64>,

    /// Label of the overflow bucket.
    #[serde(default = "default_bucket_label")]
    pub default: String,
}

fn default_bucket_label() -> String {
    "Other".to_string()
}

impl BucketSpec {
    pub fn new(group_by: impl Into<String>, boundaries: Vec<f64>) -> Self {
        Self {
            group_by: group_by.into(),
            boundaries,
            default: default_bucket_label(),
        }
    }

    /// Returns the bucket index for a numeric value, or `None` for overflow.
    pub fn bucket_of(&self, value: f64) -> Option<usize> {
        self.boundaries
            .windows(2)
            .position(|w| value >= w[0] && value < w[1])
    }

    fn validate(&self) -> Result<()> {
        validate_field(&self.group_by)?;
        if self.boundaries.len() < 2 {
            return Err(ShelfError::query("bucket requires at least two boundaries"));
        }
        if self.boundaries.iter().any(|b| !b.is_finite()) {
            return Err(ShelfError::query("bucket boundaries must be finite numbers"));
        }
        if self.boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ShelfError::query(
                "bucket boundaries must be strictly increasing",
            ));
        }
        Ok(())
    }
}

/// One key of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl IndexKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub keys: Vec<IndexKey>,

    /// Explicit name; defaults to `field_dir` pairs joined by `_`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IndexSpec {
    /// Ascending index over `fields`, in order.
    pub fn ascending<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: fields.into_iter().map(IndexKey::asc).collect(),
            name: None,
        }
    }

    /// Returns the explicit name or the conventional generated one.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.keys
                .iter()
                .map(|k| format!("{}_{}", k.field, k.direction))
                .collect::<Vec<_>>()
                .join("_")
        })
    }

    fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(ShelfError::index("index requires at least one key"));
        }
        for key in &self.keys {
            validate_field(&key.field)?;
        }
        let name = self.name();
        if name == ID_INDEX_NAME || name.is_empty() || name.contains('"') {
            return Err(ShelfError::index(format!("invalid index name '{name}'")));
        }
        if name.len() > MAX_INDEX_NAME_LEN {
            return Err(ShelfError::index(format!(
                "index name '{name}' is longer than {MAX_INDEX_NAME_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// A find request: filter, projection, order and window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindQuery {
    pub filter: Filter,
    pub projection: Option<Projection>,
    pub sort: Option<SortSpec>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl From<&FilterSpec> for FindQuery {
    fn from(spec: &FilterSpec) -> Self {
        Self {
            filter: spec.filter.clone(),
            projection: spec.projection.clone(),
            ..Default::default()
        }
    }
}

impl From<&SortSpec> for FindQuery {
    fn from(spec: &SortSpec) -> Self {
        Self {
            sort: Some(spec.clone()),
            ..Default::default()
        }
    }
}

impl From<&PageSpec> for FindQuery {
    fn from(spec: &PageSpec) -> Self {
        Self {
            skip: spec.offset,
            limit: Some(spec.limit),
            ..Default::default()
        }
    }
}

/// Checks that a field path is made of identifier segments.
///
/// Paths are inlined into generated SQL, so only `[A-Za-z_][A-Za-z0-9_]*`
/// segments separated by `.` are accepted. `_id` is store-assigned and cannot
/// be queried.
pub fn validate_field(field: &str) -> Result<()> {
    if field == ID_FIELD {
        return Err(ShelfError::query(
            "queries on '_id' are not supported; use pagination for natural order",
        ));
    }
    let valid = !field.is_empty()
        && field.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(ShelfError::query(format!("unsupported field name '{field}'")))
    }
}
