//! In-memory document store.
//!
//! Evaluates every query natively over documents held in process memory. It
//! backs `--mock-db` runs and the runner tests, and mirrors the matching,
//! ordering and index-selection rules the SQL stores push down to their engines.

use super::{
    assemble_buckets, check_index_conflict, json_number, project, BucketRow, DatabaseBackend,
    Document, DocumentStore, ExecutionPlan, GroupRow, IndexInfo, IndexOutcome, ScanStage,
};
use crate::error::{Result, ShelfError};
use crate::query::{
    Accumulator, BucketSpec, CompareOp, Filter, FindQuery, GroupSpec, IndexSpec, SortDirection,
    ID_FIELD,
};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    next_id: i64,
    indexes: Vec<IndexInfo>,
}

/// A store that keeps collections in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`DocumentStore::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.ensure_open()?;
        self.collections
            .read()
            .map_err(|_| ShelfError::internal("memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.ensure_open()?;
        self.collections
            .write()
            .map_err(|_| ShelfError::internal("memory store lock poisoned"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ShelfError::connection("store is closed"));
        }
        Ok(())
    }

    /// Runs `f` over the documents of a collection matching `filter`.
    ///
    /// A missing collection behaves as an empty one.
    fn with_matching<T>(
        &self,
        collection: &str,
        filter: &Filter,
        f: impl FnOnce(Vec<&Document>) -> T,
    ) -> Result<T> {
        let collections = self.read()?;
        let matching: Vec<&Document> = collections
            .get(collection)
            .map(|c| c.docs.iter().filter(|d| matches(filter, d)).collect())
            .unwrap_or_default();
        Ok(f(matching))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Memory
    }

    async fn insert_many(&self, collection: &str, docs: &[Document]) -> Result<u64> {
        let mut collections = self.write()?;
        let target = collections.entry(collection.to_string()).or_default();
        for doc in docs {
            target.next_id += 1;
            target.docs.push(super::with_id(target.next_id, doc.clone()));
        }
        debug!("Inserted {} documents into {collection}", docs.len());
        Ok(docs.len() as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.with_matching(collection, filter, |docs| docs.len() as u64)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>> {
        self.with_matching(collection, &query.filter, |mut docs| {
            if let Some(sort) = &query.sort {
                docs.sort_by(|a, b| {
                    let ord = compare_values(get_field(a, &sort.field), get_field(b, &sort.field));
                    match sort.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    }
                });
            }

            let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
            let limit = query
                .limit
                .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
                .unwrap_or(usize::MAX);

            docs.into_iter()
                .skip(skip)
                .take(limit)
                .map(|doc| match &query.projection {
                    Some(projection) => project(doc, projection),
                    None => doc.clone(),
                })
                .collect()
        })
    }

    async fn group(&self, collection: &str, spec: &GroupSpec) -> Result<Vec<GroupRow>> {
        let mut rows = self.with_matching(collection, &Filter::All, |docs| {
            let mut order: Vec<(Value, Accumulated)> = Vec::new();
            let mut positions: HashMap<String, usize> = HashMap::new();

            for doc in docs {
                let key = get_field(doc, &spec.group_by).cloned().unwrap_or(Value::Null);
                let position = *positions.entry(key.to_string()).or_insert_with(|| {
                    order.push((key.clone(), Accumulated::default()));
                    order.len() - 1
                });
                order[position].1.add(doc, &spec.accumulator);
            }

            order
                .into_iter()
                .map(|(key, acc)| GroupRow {
                    key,
                    output: spec.output.clone(),
                    value: acc.finish(&spec.accumulator),
                })
                .collect::<Vec<_>>()
        })?;

        if let Some(direction) = spec.sort {
            rows.sort_by(|a, b| {
                let ord = compare_values(Some(&a.value), Some(&b.value));
                match direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = spec.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(rows)
    }

    async fn bucket(&self, collection: &str, spec: &BucketSpec) -> Result<Vec<BucketRow>> {
        self.with_matching(collection, &Filter::All, |docs| {
            let counts = docs.into_iter().map(|doc| {
                let index = get_field(doc, &spec.group_by)
                    .and_then(Value::as_f64)
                    .and_then(|v| spec.bucket_of(v))
                    .map(|i| i as i64)
                    .unwrap_or(-1);
                (index, 1)
            });
            assemble_buckets(spec, counts)
        })
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<IndexOutcome> {
        let mut collections = self.write()?;
        let target = collections.entry(collection.to_string()).or_default();
        let name = spec.name();

        let mut existing = vec![IndexInfo::id_index()];
        existing.extend(target.indexes.iter().cloned());
        if check_index_conflict(&existing, spec)? {
            return Ok(IndexOutcome {
                name,
                created: false,
            });
        }

        target.indexes.push(IndexInfo {
            name: name.clone(),
            keys: spec.keys.clone(),
        });
        Ok(IndexOutcome {
            name,
            created: true,
        })
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        let collections = self.read()?;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut indexes = vec![IndexInfo::id_index()];
        indexes.extend(target.indexes.iter().cloned());
        Ok(indexes)
    }

    async fn explain(&self, collection: &str, filter: &Filter) -> Result<ExecutionPlan> {
        let start = Instant::now();
        let collections = self.read()?;
        let empty = Collection::default();
        let target = collections.get(collection).unwrap_or(&empty);

        let constraints = top_level_constraints(filter);
        let chosen = choose_index(&target.indexes, &constraints);

        let returned = target.docs.iter().filter(|d| matches(filter, d)).count() as u64;
        let (stage, index_name, examined, details) = match chosen {
            Some((index, prefix)) => {
                let prefix_fields: Vec<&str> =
                    index.keys[..prefix].iter().map(|k| k.field.as_str()).collect();
                let examined = target
                    .docs
                    .iter()
                    .filter(|doc| {
                        constraints
                            .iter()
                            .filter(|c| prefix_fields.contains(&constraint_field(c)))
                            .all(|c| matches(c, doc))
                    })
                    .count() as u64;
                let detail = format!("IXSCAN {} on {}", index.name, index.key_document());
                (
                    ScanStage::IndexScan,
                    Some(index.name.clone()),
                    examined,
                    vec![detail, "FETCH".to_string()],
                )
            }
            None => (
                ScanStage::CollectionScan,
                None,
                target.docs.len() as u64,
                vec![format!("COLLSCAN {collection}")],
            ),
        };

        Ok(ExecutionPlan {
            parsed_query: filter.to_document(),
            stage,
            index_name,
            docs_examined: Some(examined),
            docs_returned: returned,
            execution_time: start.elapsed(),
            details,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Accumulated {
    count: u64,
    numeric: u64,
    sum: f64,
}

impl Accumulated {
    fn add(&mut self, doc: &Document, accumulator: &Accumulator) {
        self.count += 1;
        if let Some(value) = accumulator
            .field()
            .and_then(|field| get_field(doc, field))
            .filter(|v| v.is_number())
            .and_then(Value::as_f64)
        {
            self.numeric += 1;
            self.sum += value;
        }
    }

    fn finish(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::Count => Value::from(self.count),
            Accumulator::Sum(_) => json_number(self.sum),
            Accumulator::Avg(_) if self.numeric == 0 => Value::Null,
            Accumulator::Avg(_) => json_number(self.sum / self.numeric as f64),
        }
    }
}

/// Field of a comparison; empty for compound filters.
fn constraint_field(filter: &Filter) -> &str {
    match filter {
        Filter::Compare { field, .. } => field,
        _ => "",
    }
}

/// Comparisons that apply to every matching document.
fn top_level_constraints(filter: &Filter) -> Vec<Filter> {
    match filter {
        Filter::Compare { op, .. } if *op != CompareOp::Ne => vec![filter.clone()],
        Filter::And(filters) => filters
            .iter()
            .flat_map(top_level_constraints)
            .collect(),
        _ => Vec::new(),
    }
}

/// Picks the index whose leading keys cover the most constrained fields.
fn choose_index<'a>(
    indexes: &'a [IndexInfo],
    constraints: &[Filter],
) -> Option<(&'a IndexInfo, usize)> {
    let mut best: Option<(&IndexInfo, usize)> = None;
    for index in indexes {
        let prefix = index
            .keys
            .iter()
            .take_while(|key| constraints.iter().any(|c| constraint_field(c) == key.field))
            .count();
        if prefix > 0 && best.map_or(true, |(_, p)| prefix > p) {
            best = Some((index, prefix));
        }
    }
    best
}

/// Looks up a dotted field path.
pub(crate) fn get_field<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Evaluates a filter against a document.
pub(crate) fn matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::All => true,
        Filter::And(filters) => filters.iter().all(|f| matches(f, doc)),
        Filter::Or(filters) => filters.iter().any(|f| matches(f, doc)),
        Filter::Compare { field, op, value } => {
            let actual = get_field(doc, field);
            match op {
                CompareOp::Eq => equals(actual, value),
                CompareOp::Ne => !equals(actual, value),
                _ => match actual.and_then(|a| compare_same_type(a, value)) {
                    Some(ord) => match op {
                        CompareOp::Gt => ord == Ordering::Greater,
                        CompareOp::Gte => ord != Ordering::Less,
                        CompareOp::Lt => ord == Ordering::Less,
                        CompareOp::Lte => ord != Ordering::Greater,
                        CompareOp::Eq | CompareOp::Ne => false,
                    },
                    None => false,
                },
            }
        }
    }
}

fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None | Some(Value::Null), Value::Null) => true,
        (Some(a), e) => compare_same_type(a, e) == Some(Ordering::Equal),
        (None, _) => false,
    }
}

/// Compares two values of the same JSON type; `None` across types.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Type rank for ordering mixed values; missing sorts with null.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order over optional values used for sorting.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_same_type(x, y)
            .unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => Ordering::Equal,
    }
}
