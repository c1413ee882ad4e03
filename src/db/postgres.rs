//! PostgreSQL document store.
//!
//! Provides the `PostgresStore` struct that implements the `DocumentStore`
//! trait for PostgreSQL using sqlx. Documents are stored as `jsonb`.

use super::sql::{self, Dialect, SqlParam, SqlQuery};
use super::{
    assemble_buckets, check_index_conflict, json_number, project, with_id, BucketRow,
    DatabaseBackend, Document, DocumentStore, ExecutionPlan, GroupRow, IndexInfo, IndexOutcome,
    ScanStage,
};
use crate::config::ConnectionConfig;
use crate::error::{Result, ShelfError};
use crate::query::{BucketSpec, Filter, FindQuery, GroupSpec, IndexKey, IndexSpec};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::Row;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Query timeout in seconds.
const QUERY_TIMEOUT_SECS: u64 = 30;

const DIALECT: Dialect = Dialect::Postgres;

/// Plan nodes that read rows of a relation.
const SCAN_NODES: [&str; 4] = [
    "Seq Scan",
    "Index Scan",
    "Index Only Scan",
    "Bitmap Heap Scan",
];

/// PostgreSQL document store.
#[derive(Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgresStore from an existing connection pool.
    ///
    /// This is primarily useful for testing.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the server named by the config. A failed attempt is not retried.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&conn_str)
            .await
            .map_err(|e| map_connection_error(e, config))?;

        debug!("Successfully connected to database");
        Ok(Self { pool })
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = sql::table_exists(DIALECT);
        timed(sqlx::query_scalar(&sql).bind(table).fetch_one(&self.pool)).await
    }

    async fn fetch_all(&self, rendered: &SqlQuery) -> Result<Vec<PgRow>> {
        timed(bind_all(sqlx::query(&rendered.sql), &rendered.params).fetch_all(&self.pool)).await
    }

    async fn fetch_documents(&self, rendered: &SqlQuery) -> Result<Vec<Document>> {
        self.fetch_all(rendered)
            .await?
            .iter()
            .map(|row| {
                let id: i64 = row
                    .try_get("id")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                let body: Value = row
                    .try_get("doc")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                match body {
                    Value::Object(map) => Ok(with_id(id, map)),
                    other => Err(ShelfError::query(format!(
                        "document {id} is not an object: {other}"
                    ))),
                }
            })
            .collect()
    }

    async fn catalog_entries(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        if !self.table_exists(sql::INDEX_CATALOG).await? {
            return Ok(Vec::new());
        }
        let sql = sql::select_index_catalog(DIALECT);
        let rows: Vec<(String, String)> =
            timed(sqlx::query_as(&sql).bind(collection).fetch_all(&self.pool)).await?;
        rows.into_iter()
            .map(|(name, keys)| {
                let keys: Vec<IndexKey> = serde_json::from_str(&keys).map_err(|e| {
                    ShelfError::index(format!("Corrupt catalog entry for '{name}': {e}"))
                })?;
                Ok(IndexInfo { name, keys })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    async fn insert_many(&self, collection: &str, docs: &[Document]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;

        sqlx::query(&sql::create_collection(DIALECT, collection))
            .execute(&mut *tx)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;

        let insert = sql::insert_document(DIALECT, collection);
        for doc in docs {
            sqlx::query(&insert)
                .bind(Json(doc))
                .execute(&mut *tx)
                .await
                .map_err(|e| ShelfError::query(format_query_error(e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;
        Ok(docs.len() as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        if !self.table_exists(collection).await? {
            return Ok(0);
        }
        let query = sql::count(DIALECT, collection, filter);
        let rows = self.fetch_all(&query).await?;
        let n: i64 = match rows.first() {
            Some(row) => row
                .try_get(0)
                .map_err(|e| ShelfError::query(format_query_error(e)))?,
            None => 0,
        };
        Ok(n.max(0) as u64)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>> {
        if !self.table_exists(collection).await? {
            return Ok(Vec::new());
        }
        let docs = self
            .fetch_documents(&sql::find(DIALECT, collection, query))
            .await?;
        Ok(match &query.projection {
            Some(projection) => docs.iter().map(|d| project(d, projection)).collect(),
            None => docs,
        })
    }

    async fn group(&self, collection: &str, spec: &GroupSpec) -> Result<Vec<GroupRow>> {
        if !self.table_exists(collection).await? {
            return Ok(Vec::new());
        }
        let query = sql::group(DIALECT, collection, spec);
        let rows = self.fetch_all(&query).await?;
        rows.iter()
            .map(|row| {
                let key: Option<Value> = row
                    .try_get("group_key")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                let value: Option<f64> = row
                    .try_get("group_value")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                Ok(GroupRow {
                    key: key.unwrap_or(Value::Null),
                    output: spec.output.clone(),
                    value: value.map(json_number).unwrap_or(Value::Null),
                })
            })
            .collect()
    }

    async fn bucket(&self, collection: &str, spec: &BucketSpec) -> Result<Vec<BucketRow>> {
        if !self.table_exists(collection).await? {
            return Ok(Vec::new());
        }
        let query = sql::bucket(DIALECT, collection, spec);
        let rows = self.fetch_all(&query).await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let bucket: i32 = row
                .try_get("bucket")
                .map_err(|e| ShelfError::query(format_query_error(e)))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| ShelfError::query(format_query_error(e)))?;
            counts.push((i64::from(bucket), n.max(0) as u64));
        }
        Ok(assemble_buckets(spec, counts))
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<IndexOutcome> {
        let name = spec.name();
        sql::check_index_name_length(collection, &name)?;
        let mut existing = vec![IndexInfo::id_index()];
        existing.extend(self.catalog_entries(collection).await?);
        if check_index_conflict(&existing, spec)? {
            debug!("Index {name} already exists on {collection}");
            return Ok(IndexOutcome {
                name,
                created: false,
            });
        }

        let keys = serde_json::to_string(&spec.keys)
            .map_err(|e| ShelfError::internal(format!("Cannot encode index keys: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ShelfError::index(format_query_error(e)))?;
        for ddl in [
            sql::create_collection(DIALECT, collection),
            sql::create_index_catalog(DIALECT),
            sql::create_index(DIALECT, collection, spec),
        ] {
            sqlx::query(&ddl)
                .execute(&mut *tx)
                .await
                .map_err(|e| ShelfError::index(format_query_error(e)))?;
        }
        sqlx::query(&sql::insert_index_catalog(DIALECT))
            .bind(collection)
            .bind(&name)
            .bind(keys)
            .execute(&mut *tx)
            .await
            .map_err(|e| ShelfError::index(format_query_error(e)))?;
        tx.commit()
            .await
            .map_err(|e| ShelfError::index(format_query_error(e)))?;

        Ok(IndexOutcome {
            name,
            created: true,
        })
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        if !self.table_exists(collection).await? {
            return Ok(Vec::new());
        }
        let mut indexes = vec![IndexInfo::id_index()];
        indexes.extend(self.catalog_entries(collection).await?);
        Ok(indexes)
    }

    async fn explain(&self, collection: &str, filter: &Filter) -> Result<ExecutionPlan> {
        if !self.table_exists(collection).await? {
            return Ok(ExecutionPlan {
                parsed_query: filter.to_document(),
                stage: ScanStage::CollectionScan,
                index_name: None,
                docs_examined: Some(0),
                docs_returned: 0,
                execution_time: Duration::ZERO,
                details: Vec::new(),
            });
        }

        let select = sql::select_matching(DIALECT, collection, filter);
        let start = Instant::now();
        let rows = self.fetch_all(&sql::explain(DIALECT, &select)).await?;
        let elapsed = start.elapsed();

        let plan: Value = match rows.first() {
            Some(row) => row
                .try_get(0)
                .map_err(|e| ShelfError::query(format_query_error(e)))?,
            None => return Err(ShelfError::query("EXPLAIN returned no plan")),
        };

        let mut summary = summarize_plan(&plan, collection)?;
        summary.parsed_query = filter.to_document();
        if summary.execution_time.is_zero() {
            summary.execution_time = elapsed;
        }
        Ok(summary)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Runs a query future under the query timeout.
async fn timed<T, F>(future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    tokio::time::timeout(Duration::from_secs(QUERY_TIMEOUT_SECS), future)
        .await
        .map_err(|_| {
            ShelfError::query(format!("Query timed out after {QUERY_TIMEOUT_SECS} seconds"))
        })?
        .map_err(|e| ShelfError::query(format_query_error(e)))
}

/// Binds rendered parameters; JSON operands are bound as `jsonb`.
fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Json(value) => query.bind(Json(value)),
            SqlParam::Float(f) => query.bind(*f),
        };
    }
    query
}

/// Reduces an `EXPLAIN (ANALYZE, FORMAT JSON)` document to an execution plan.
///
/// `parsed_query` is left empty for the caller to fill in.
fn summarize_plan(plan: &Value, collection: &str) -> Result<ExecutionPlan> {
    let root = plan
        .get(0)
        .ok_or_else(|| ShelfError::query("EXPLAIN output is not a plan list"))?;
    let top = root
        .get("Plan")
        .ok_or_else(|| ShelfError::query("EXPLAIN output has no Plan node"))?;

    let mut nodes = Vec::new();
    walk_plan(top, 0, &mut nodes);

    let mut examined = 0u64;
    let mut index_name = None;
    let mut details = Vec::with_capacity(nodes.len());

    for (depth, node) in &nodes {
        let node_type = node.get("Node Type").and_then(Value::as_str).unwrap_or("?");
        let relation = node.get("Relation Name").and_then(Value::as_str);
        let index = node.get("Index Name").and_then(Value::as_str);

        let mut line = format!("{}{node_type}", "  ".repeat(*depth));
        if let Some(index) = index {
            line.push_str(&format!(" using {index}"));
            if index_name.is_none() {
                index_name = Some(sql::logical_index_name(collection, index));
            }
        }
        if let Some(relation) = relation {
            line.push_str(&format!(" on {relation}"));
        }
        details.push(line);

        if relation == Some(collection) && SCAN_NODES.contains(&node_type) {
            let counter = |key: &str| node.get(key).and_then(Value::as_u64).unwrap_or(0);
            let loops = counter("Actual Loops").max(1);
            examined += (counter("Actual Rows")
                + counter("Rows Removed by Filter")
                + counter("Rows Removed by Index Recheck"))
                * loops;
        }
    }

    let returned = top.get("Actual Rows").and_then(Value::as_u64).unwrap_or(0);
    let execution_ms = root
        .get("Execution Time")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    Ok(ExecutionPlan {
        parsed_query: Value::Null,
        stage: if index_name.is_some() {
            ScanStage::IndexScan
        } else {
            ScanStage::CollectionScan
        },
        index_name,
        docs_examined: Some(examined),
        docs_returned: returned,
        execution_time: Duration::from_secs_f64(execution_ms.max(0.0) / 1000.0),
        details,
    })
}

fn walk_plan<'a>(node: &'a Value, depth: usize, out: &mut Vec<(usize, &'a Value)>) {
    out.push((depth, node));
    if let Some(children) = node.get("Plans").and_then(Value::as_array) {
        for child in children {
            walk_plan(child, depth + 1, out);
        }
    }
}

/// Maps sqlx connection errors to user-friendly ShelfError messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> ShelfError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.effective_port();
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        ShelfError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ShelfError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        ShelfError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ShelfError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        ShelfError::connection(error.to_string())
    }
}

/// Formats a sqlx error with the server's detail and hint when present.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = format!("ERROR: {}", db_error.message());
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Accumulator, Projection, SortDirection, SortSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Note: these tests require a running PostgreSQL database and are
    // skipped unless DATABASE_URL is set.

    static NEXT_COLLECTION: AtomicUsize = AtomicUsize::new(0);

    fn get_test_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    async fn get_test_store() -> Option<PostgresStore> {
        let url = get_test_database_url()?;
        let config = ConnectionConfig::from_connection_string(&url).ok()?;
        PostgresStore::connect(&config).await.ok()
    }

    fn unique_collection() -> String {
        format!(
            "shelfscan_test_{}_{}",
            std::process::id(),
            NEXT_COLLECTION.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn seed(store: &PostgresStore, collection: &str) {
        let docs: Vec<Document> = [
            json!({
                "title": "Dune",
                "published_year": 1965,
                "in_stock": true,
                "genre": "Sci-Fi",
                "price": 15.0
            }),
            json!({
                "title": "1984",
                "published_year": 1949,
                "in_stock": true,
                "genre": "Dystopian",
                "price": 10.0
            }),
            json!({
                "title": "Hobbit",
                "published_year": 1937,
                "in_stock": false,
                "genre": "Fantasy",
                "price": 12.0
            }),
        ]
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();
        store.insert_many(collection, &docs).await.unwrap();
    }

    async fn drop_collection(store: &PostgresStore, collection: &str) {
        let drop_table = format!("DROP TABLE IF EXISTS {}", sql::quote_ident(collection));
        let _ = sqlx::query(&drop_table).execute(&store.pool).await;
        let delete = format!("DELETE FROM {} WHERE collection = $1", sql::INDEX_CATALOG);
        let _ = sqlx::query(&delete)
            .bind(collection)
            .execute(&store.pool)
            .await;
    }

    #[test]
    fn test_summarize_seq_scan_plan() {
        let plan = json!([{
            "Plan": {
                "Node Type": "Seq Scan",
                "Relation Name": "books",
                "Actual Rows": 1,
                "Actual Loops": 1,
                "Rows Removed by Filter": 2
            },
            "Execution Time": 0.25
        }]);
        let summary = summarize_plan(&plan, "books").unwrap();
        assert_eq!(summary.stage, ScanStage::CollectionScan);
        assert_eq!(summary.docs_examined, Some(3));
        assert_eq!(summary.docs_returned, 1);
        assert_eq!(summary.details, vec!["Seq Scan on books".to_string()]);
    }

    #[test]
    fn test_summarize_bitmap_index_plan() {
        let plan = json!([{
            "Plan": {
                "Node Type": "Bitmap Heap Scan",
                "Relation Name": "books",
                "Actual Rows": 2,
                "Actual Loops": 1,
                "Plans": [{
                    "Node Type": "Bitmap Index Scan",
                    "Index Name": "books_title_1",
                    "Actual Rows": 2,
                    "Actual Loops": 1
                }]
            },
            "Execution Time": 0.1
        }]);
        let summary = summarize_plan(&plan, "books").unwrap();
        assert_eq!(summary.stage, ScanStage::IndexScan);
        assert_eq!(summary.index_name.as_deref(), Some("title_1"));
        assert_eq!(summary.docs_examined, Some(2));
        assert_eq!(
            summary.details,
            vec![
                "Bitmap Heap Scan on books".to_string(),
                "  Bitmap Index Scan using books_title_1".to_string(),
            ]
        );
    }

    #[test]
    fn test_summarize_rejects_malformed_plan() {
        assert!(summarize_plan(&json!({}), "books").is_err());
    }

    #[tokio::test]
    async fn test_connect_to_database() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        // If we got here, connection succeeded
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_sort_and_group() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };
        let collection = unique_collection();
        seed(&store, &collection).await;

        let query = FindQuery {
            filter: Filter::and(vec![
                Filter::eq("in_stock", true),
                Filter::gt("published_year", 1950),
            ]),
            projection: Some(Projection::without_id(["title", "price"])),
            ..Default::default()
        };
        let docs = store.find(&collection, &query).await.unwrap();
        assert_eq!(
            docs.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({ "title": "Dune", "price": 15.0 })]
        );

        let by_price = FindQuery::from(&SortSpec::new("price", SortDirection::Asc));
        let sorted = store.find(&collection, &by_price).await.unwrap();
        assert_eq!(sorted[0]["title"], json!("1984"));

        let spec = GroupSpec::new("genre", Accumulator::Count, "bookCount");
        let rows = store.group(&collection, &spec).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.value == json!(1)));

        drop_collection(&store, &collection).await;
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_index_lifecycle() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };
        let collection = unique_collection();
        seed(&store, &collection).await;

        let outcome = store
            .create_index(&collection, &IndexSpec::ascending(["title"]))
            .await
            .unwrap();
        assert!(outcome.created);
        let again = store
            .create_index(&collection, &IndexSpec::ascending(["title"]))
            .await
            .unwrap();
        assert!(!again.created);

        let names: Vec<_> = store
            .list_indexes(&collection)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["_id_", "title_1"]);

        let plan = store
            .explain(&collection, &Filter::eq("title", "Dune"))
            .await
            .unwrap();
        assert_eq!(plan.docs_returned, 1);
        assert_eq!(plan.parsed_query, json!({ "title": { "$eq": "Dune" } }));

        drop_collection(&store, &collection).await;
        store.close().await.unwrap();
    }
}
