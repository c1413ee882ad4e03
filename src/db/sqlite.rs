//! SQLite document store.
//!
//! Provides the `SqliteStore` struct that implements the `DocumentStore` trait
//! over SQLite's JSON functions using sqlx. Documents are stored as JSON text.

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
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

const DIALECT: Dialect = Dialect::Sqlite;

/// SQLite document store.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Creates a store from an existing connection pool.
    ///
    /// This is primarily useful for testing.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database file (or `:memory:`) named by the config.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let path = config
            .database
            .as_deref()
            .ok_or_else(|| ShelfError::config("SQLite database path is required"))?;

        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ShelfError::config(format!("Invalid database path: {e}")))?
        } else {
            SqliteConnectOptions::new().filename(path)
        }
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

        // One long-lived connection: an in-memory database lives only as long
        // as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                ShelfError::connection(format!("Cannot open SQLite database '{path}': {e}"))
            })?;

        debug!("Opened SQLite database {path}");
        Ok(Self { pool })
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(&sql::table_exists(DIALECT))
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;
        Ok(exists != 0)
    }

    async fn catalog_entries(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        if !self.table_exists(sql::INDEX_CATALOG).await? {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String)> = sqlx::query_as(&sql::select_index_catalog(DIALECT))
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;
        rows.into_iter()
            .map(|(name, keys)| decode_index(name, &keys))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
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
            let body = serde_json::to_string(doc)
                .map_err(|e| ShelfError::internal(format!("Cannot encode document: {e}")))?;
            sqlx::query(&insert)
                .bind(body)
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
        let rendered = sql::count(DIALECT, collection, filter);
        let row = bind_all(sqlx::query(&rendered.sql), &rendered.params)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;
        let n: i64 = row
            .try_get(0)
            .map_err(|e| ShelfError::query(format_query_error(e)))?;
        Ok(n.max(0) as u64)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>> {
        if !self.table_exists(collection).await? {
            return Ok(Vec::new());
        }
        let rendered = sql::find(DIALECT, collection, query);
        let docs = self.fetch_documents(&rendered).await?;
        Ok(match &query.projection {
            Some(projection) => docs.iter().map(|d| project(d, projection)).collect(),
            None => docs,
        })
    }

    async fn group(&self, collection: &str, spec: &GroupSpec) -> Result<Vec<GroupRow>> {
        if !self.table_exists(collection).await? {
            return Ok(Vec::new());
        }
        let rendered = sql::group(DIALECT, collection, spec);
        let rows = bind_all(sqlx::query(&rendered.sql), &rendered.params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;

        rows.iter()
            .map(|row| {
                let key: Option<String> = row
                    .try_get("group_key")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                let value: Option<f64> = row
                    .try_get("group_value")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                let key = match key {
                    Some(text) => serde_json::from_str(&text).map_err(|e| {
                        ShelfError::query(format!("Cannot decode group key {text}: {e}"))
                    })?,
                    None => Value::Null,
                };
                Ok(GroupRow {
                    key,
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
        let rendered = sql::bucket(DIALECT, collection, spec);
        let rows = bind_all(sqlx::query(&rendered.sql), &rendered.params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let bucket: i64 = row
                .try_get("bucket")
                .map_err(|e| ShelfError::query(format_query_error(e)))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| ShelfError::query(format_query_error(e)))?;
            counts.push((bucket, n.max(0) as u64));
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
        let plan = sql::explain(DIALECT, &select);

        let rows: Vec<SqliteRow> = bind_all(sqlx::query(&plan.sql), &plan.params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;
        let details: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("detail").ok())
            .collect();

        let index_name = details
            .iter()
            .find_map(|detail| index_in_plan_detail(detail))
            .map(|physical| sql::logical_index_name(collection, &physical));

        let start = Instant::now();
        let returned = self.fetch_documents(&select).await?.len() as u64;
        let execution_time = start.elapsed();

        let (stage, docs_examined) = match index_name {
            Some(_) => (ScanStage::IndexScan, None),
            None => (
                ScanStage::CollectionScan,
                Some(self.count(collection, &Filter::All).await?),
            ),
        };

        Ok(ExecutionPlan {
            parsed_query: filter.to_document(),
            stage,
            index_name,
            docs_examined,
            docs_returned: returned,
            execution_time,
            details,
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

impl SqliteStore {
    async fn fetch_documents(&self, rendered: &SqlQuery) -> Result<Vec<Document>> {
        let rows = bind_all(sqlx::query(&rendered.sql), &rendered.params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ShelfError::query(format_query_error(e)))?;

        rows.iter()
            .map(|row| {
                let id: i64 = row
                    .try_get("id")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                let body: String = row
                    .try_get("doc")
                    .map_err(|e| ShelfError::query(format_query_error(e)))?;
                decode_document(id, &body)
            })
            .collect()
    }
}

fn decode_document(id: i64, body: &str) -> Result<Document> {
    match serde_json::from_str(body) {
        Ok(Value::Object(map)) => Ok(with_id(id, map)),
        Ok(other) => Err(ShelfError::query(format!("document {id} is not an object: {other}"))),
        Err(e) => Err(ShelfError::query(format!("Cannot decode document {id}: {e}"))),
    }
}

/// Binds rendered parameters by their native SQLite type.
fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Json(Value::Bool(b)) => query.bind(*b),
            SqlParam::Json(Value::Number(n)) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            SqlParam::Json(Value::String(s)) => query.bind(s.as_str()),
            SqlParam::Json(Value::Null) => query.bind(None::<String>),
            SqlParam::Json(other) => query.bind(other.to_string()),
            SqlParam::Float(f) => query.bind(*f),
        };
    }
    query
}

/// Decodes a catalog row.
fn decode_index(name: String, keys: &str) -> Result<IndexInfo> {
    let keys: Vec<IndexKey> = serde_json::from_str(keys)
        .map_err(|e| ShelfError::index(format!("Corrupt catalog entry for '{name}': {e}")))?;
    Ok(IndexInfo { name, keys })
}

/// Extracts the index name from an `EXPLAIN QUERY PLAN` detail line.
///
/// e.g. `SEARCH books USING INDEX books_title_1 (<expr>=?)`
fn index_in_plan_detail(detail: &str) -> Option<String> {
    ["USING COVERING INDEX ", "USING INDEX "]
        .iter()
        .find_map(|marker| detail.split_once(marker))
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(String::from)
}

/// Formats a sqlx error for display.
fn format_query_error(error: sqlx::Error) -> String {
    match error.as_database_error() {
        Some(db_error) => format!("ERROR: {}", db_error.message()),
        None => error.to_string(),
    }
}
