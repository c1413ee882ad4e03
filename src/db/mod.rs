//! Document store abstraction for shelfscan.
//!
//! Provides a trait-based interface over the engines a report can run
//! against, allowing stores to be used interchangeably by the runner.

mod memory;
mod postgres;
pub mod sql;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use types::{
    assemble_buckets, json_number, project, with_id, BucketId, BucketRow, Document, ExecutionPlan,
    GroupRow, IndexInfo, IndexOutcome, QueryOutput, ScanStage,
};

use crate::config::ConnectionConfig;
use crate::error::{Result, ShelfError};
use crate::query::{BucketSpec, Filter, FindQuery, GroupSpec, IndexSpec};
use async_trait::async_trait;
use tracing::info;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    Sqlite,
    Memory,
}

impl DatabaseBackend {
    /// Returns the backend as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }

    /// Parses a backend from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Returns the default port for this backend.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Sqlite | Self::Memory => 0,
        }
    }
}

/// Opens a store for the given configuration.
///
/// This is the central factory function for connections. The returned store
/// holds its connection until [`DocumentStore::close`] is called.
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn DocumentStore>> {
    info!("Connecting to {}", config.display_string());
    match config.backend {
        DatabaseBackend::Postgres => Ok(Box::new(PostgresStore::connect(config).await?)),
        DatabaseBackend::Sqlite => Ok(Box::new(SqliteStore::connect(config).await?)),
        DatabaseBackend::Memory => Ok(Box::new(MemoryStore::new())),
    }
}

/// Trait defining the interface for document stores.
///
/// All operations are async and return Results with ShelfError. Stores read
/// documents; the only writes are [`insert_many`](Self::insert_many) for
/// seeding and index creation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend of this store.
    fn backend(&self) -> DatabaseBackend;

    /// Inserts documents, creating the collection if needed. Returns the count inserted.
    async fn insert_many(&self, collection: &str, docs: &[Document]) -> Result<u64>;

    /// Counts documents matching a filter.
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Returns documents matching a find request.
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>>;

    /// Groups documents and computes one value per group.
    async fn group(&self, collection: &str, spec: &GroupSpec) -> Result<Vec<GroupRow>>;

    /// Counts documents per numeric range.
    async fn bucket(&self, collection: &str, spec: &BucketSpec) -> Result<Vec<BucketRow>>;

    /// Creates an index unless an identical one exists.
    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<IndexOutcome>;

    /// Lists index definitions, the implicit `_id_` index first.
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>>;

    /// Executes a filter and reports how the engine satisfied it.
    async fn explain(&self, collection: &str, filter: &Filter) -> Result<ExecutionPlan>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// Checks a requested index against existing definitions.
///
/// Returns `Ok(true)` when an identical index already exists, `Ok(false)` when
/// the index is new, and an index error when the name or the keys are taken by
/// a different definition.
pub fn check_index_conflict(existing: &[IndexInfo], spec: &IndexSpec) -> Result<bool> {
    let name = spec.name();
    for index in existing {
        let same_name = index.name == name;
        let same_keys = index.keys == spec.keys;
        match (same_name, same_keys) {
            (true, true) => return Ok(true),
            (true, false) => {
                return Err(ShelfError::index(format!(
                    "index '{name}' already exists with different keys {}",
                    index.key_document()
                )))
            }
            (false, true) => {
                return Err(ShelfError::index(format!(
                    "index with the same keys already exists as '{}'",
                    index.name
                )))
            }
            (false, false) => {}
        }
    }
    Ok(false)
}
