//! Postgres store integration tests.
//!
//! Require a running server: set DATABASE_URL to run them.

use super::sample_books;
use shelfscan::config::ConnectionConfig;
use shelfscan::db::{sql, DatabaseBackend, DocumentStore, PostgresStore, QueryOutput, ScanStage};
use shelfscan::error::ShelfError;
use shelfscan::query::{collect_report, default_plan, Filter};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{SystemTime, UNIX_EPOCH};

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Helper to open a pool and a store sharing it.
async fn get_test_store() -> Option<(PgPool, PostgresStore)> {
    let url = get_test_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .ok()?;
    Some((pool.clone(), PostgresStore::from_pool(pool)))
}

fn unique_collection(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("{prefix}_{}_{nanos}", std::process::id())
}

async fn drop_collection(pool: &PgPool, collection: &str) {
    let drop_table = format!("DROP TABLE IF EXISTS {}", sql::quote_ident(collection));
    let _ = sqlx::query(&drop_table).execute(pool).await;
    let delete = format!("DELETE FROM {} WHERE collection = $1", sql::INDEX_CATALOG);
    let _ = sqlx::query(&delete)
        .bind(collection)
        .execute(pool)
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_connect_refused_is_a_connection_error() {
    let config = ConnectionConfig {
        backend: DatabaseBackend::Postgres,
        host: Some("127.0.0.1".to_string()),
        port: Some(1),
        database: Some("library".to_string()),
        user: Some("reader".to_string()),
        ..Default::default()
    };

    let err = PostgresStore::connect(&config).await.unwrap_err();
    assert!(
        matches!(err, ShelfError::Connection(_)),
        "Expected connection error, got: {err}"
    );
}

#[tokio::test]
async fn test_default_plan_report() {
    let Some((pool, store)) = get_test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let collection = unique_collection("books_report");

    store
        .insert_many(&collection, &sample_books())
        .await
        .unwrap();
    let report = collect_report(&store, &collection, &default_plan()).await;
    drop_collection(&pool, &collection).await;
    let report = report.unwrap();

    assert_eq!(report.len(), 14);
    assert_eq!(report[0].output.len(), 4);

    let QueryOutput::Groups(authors) = &report[7].output else {
        panic!("expected groups");
    };
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].key, serde_json::json!("J.R.R. Tolkien"));
    assert_eq!(authors[0].value.as_u64(), Some(3));

    let QueryOutput::Indexes(indexes) = &report[11].output else {
        panic!("expected index list");
    };
    let names: Vec<_> = indexes.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["_id_", "title_1", "author_1_published_year_1"]);

    let QueryOutput::Plan(plan) = &report[12].output else {
        panic!("expected plan");
    };
    assert_eq!(plan.docs_returned, 1);
    // Tiny tables may still be sequentially scanned.
    if plan.stage == ScanStage::IndexScan {
        assert!(plan.index_name.is_some());
    }

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_collection_is_empty() {
    let Some((_pool, store)) = get_test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let collection = unique_collection("books_missing");

    assert_eq!(store.count(&collection, &Filter::All).await.unwrap(), 0);
    let plan = store.explain(&collection, &Filter::All).await.unwrap();
    assert_eq!(plan.stage, ScanStage::CollectionScan);
    assert_eq!(plan.docs_returned, 0);

    store.close().await.unwrap();
}
