//! SQLite store integration tests.
//!
//! Runs the report queries through the SQL translation against in-memory and
//! file-backed SQLite databases.

use super::{documents, sample_books};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use shelfscan::config::ConnectionConfig;
use shelfscan::db::{
    self, Document, DocumentStore, MemoryStore, QueryOutput, ScanStage, SqliteStore,
};
use shelfscan::error::ShelfError;
use shelfscan::query::{
    collect_report, default_plan, execute, Accumulator, BucketSpec, CompareOp, Filter, FindQuery,
    GroupSpec, IndexKey, IndexSpec, PageSpec, QueryKind, QuerySpec, SortDirection, SortSpec,
    ID_FIELD,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashSet;
use tempfile::TempDir;

const BOOKS: &str = "books";

async fn memory_sqlite() -> Box<dyn DocumentStore> {
    let config = ConnectionConfig::from_connection_string("sqlite::memory:").unwrap();
    db::connect(&config).await.unwrap()
}

async fn seeded_sqlite() -> Box<dyn DocumentStore> {
    let store = memory_sqlite().await;
    store.insert_many(BOOKS, &sample_books()).await.unwrap();
    store
}

async fn find_all(store: &dyn DocumentStore) -> Vec<Document> {
    store.find(BOOKS, &FindQuery::default()).await.unwrap()
}

async fn run_documents(store: &dyn DocumentStore, kind: QueryKind) -> Vec<Document> {
    match execute(store, BOOKS, &QuerySpec::new("test", kind)).await.unwrap() {
        QueryOutput::Documents(docs) => docs,
        other => panic!("expected documents, got {other:?}"),
    }
}

#[tokio::test]
async fn test_filter_and_projection() {
    let store = seeded_sqlite().await;
    let plan = default_plan();

    let in_stock = run_documents(store.as_ref(), plan[0].kind.clone()).await;
    let titles: HashSet<_> = in_stock
        .iter()
        .map(|d| d["title"].as_str().unwrap().to_string())
        .collect();
    let expected: HashSet<_> = [
        "To Kill a Mockingbird",
        "The Lord of the Rings",
        "The Catcher in the Rye",
        "Dune",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(titles, expected);

    let projected = run_documents(store.as_ref(), plan[1].kind.clone()).await;
    assert_eq!(projected.len(), 9);
    for doc in &projected {
        let keys: Vec<_> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["title", "author", "price"]);
    }

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_sort_and_pages() {
    let store = seeded_sqlite().await;

    let asc = run_documents(
        store.as_ref(),
        QueryKind::Sort(SortSpec::new("price", SortDirection::Asc)),
    )
    .await;
    let prices: Vec<f64> = asc.iter().map(|d| d["price"].as_f64().unwrap()).collect();
    assert!(prices.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(asc[0]["title"], json!("Frankenstein"));

    let first = run_documents(store.as_ref(), QueryKind::Page(PageSpec::new(0, 5))).await;
    let second = run_documents(store.as_ref(), QueryKind::Page(PageSpec::new(5, 5))).await;
    let mut combined = first;
    combined.extend(second);
    let natural: Vec<Document> = find_all(store.as_ref()).await.into_iter().take(10).collect();
    assert_eq!(combined, natural);

    let ids: Vec<i64> = combined.iter().map(|d| d[ID_FIELD].as_i64().unwrap()).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    let past_end = run_documents(store.as_ref(), QueryKind::Page(PageSpec::new(50, 5))).await;
    assert!(past_end.is_empty());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_group_and_bucket_totals() {
    let store = seeded_sqlite().await;
    let total = find_all(store.as_ref()).await.len();

    let rows = store
        .group(BOOKS, &GroupSpec::new("genre", Accumulator::Count, "n"))
        .await
        .unwrap();
    let counted: u64 = rows.iter().map(|r| r.value.as_u64().unwrap()).sum();
    assert_eq!(counted as usize, total);

    let fantasy = store
        .group(
            BOOKS,
            &GroupSpec::new("genre", Accumulator::Avg("price".to_string()), "averagePrice"),
        )
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.key == json!("Fantasy"))
        .unwrap();
    let mean = (11.99 + 24.99 + 18.99) / 3.0;
    assert!((fantasy.value_f64().unwrap() - mean).abs() < 1e-9);

    let decades: Vec<f64> = (1800..=2010).step_by(10).map(f64::from).collect();
    let buckets = store
        .bucket(BOOKS, &BucketSpec::new("published_year", decades))
        .await
        .unwrap();
    let bucketed: u64 = buckets.iter().map(|b| b.count).sum();
    assert_eq!(bucketed as usize, total);
    assert_eq!(buckets[0].id.to_string(), "[1810, 1820)");
    assert_eq!(buckets[0].count, 2);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_end_to_end_small_dataset() {
    let store = memory_sqlite().await;
    store
        .insert_many(
            BOOKS,
            &documents(&[
                json!({ "title": "Dune", "published_year": 1965, "in_stock": true }),
                json!({ "title": "1984", "published_year": 1949, "in_stock": true }),
                json!({ "title": "Hobbit", "published_year": 1937, "in_stock": false }),
            ]),
        )
        .await
        .unwrap();

    let docs = run_documents(store.as_ref(), default_plan()[0].kind.clone()).await;
    let titles: Vec<&Value> = docs.iter().map(|d| &d["title"]).collect();
    assert_eq!(titles, vec![&json!("Dune")]);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_default_plan_uses_created_indexes() {
    let store = seeded_sqlite().await;
    let report = collect_report(store.as_ref(), BOOKS, &default_plan())
        .await
        .unwrap();
    assert_eq!(report.len(), 14);

    let QueryOutput::Indexes(indexes) = &report[11].output else {
        panic!("expected index list");
    };
    let names: Vec<_> = indexes.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["_id_", "title_1", "author_1_published_year_1"]);

    let QueryOutput::Plan(plan) = &report[12].output else {
        panic!("expected plan");
    };
    assert_eq!(plan.stage, ScanStage::IndexScan);
    assert_eq!(plan.index_name.as_deref(), Some("title_1"));
    assert_eq!(plan.docs_returned, 1);

    let QueryOutput::Plan(plan) = &report[13].output else {
        panic!("expected plan");
    };
    assert_eq!(plan.stage, ScanStage::IndexScan);
    assert_eq!(plan.docs_returned, 3);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_index_conflict_is_an_index_error() {
    let store = seeded_sqlite().await;
    store
        .create_index(BOOKS, &IndexSpec::ascending(["title"]))
        .await
        .unwrap();

    let conflicting = IndexSpec {
        keys: vec![IndexKey::asc("genre")],
        name: Some("title_1".to_string()),
    };
    let err = store.create_index(BOOKS, &conflicting).await.unwrap_err();
    assert!(matches!(err, ShelfError::Index(_)));

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_file_database_keeps_documents_and_indexes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("books.db");
    let url = format!("sqlite://{}", path.display());
    let config = ConnectionConfig::from_connection_string(&url).unwrap();

    let store = db::connect(&config).await.unwrap();
    store.insert_many(BOOKS, &sample_books()).await.unwrap();
    let created = store
        .create_index(BOOKS, &IndexSpec::ascending(["author", "published_year"]))
        .await
        .unwrap();
    assert!(created.created);
    store.close().await.unwrap();

    let reopened = db::connect(&config).await.unwrap();
    assert_eq!(
        reopened
            .count(BOOKS, &Filter::All)
            .await
            .unwrap(),
        13
    );
    let again = reopened
        .create_index(BOOKS, &IndexSpec::ascending(["author", "published_year"]))
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(reopened.list_indexes(BOOKS).await.unwrap().len(), 2);
    reopened.close().await.unwrap();
}

async fn titles_matching(store: &dyn DocumentStore, filter: &Filter) -> Vec<String> {
    let query = FindQuery {
        filter: filter.clone(),
        ..Default::default()
    };
    store
        .find(BOOKS, &query)
        .await
        .unwrap()
        .iter()
        .map(|d| d["title"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_null_and_missing_fields_match_like_memory() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let sqlite = SqliteStore::from_pool(pool);
    let memory = MemoryStore::new();

    let docs = documents(&[
        json!({ "title": "A", "genre": "Fantasy" }),
        json!({ "title": "B" }),
        json!({ "title": "C", "genre": null }),
        json!({ "title": "D", "genre": "Sci-Fi" }),
    ]);
    sqlite.insert_many(BOOKS, &docs).await.unwrap();
    memory.insert_many(BOOKS, &docs).await.unwrap();

    let cases = [
        (
            Filter::compare("genre", CompareOp::Ne, "Fantasy"),
            vec!["B", "C", "D"],
        ),
        (
            Filter::compare("genre", CompareOp::Ne, Value::Null),
            vec!["A", "D"],
        ),
        (Filter::eq("genre", Value::Null), vec!["B", "C"]),
        (
            Filter::Or(vec![
                Filter::eq("genre", "Sci-Fi"),
                Filter::eq("genre", "Fantasy"),
            ]),
            vec!["A", "D"],
        ),
    ];

    for (filter, expected) in cases {
        let from_sqlite = titles_matching(&sqlite, &filter).await;
        let from_memory = titles_matching(&memory, &filter).await;
        assert_eq!(from_sqlite, expected, "sqlite: {}", filter.to_document());
        assert_eq!(from_memory, expected, "memory: {}", filter.to_document());
    }

    sqlite.close().await.unwrap();
}

#[tokio::test]
async fn test_truncated_index_name_is_rejected() {
    let store = memory_sqlite().await;
    let collection = "books_from_the_second_hand_shop_on_main";
    store.insert_many(collection, &sample_books()).await.unwrap();

    let spec = IndexSpec::ascending(["author", "published_year"]);
    let err = store.create_index(collection, &spec).await.unwrap_err();
    assert!(matches!(err, ShelfError::Index(_)));
    assert_eq!(store.list_indexes(collection).await.unwrap().len(), 1);

    store.close().await.unwrap();
}
