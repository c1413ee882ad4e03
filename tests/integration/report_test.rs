//! End-to-end report tests.
//!
//! Resolves settings the way the binary does, then runs the report against
//! the in-memory store and SQLite.

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use shelfscan::app::{run_report, ReportSettings};
use shelfscan::cli::Cli;
use shelfscan::config::ConnectionConfig;
use shelfscan::db::{self, DatabaseBackend, MemoryStore};
use shelfscan::error::ShelfError;
use shelfscan::report::OutputFormat;
use std::fs;
use tempfile::TempDir;

const PLAN: &str = r#"
[[query]]
label = "Cheap classics"
kind = "filter"
filter = { "$and" = [ { price = { "$lt" = 10 } }, { published_year = { "$lt" = 1900 } } ] }
projection = { fields = ["title"], include_id = false }

[[query]]
label = "Books per author"
kind = "group"
group_by = "author"
accumulator = "count"
output = "books"
sort = "desc"
limit = 2

[[query]]
label = "Index on genre"
kind = "create_index"
keys = [{ field = "genre" }]
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plan.toml"), PLAN).unwrap();
        fs::write(
            dir.path().join("books.json"),
            include_str!("../../data/books.json"),
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn settings(&self, extra: &[&str]) -> ReportSettings {
        let config = self.path("missing-config.toml");
        let seed = self.path("books.json");
        let plan = self.path("plan.toml");
        let mut args = vec![
            "shelfscan",
            "--config",
            config.as_str(),
            "--collection",
            "books",
            "--seed",
            seed.as_str(),
            "--plan",
            plan.as_str(),
        ];
        args.extend_from_slice(extra);
        ReportSettings::from_cli(&Cli::parse_from(args)).unwrap()
    }
}

fn json_lines(out: Vec<u8>) -> Vec<Value> {
    String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_settings_from_cli() {
    let fixture = Fixture::new();
    let settings = fixture.settings(&["--mock-db", "--output", "json"]);

    assert_eq!(settings.connection.backend, DatabaseBackend::Memory);
    assert_eq!(settings.collection, "books");
    assert_eq!(settings.plan.len(), 3);
    assert_eq!(settings.seed.as_ref().map(Vec::len), Some(13));
    assert_eq!(settings.format, OutputFormat::Json);
}

#[test]
fn test_invalid_output_format_is_a_config_error() {
    let fixture = Fixture::new();
    let config = fixture.path("missing-config.toml");
    let cli = Cli::parse_from(["shelfscan", "--mock-db", "--config", &config, "--output", "xml"]);
    let err = ReportSettings::from_cli(&cli).unwrap_err();
    assert!(matches!(err, ShelfError::Config(_)));
}

#[test]
fn test_named_connection_from_config_file() {
    let fixture = Fixture::new();
    let config = fixture.path("config.toml");
    fs::write(
        &config,
        r#"
collection = "library"

[connections.local]
backend = "sqlite"
database = ":memory:"
"#,
    )
    .unwrap();

    let cli = Cli::parse_from(["shelfscan", "--config", &config, "-c", "local"]);
    let settings = ReportSettings::from_cli(&cli).unwrap();
    assert_eq!(settings.connection.backend, DatabaseBackend::Sqlite);
    assert_eq!(settings.connection.database.as_deref(), Some(":memory:"));
    assert_eq!(settings.collection, "library");
    assert_eq!(settings.plan.len(), 14);
}

#[tokio::test]
async fn test_plan_file_report_as_json() {
    let fixture = Fixture::new();
    let settings = fixture.settings(&["--mock-db", "--output", "json"]);
    let store = MemoryStore::new();

    let mut out = Vec::new();
    run_report(&store, &settings, &mut out).await.unwrap();
    let blocks = json_lines(out);

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0]["label"], json!("Cheap classics"));
    assert_eq!(
        blocks[0]["result"],
        json!({
            "type": "documents",
            "data": [{ "title": "Pride and Prejudice" }, { "title": "Frankenstein" }]
        })
    );
    assert_eq!(
        blocks[1]["result"],
        json!({
            "type": "groups",
            "data": [
                { "_id": "J.R.R. Tolkien", "books": 3 },
                { "_id": "George Orwell", "books": 2 }
            ]
        })
    );
    assert_eq!(
        blocks[2]["result"],
        json!({ "type": "index_created", "data": { "name": "genre_1", "created": true } })
    );
}

#[tokio::test]
async fn test_same_report_on_sqlite_and_memory() {
    let fixture = Fixture::new();
    let settings = fixture.settings(&["--output", "json", "sqlite::memory:"]);
    assert_eq!(settings.connection.backend, DatabaseBackend::Sqlite);

    let sqlite = db::connect(&settings.connection).await.unwrap();
    let mut sqlite_out = Vec::new();
    run_report(sqlite.as_ref(), &settings, &mut sqlite_out)
        .await
        .unwrap();
    sqlite.close().await.unwrap();

    let memory = db::connect(&ConnectionConfig::memory()).await.unwrap();
    let mut memory_out = Vec::new();
    run_report(memory.as_ref(), &settings, &mut memory_out)
        .await
        .unwrap();
    memory.close().await.unwrap();

    assert_eq!(json_lines(sqlite_out), json_lines(memory_out));
}

#[tokio::test]
async fn test_text_report_for_default_plan() {
    let fixture = Fixture::new();
    let config = fixture.path("missing-config.toml");
    let seed = fixture.path("books.json");
    let cli = Cli::parse_from(["shelfscan", "--mock-db", "--config", &config, "--seed", &seed]);
    let settings = ReportSettings::from_cli(&cli).unwrap();

    let store = MemoryStore::new();
    let mut out = Vec::new();
    run_report(&store, &settings, &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.starts_with("=== Books in stock and published after 1950 ===\n"));
    assert!(text.contains("=== Second page (5 books) ===\n"));
    assert!(text.contains("created index author_1_published_year_1"));
    assert!(text.contains("_id_  {\"_id\":1}\ntitle_1  {\"title\":1}"));
    assert!(text.contains("stage:    IXSCAN (author_1_published_year_1)"));
}
