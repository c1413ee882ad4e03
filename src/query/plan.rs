//! Report plans.
//!
//! The built-in plan is the bookstore report; a TOML plan file can replace it.

use super::filter::Filter;
use super::spec::{
    Accumulator, BucketSpec, FilterSpec, GroupSpec, IndexSpec, PageSpec, Projection, QueryKind,
    QuerySpec, SortDirection, SortSpec,
};
use crate::error::{Result, ShelfError};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// First and last lower boundary of the decade buckets, inclusive.
const DECADES: (u16, u16) = (1800, 2010);

/// Shape of a plan file: a list of `[[query]]` tables.
#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default, rename = "query")]
    queries: Vec<QuerySpec>,
}

/// The bookstore report, in execution order.
pub fn default_plan() -> Vec<QuerySpec> {
    let decades = (DECADES.0..=DECADES.1)
        .step_by(10)
        .map(f64::from)
        .collect();

    vec![
        QuerySpec::new(
            "Books in stock and published after 1950",
            QueryKind::Filter(FilterSpec::new(Filter::and(vec![
                Filter::eq("in_stock", true),
                Filter::gt("published_year", 1950),
            ]))),
        ),
        QuerySpec::new(
            "In-stock books with title, author, and price",
            QueryKind::Filter(
                FilterSpec::new(Filter::eq("in_stock", true))
                    .with_projection(Projection::without_id(["title", "author", "price"])),
            ),
        ),
        QuerySpec::new(
            "Books sorted by price (ascending)",
            QueryKind::Sort(SortSpec::new("price", SortDirection::Asc)),
        ),
        QuerySpec::new(
            "Books sorted by price (descending)",
            QueryKind::Sort(SortSpec::new("price", SortDirection::Desc)),
        ),
        QuerySpec::new("First page (5 books)", QueryKind::Page(PageSpec::new(0, 5))),
        QuerySpec::new("Second page (5 books)", QueryKind::Page(PageSpec::new(5, 5))),
        QuerySpec::new(
            "Average price by genre",
            QueryKind::Group(
                GroupSpec::new("genre", Accumulator::Avg("price".to_string()), "averagePrice")
                    .sorted(SortDirection::Desc),
            ),
        ),
        QuerySpec::new(
            "Author with the most books",
            QueryKind::Group(
                GroupSpec::new("author", Accumulator::Count, "bookCount")
                    .sorted(SortDirection::Desc)
                    .limited(1),
            ),
        ),
        QuerySpec::new(
            "Books by publication decade",
            QueryKind::Bucket(BucketSpec::new("published_year", decades)),
        ),
        QuerySpec::new(
            "Creating index on title",
            QueryKind::CreateIndex(IndexSpec::ascending(["title"])),
        ),
        QuerySpec::new(
            "Creating compound index on author and published_year",
            QueryKind::CreateIndex(IndexSpec::ascending(["author", "published_year"])),
        ),
        QuerySpec::new("Indexes on books collection", QueryKind::ListIndexes),
        QuerySpec::new(
            "Explain: Query using title index",
            QueryKind::Explain(FilterSpec::new(Filter::eq("title", "The Hobbit"))),
        ),
        QuerySpec::new(
            "Explain: Query using compound index",
            QueryKind::Explain(FilterSpec::new(Filter::and(vec![
                Filter::eq("author", "J.R.R. Tolkien"),
                Filter::gt("published_year", 1930),
            ]))),
        ),
    ]
}

/// Parses a plan from TOML text.
pub fn parse_plan(content: &str) -> Result<Vec<QuerySpec>> {
    let file: PlanFile = toml::from_str(content)
        .map_err(|e| ShelfError::config(format!("Failed to parse plan: {e}")))?;

    if file.queries.is_empty() {
        return Err(ShelfError::config("plan contains no [[query]] entries"));
    }
    for spec in &file.queries {
        spec.validate().map_err(|e| e.labeled(&spec.label))?;
    }
    Ok(file.queries)
}

/// Loads a plan file.
pub fn load_plan(path: &Path) -> Result<Vec<QuerySpec>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ShelfError::config(format!("Failed to read plan {}: {e}", path.display()))
    })?;
    let plan = parse_plan(&content)?;
    debug!("Loaded {} queries from {}", plan.len(), path.display());
    Ok(plan)
}
