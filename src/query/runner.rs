//! Report execution.
//!
//! [`execute`] dispatches one [`QuerySpec`] to the store. [`run`] executes a
//! plan lazily, one spec per polled item, attaching each result (or error) to
//! the spec's label.

use super::spec::{FindQuery, QueryKind, QuerySpec};
use crate::db::{DocumentStore, QueryOutput};
use crate::error::Result;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

/// A query result paired with the label of the query that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledOutput {
    pub label: String,
    #[serde(rename = "result")]
    pub output: QueryOutput,
}

/// Executes a single query.
pub async fn execute(
    store: &dyn DocumentStore,
    collection: &str,
    spec: &QuerySpec,
) -> Result<QueryOutput> {
    spec.validate()?;

    let output = match &spec.kind {
        QueryKind::Filter(filter) => {
            QueryOutput::Documents(store.find(collection, &FindQuery::from(filter)).await?)
        }
        QueryKind::Sort(sort) => {
            QueryOutput::Documents(store.find(collection, &FindQuery::from(sort)).await?)
        }
        QueryKind::Page(page) => {
            QueryOutput::Documents(store.find(collection, &FindQuery::from(page)).await?)
        }
        QueryKind::Group(group) => QueryOutput::Groups(store.group(collection, group).await?),
        QueryKind::Bucket(bucket) => QueryOutput::Buckets(store.bucket(collection, bucket).await?),
        QueryKind::CreateIndex(index) => {
            QueryOutput::IndexCreated(store.create_index(collection, index).await?)
        }
        QueryKind::ListIndexes => QueryOutput::Indexes(store.list_indexes(collection).await?),
        QueryKind::Explain(filter) => {
            QueryOutput::Plan(store.explain(collection, &filter.filter).await?)
        }
    };
    Ok(output)
}

/// Executes `specs` in order as a lazy stream.
///
/// Each item runs when polled. A failed query yields its error wrapped with
/// the query label; consumers stop at the first error.
pub fn run<'a>(
    store: &'a dyn DocumentStore,
    collection: &'a str,
    specs: &'a [QuerySpec],
) -> impl Stream<Item = Result<LabeledOutput>> + 'a {
    stream::iter(specs).then(move |spec| async move {
        debug!("Running {} query '{}'", spec.kind.name(), spec.label);
        let start = Instant::now();

        let output = execute(store, collection, spec)
            .await
            .map_err(|e| e.labeled(&spec.label))?;

        info!(
            "'{}' returned {} item(s) in {:?}",
            spec.label,
            output.len(),
            start.elapsed()
        );
        Ok(LabeledOutput {
            label: spec.label.clone(),
            output,
        })
    })
}

/// Runs a whole plan, stopping at the first failure.
pub async fn collect_report(
    store: &dyn DocumentStore,
    collection: &str,
    specs: &[QuerySpec],
) -> Result<Vec<LabeledOutput>> {
    let mut results = std::pin::pin!(run(store, collection, specs));
    let mut report = Vec::with_capacity(specs.len());
    while let Some(item) = results.try_next().await? {
        report.push(item);
    }
    Ok(report)
}
