//! Report orchestration for shelfscan.
//!
//! Resolves the connection target, opens the store, optionally seeds it,
//! runs the plan and prints each block as it completes. The store is closed
//! whether or not the report succeeded.

use crate::books::load_seed;
use crate::cli::Cli;
use crate::config::{database_url_from_env, Config, ConnectionConfig};
use crate::db::{self, Document, DocumentStore};
use crate::error::{Result, ShelfError};
use crate::query::{default_plan, load_plan, run, QuerySpec};
use crate::report::{write_block, OutputFormat};
use futures::TryStreamExt;
use std::io::Write;
use tracing::{debug, info};

/// Everything a report run needs, resolved from CLI, config file and environment.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub connection: ConnectionConfig,
    pub collection: String,
    pub plan: Vec<QuerySpec>,
    pub seed: Option<Vec<Document>>,
    pub format: OutputFormat,
}

impl ReportSettings {
    /// Resolves settings from parsed arguments.
    ///
    /// Plan and seed files are read here, before any connection is opened.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let format = cli.parse_output_format().map_err(ShelfError::config)?;

        let config_path = cli.config_path();
        info!("Loading config from: {}", config_path.display());
        let config = Config::load_from_file(&config_path)?;

        let env_url = database_url_from_env();
        let connection = resolve_connection(cli, &config, env_url)?.ok_or_else(|| {
            ShelfError::config(
                "No database connection configured. Pass a connection string, \
                 --connection, --mock-db, or set DATABASE_URL.",
            )
        })?;

        let collection = cli
            .collection
            .clone()
            .unwrap_or_else(|| config.collection.clone());

        let plan = match &cli.plan {
            Some(path) => load_plan(path)?,
            None => default_plan(),
        };
        let seed = cli.seed.as_deref().map(load_seed).transpose()?;

        Ok(Self {
            connection,
            collection,
            plan,
            seed,
            format,
        })
    }
}

/// Resolves the connection with precedence:
/// 1. `--mock-db` or the positional connection string
/// 2. Named connection from config
/// 3. Default connection from config
/// 4. Database URL from the environment
pub fn resolve_connection(
    cli: &Cli,
    config: &Config,
    env_url: Option<String>,
) -> Result<Option<ConnectionConfig>> {
    let mut connection = cli.to_connection_config()?;

    if connection.is_none() {
        if let Some(name) = cli.connection_name() {
            connection = config.get_connection(Some(name)).cloned();
            if connection.is_none() {
                return Err(ShelfError::config(format!(
                    "Connection '{name}' not found in config file"
                )));
            }
        }
    }

    if connection.is_none() {
        connection = config.get_connection(None).cloned();
    }

    if connection.is_none() {
        if let Some(url) = env_url {
            debug!("Using database URL from the environment");
            connection = Some(ConnectionConfig::from_connection_string(&url)?);
        }
    }

    if let Some(ref mut conn) = connection {
        conn.resolve_url()?;
        conn.apply_env_defaults();
    }

    Ok(connection)
}

/// Connects, runs the report to stdout and closes the store.
pub async fn run_app(settings: &ReportSettings) -> Result<()> {
    let store = db::connect(&settings.connection).await?;

    let result = run_report(store.as_ref(), settings, &mut std::io::stdout()).await;

    let closed = store.close().await;
    debug!("Store closed");
    result.and(closed)
}

/// Writes the line reported when a run fails: category, then the error with
/// the failing query's label.
pub fn write_failure(out: &mut impl Write, err: &ShelfError) {
    let _ = writeln!(out, "{}: {}", err.category(), err);
}

/// Seeds the collection if requested, then runs the plan, writing each block
/// to `out` as soon as its query completes. Stops at the first failure.
pub async fn run_report(
    store: &dyn DocumentStore,
    settings: &ReportSettings,
    out: &mut impl Write,
) -> Result<()> {
    let collection = settings.collection.as_str();

    if let Some(docs) = &settings.seed {
        let inserted = store.insert_many(collection, docs).await?;
        info!("Seeded {inserted} books into '{collection}'");
    }

    info!(
        "Running {} queries against '{collection}' on {}",
        settings.plan.len(),
        store.backend().as_str()
    );

    let mut results = std::pin::pin!(run(store, collection, &settings.plan));
    while let Some(item) = results.try_next().await? {
        write_block(out, &item, settings.format)?;
    }
    Ok(())
}
