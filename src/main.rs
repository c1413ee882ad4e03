//! shelfscan - runs a report of named document queries against a book collection.

use shelfscan::app::{run_app, write_failure, ReportSettings};
use shelfscan::cli::Cli;
use shelfscan::error::Result;
use shelfscan::logging;
use tracing::debug;

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    logging::init_stderr_logging(cli.verbose);

    if let Err(e) = run(&cli).await {
        debug!("Report failed: {e:?}");
        write_failure(&mut std::io::stderr(), &e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let settings = ReportSettings::from_cli(cli)?;
    run_app(&settings).await
}
