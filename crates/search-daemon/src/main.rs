//! Binary entry point.

use clap::Parser;

use search_daemon::cli::{Cli, Commands};
use search_daemon::commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { names } => {
            commands::run_daemon(
                cli.config.as_deref(),
                names.as_deref(),
                cli.log_level.as_deref(),
            )
            .await
        }
        Commands::Names => commands::dump_names(cli.config.as_deref()),
        Commands::ReindexWorker { key, generation } => {
            commands::run_reindex_worker(
                cli.config.as_deref(),
                &key,
                &generation,
                cli.log_level.as_deref(),
            )
            .await
        }
    }
}
