//! CLI argument parsing for the indexing daemon.

use clap::{Parser, Subcommand};

/// Feed indexing daemon
///
/// Pulls paginated document feeds into a versioned search index.
#[derive(Parser, Debug)]
#[command(name = "search-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the indexing loop
    Run {
        /// Override the name store path prefix. Implies standalone
        /// operation: slave mode is disabled.
        #[arg(long)]
        names: Option<String>,
    },

    /// Dump the current index name mapping
    Names,

    /// Internal: drain one generation in an isolated worker process
    #[command(hide = true, name = "reindex-worker")]
    ReindexWorker {
        /// Logical index key to rebuild
        #[arg(long)]
        key: String,

        /// Physical generation name to drain into
        #[arg(long)]
        generation: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parses() {
        let cli = Cli::parse_from(["search-daemon", "run", "--config", "/etc/search.toml"]);
        assert_eq!(cli.config.as_deref(), Some("/etc/search.toml"));
        assert!(matches!(cli.command, Commands::Run { names: None }));
    }

    #[test]
    fn test_run_with_names_override() {
        let cli = Cli::parse_from(["search-daemon", "run", "--names", "/var/lib/search/names"]);
        match cli.command {
            Commands::Run { names } => {
                assert_eq!(names.as_deref(), Some("/var/lib/search/names"))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_hidden_worker_subcommand_parses() {
        let cli = Cli::parse_from([
            "search-daemon",
            "reindex-worker",
            "--config",
            "/etc/search.toml",
            "--key",
            "tenders",
            "--generation",
            "tenders_1700000000",
        ]);
        match cli.command {
            Commands::ReindexWorker { key, generation } => {
                assert_eq!(key, "tenders");
                assert_eq!(generation, "tenders_1700000000");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_names_parses() {
        let cli = Cli::parse_from(["search-daemon", "names"]);
        assert!(matches!(cli.command, Commands::Names));
    }
}
