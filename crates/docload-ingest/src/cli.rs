//! Command-line interface definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::RunConfig;

/// docload - contract-driven XML to relational loader
#[derive(Parser, Debug)]
#[command(name = "docload-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load every unprocessed staged document in the range
    Run(RunArgs),

    /// Load and validate a mapping contract, then print its summary
    ValidateContract {
        /// Path to the contract JSON
        #[arg(short, long, env = "DOCLOAD_CONTRACT")]
        contract: PathBuf,
    },

    /// Select and transform one XML file and print the row-set as JSON
    Transform {
        /// Path to the contract JSON
        #[arg(short, long, env = "DOCLOAD_CONTRACT")]
        contract: PathBuf,

        /// XML document to transform
        #[arg(short, long)]
        input: PathBuf,

        /// Staging id of the document; checked against the root identifier
        #[arg(long)]
        document_id: Option<i64>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the contract JSON
    #[arg(short, long, env = "DOCLOAD_CONTRACT")]
    pub contract: PathBuf,

    /// First document id to load, inclusive
    #[arg(long)]
    pub range_start: Option<i64>,

    /// Last document id to load, inclusive
    #[arg(long)]
    pub range_end: Option<i64>,

    /// Concurrent document workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Documents selected per scanner page
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Capacity of the worker-to-drain queue
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Row-sets the drain task commits per wake-up
    #[arg(long)]
    pub drain_batch_size: Option<usize>,

    /// Per-document processing budget in seconds
    #[arg(long)]
    pub document_timeout_secs: Option<u64>,

    /// Stop after dispatching this many documents
    #[arg(long)]
    pub max_documents: Option<usize>,

    /// Write to an in-memory target and ledger instead of the database
    #[arg(long)]
    pub dry_run: bool,

    /// Read staged documents from `<id>.xml` files in this directory
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    pub summary_json: Option<PathBuf>,
}

impl RunArgs {
    /// Apply flags on top of environment configuration
    pub fn apply_to(&self, mut config: RunConfig) -> RunConfig {
        if let Some(v) = self.range_start {
            config.range_start = Some(v);
        }
        if let Some(v) = self.range_end {
            config.range_end = Some(v);
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = self.drain_batch_size {
            config.drain_batch_size = v;
        }
        if let Some(v) = self.document_timeout_secs {
            config.document_timeout_secs = v;
        }
        if let Some(v) = self.max_documents {
            config.max_documents = Some(v);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::parse_from([
            "docload-ingest",
            "run",
            "--contract",
            "contract.json",
            "--workers",
            "3",
            "--range-end",
            "900",
            "--dry-run",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.dry_run);

        let config = args.apply_to(RunConfig::default());
        assert_eq!(config.workers, 3);
        assert_eq!(config.range_end, Some(900));
        assert_eq!(config.batch_size, crate::config::DEFAULT_BATCH_SIZE);
    }
}
