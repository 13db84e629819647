//! docload-ingest - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use docload_common::logging::{init_logging, LogConfig, LogLevel};
use docload_ingest::cli::{Cli, Commands, RunArgs};
use docload_ingest::config::{create_pool, DbConfig, RunConfig, StoreConfig};
use docload_ingest::coordinator::{Coordinator, CoordinatorConfig};
use docload_ingest::document::Document;
use docload_ingest::selector::select;
use docload_ingest::storage::memory::{MemoryStaging, MemoryStore};
use docload_ingest::storage::postgres::PgStore;
use docload_ingest::storage::{LedgerStore, StagingSource, TargetStore};
use docload_ingest::transform::transform;
use docload_ingest::Contract;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .log_file_prefix("docload-ingest")
        .build();

    // Environment variables take precedence over flags
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::ValidateContract { contract } => validate_contract(&contract),
        Commands::Transform {
            contract,
            input,
            document_id,
        } => transform_file(&contract, &input, document_id),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn load_contract(path: &Path) -> Result<Arc<Contract>> {
    let contract = Contract::load(path)
        .with_context(|| format!("Failed to load contract {}", path.display()))?;
    Ok(Arc::new(contract))
}

fn validate_contract(path: &Path) -> Result<()> {
    let contract = load_contract(path)?;
    let summary = contract.summary();
    info!(
        root_table = %summary.root_table,
        tables = summary.table_insertion_order.len(),
        "Contract is valid"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn transform_file(contract_path: &Path, input: &Path, document_id: Option<i64>) -> Result<()> {
    let contract = load_contract(contract_path)?;
    let payload = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let document = Document::parse(&payload)?;
    let selection = select(&document, &contract, document_id)?;
    let row_set = transform(&document, &selection, &contract)?;
    println!("{}", serde_json::to_string_pretty(&row_set)?);
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let run_config = args.apply_to(RunConfig::from_env()?);
    run_config.validate()?;
    let contract = load_contract(&args.contract)?;

    let (staging, target, ledger) = open_stores(&args, &run_config).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight documents");
            ctrl_c.cancel();
        }
    });

    let mut coordinator = Coordinator::new(
        contract,
        staging,
        target,
        ledger,
        CoordinatorConfig::from(&run_config),
    );
    let summary = coordinator.run(cancel).await?;
    summary.log();

    if let Some(path) = &args.summary_json {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "Run summary written");
    }
    Ok(())
}

type Stores = (
    Arc<dyn StagingSource>,
    Arc<dyn TargetStore>,
    Arc<dyn LedgerStore>,
);

/// Target and ledger always come from the same backend: the unit of work
/// that writes a document's rows also writes its ledger entry.
async fn open_stores(args: &RunArgs, run_config: &RunConfig) -> Result<Stores> {
    let local_staging = match &args.staging_dir {
        Some(dir) => Some(
            MemoryStaging::from_dir(dir)
                .with_context(|| format!("Failed to load staging directory {}", dir.display()))?,
        ),
        None => None,
    };

    if args.dry_run {
        let memory = MemoryStore::new();
        info!("Dry run: writing to an in-memory target and ledger");
        let staging: Arc<dyn StagingSource> = match local_staging {
            Some(staging) => Arc::new(staging),
            None => Arc::new(connect(run_config).await?),
        };
        return Ok((staging, Arc::new(memory.clone()), Arc::new(memory)));
    }

    let store = connect(run_config).await?;
    let staging: Arc<dyn StagingSource> = match local_staging {
        Some(staging) => Arc::new(staging),
        None => Arc::new(store.clone()),
    };
    Ok((staging, Arc::new(store.clone()), Arc::new(store)))
}

async fn connect(run_config: &RunConfig) -> Result<PgStore> {
    let db_config = DbConfig::from_env()?.sized_for(run_config.required_connections());
    db_config.validate()?;
    let store_config = StoreConfig::from_env();
    store_config.validate()?;

    let pool = create_pool(&db_config).await?;
    let store = PgStore::new(pool, store_config);
    store
        .health_check()
        .await
        .context("Database is not reachable")?;
    Ok(store)
}
