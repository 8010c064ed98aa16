//! LocaleDB - ingestion command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use localedb_common::logging::{init_logging, LogConfig};
use localedb_common::types::Domain;
use localedb_ingest::{
    geometry::AutoIngester, report, Catalog, Confirmer, Fetcher, IngestConfig, IngestError,
    LifecycleManager, LoaderContext, PartitionTable, PgWarehouse, RemovalScope, Resolver, Stager,
    Warehouse,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

#[derive(Parser, Debug)]
#[command(name = "localedb")]
#[command(author, version, about = "Locale-partitioned data warehouse ingestion")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a domain partition (state abbreviation, FIPS code, `_all`, or disease id)
    Load {
        /// main, geo, pop, dis, npi, vax, health, weather or mobility
        domain: Domain,

        partition: Option<String>,

        /// Reload partitions that are already present
        #[arg(short, long)]
        force: bool,
    },

    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },

    /// Show what the warehouse holds
    Info,
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Remove the rows of a partition
    Rm {
        /// state-geo, state-pop, dis, npi, vax, health, weather or mobility
        scope: RemovalScope,

        partition: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

/// Asks on the terminal before deleting
struct PromptConfirmer;

impl Confirmer for PromptConfirmer {
    fn confirm(&self, prompt: &str) -> localedb_ingest::Result<bool> {
        inquire::Confirm::new(prompt)
            .with_default(false)
            .prompt()
            .map_err(|e| IngestError::Internal(format!("confirmation prompt failed: {}", e)))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::cli(cli.verbose).with_env().unwrap_or_else(|e| {
        eprintln!("Ignoring logging environment: {}", e);
        LogConfig::cli(cli.verbose)
    });
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        },
    }
}

/// Run the command; `Ok(false)` when a partition failed
async fn run(cli: Cli) -> Result<bool> {
    let config = IngestConfig::from_env().context("Failed to load configuration")?;
    let resolver = Resolver::new(PartitionTable::us_states()?);

    let warehouse = Arc::new(
        PgWarehouse::connect(&config.database)
            .await
            .context("Failed to connect to the warehouse")?,
    );
    warehouse
        .ensure_schema()
        .await
        .context("Failed to migrate the warehouse schema")?;

    if let Command::Info = cli.command {
        let states = resolver.table().all();
        let inventory = report::collect_inventory(warehouse.as_ref(), &states).await?;
        println!("{}", report::render_inventory(&inventory));
        return Ok(true);
    }

    let manager = LifecycleManager::new(
        resolver,
        Catalog::new(config.sources.clone()),
        Fetcher::new(&config.paths.cache_dir, &config.fetch)?,
        Stager::new(&config.paths.scratch_dir),
        LoaderContext {
            warehouse,
            geometry: Arc::new(AutoIngester::new(config.ogr2ogr.clone())),
            disease_epoch: config.disease_epoch,
        },
    );
    let span = info_span!("run", id = %manager.run_id());

    let reports = async {
        match cli.command {
            Command::Load {
                domain,
                partition,
                force,
            } => manager.load(domain, partition.as_deref(), force).await,
            Command::Db {
                command:
                    DbCommand::Rm {
                        scope,
                        partition,
                        force,
                    },
            } => manager.remove(scope, &partition, force, &PromptConfirmer).await,
            Command::Info => Ok(Vec::new()),
        }
    }
    .instrument(span)
    .await?;

    println!("{}", report::render_summary(&reports));
    let ok = !report::any_failed(&reports);
    info!(partitions = reports.len(), ok, "Finished");
    Ok(ok)
}
