use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fishfarm_etl::config::EtlConfig;
use fishfarm_etl::pipeline::record_types::RecordType;
use fishfarm_etl::pipeline::runner::RunReport;
use fishfarm_etl::sink::SqliteSink;
use fishfarm_etl::{logging, metrics, Orchestrator};

#[derive(Parser)]
#[command(name = "fishfarm-etl")]
#[command(about = "Load fish farm worksheets into the operational database")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "etl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, clean and load record types
    Run {
        /// Record types to run (comma-separated). Run `list` to see them.
        #[arg(long, value_delimiter = ',', conflicts_with = "all")]
        pipeline: Vec<String>,
        /// Run every enabled record type (the default when no pipeline is given)
        #[arg(long)]
        all: bool,
        /// Log intended writes without touching the database
        #[arg(long)]
        dry_run: bool,
        /// Print run reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// List record types with their tables and worksheets
    List,
    /// Create the destination tables if they do not exist
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = EtlConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _guard = logging::init_logging(&config.log_dir);
    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics(addr);
    }
    let config = Arc::new(config);

    match cli.command {
        Commands::Run {
            pipeline,
            all,
            dry_run,
            json,
        } => {
            let selected = parse_record_types(&pipeline)?;
            let orchestrator = Orchestrator::from_config(Arc::clone(&config), dry_run)?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling runs");
                    on_signal.cancel();
                }
            });

            let reports = if all || selected.is_empty() {
                orchestrator.run_all(&cancel).await?
            } else {
                orchestrator.run_selected(&selected, &cancel).await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_reports(&reports);
            }

            if reports.iter().any(|r| !r.succeeded()) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::List => {
            for record_type in RecordType::ALL {
                let schema = config.schema_for(record_type);
                println!(
                    "{:<24} table={:<24} worksheet={:<28} key=[{}]{}",
                    record_type.name(),
                    schema.table,
                    config.worksheet_for(record_type).to_string(),
                    schema.natural_key.join(", "),
                    if config.is_enabled(record_type) { "" } else { " (disabled)" },
                );
            }
        }
        Commands::InitDb => {
            let sink = SqliteSink::open(
                &config.destination.database_path,
                config.destination.pool_size,
                config.busy_timeout(),
            )?;
            sink.bootstrap().await?;
            info!(path = %config.destination.database_path.display(), "database initialized");
            println!(
                "Initialized {}",
                config.destination.database_path.display()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_record_types(names: &[String]) -> anyhow::Result<Vec<RecordType>> {
    let mut record_types = Vec::with_capacity(names.len());
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        record_types.push(name.parse::<RecordType>()?);
    }
    if !names.is_empty() && record_types.is_empty() {
        bail!("--pipeline was given without any record type");
    }
    Ok(record_types)
}

fn print_reports(reports: &[RunReport]) {
    for report in reports {
        let status = if report.succeeded() { "ok" } else { "FAILED" };
        println!("\n{} [{}] run {}", report.pipeline, status, report.run_id);
        println!("   Source: {}", report.source);
        println!(
            "   Rows: {} extracted, {} blank, {} cleaned, {} failed",
            report.rows_extracted, report.rows_blank, report.rows_cleaned, report.rows_failed
        );
        println!(
            "   Loaded: {} inserted, {} updated ({} attempts)",
            report.rows_inserted, report.rows_updated, report.load_attempts
        );
        for failure in report.failures.iter().take(10) {
            for field in &failure.failures {
                println!("   - sheet row {}: {}", failure.sheet_row, field);
            }
        }
        if report.failures.len() > 10 {
            println!("   ... {} more failed rows", report.failures.len() - 10);
        }
        if let Some(err) = &report.error {
            println!("   Error: {}", err);
        }
    }
}
