use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use bizsync_sync::{
    build_fixture_pipeline, build_pipeline, open_store, render_duplicate_report, AppConfig,
    IngestPipeline,
};
use bizsync_web::AppState;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bizsync")]
#[command(about = "Business directory sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search the provider and persist the returned page.
    Sync {
        #[arg(long)]
        term: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
        /// Serve provider results from a captured search page instead of the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Print stored businesses in the configured order.
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Report duplicate rows and optionally remove identity duplicates.
    Duplicates {
        #[arg(long)]
        clean: bool,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    Migrate,
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Sync {
            term,
            location,
            limit,
            offset,
            fixture,
        } => {
            let pipeline = match fixture {
                Some(path) => build_fixture_pipeline(config, path).await?,
                None => build_pipeline(config).await?,
            };
            run_sync(&pipeline, &term, &location, limit, offset).await?;
        }
        Commands::List {
            search,
            limit,
            offset,
        } => {
            let pipeline = build_pipeline(config).await?;
            let page = pipeline
                .list_businesses(limit, offset, search.as_deref())
                .await?;
            for business in &page.businesses {
                let record = &business.record;
                println!(
                    "{:>4.1} {:>6}  {}  {}  [{}]",
                    record.rating, record.review_count, record.name, record.address, record.external_id
                );
            }
            println!(
                "showing {} of {} (offset {}, more: {})",
                page.businesses.len(),
                page.pagination.total,
                page.pagination.offset,
                page.pagination.has_next
            );
        }
        Commands::Duplicates { clean, yes } => {
            let store = open_store(&config).await?;
            let report = store.detect_duplicates().await?;
            println!("{}", render_duplicate_report(&report));

            if clean {
                if !report.has_identity_duplicates() {
                    println!("\nno identity duplicates to remove");
                } else if yes || confirm("\nDelete older duplicate rows?")? {
                    let removed = store.reconcile_duplicates().await?;
                    let after = store.detect_duplicates().await?;
                    println!("\nremoved {removed} duplicate rows");
                    println!(
                        "rows: {} distinct external ids: {} integrity: {}",
                        after.total_rows,
                        after.distinct_identity_count,
                        if after.integrity_ok { "ok" } else { "MISMATCH" }
                    );
                } else {
                    println!("cancelled");
                }
            }
        }
        Commands::Migrate => {
            let store = open_store(&config).await?;
            let version = store.schema_version().await?;
            let report = store.detect_duplicates().await?;
            println!(
                "schema version {version}, unique index on external_id: {}",
                if report.identity_constraint_installed {
                    "installed"
                } else {
                    "missing (run `duplicates --clean`)"
                }
            );
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            let pipeline = build_pipeline(config).await?;
            bizsync_web::serve(AppState::new(pipeline), port).await?;
        }
    }

    Ok(())
}

async fn run_sync(
    pipeline: &IngestPipeline,
    term: &str,
    location: &str,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<()> {
    let result = pipeline
        .search_and_ingest(term, location, limit, offset)
        .await
        .with_context(|| format!("syncing {term:?} in {location:?}"))?;
    let report = &result.report;
    info!(run_id = %report.run_id, "sync finished");
    println!(
        "sync complete: run_id={} received={} inserted={} updated={} failed={} provider_total={}",
        report.run_id,
        report.received,
        report.inserted,
        report.updated,
        report.failed,
        result.pagination.total
    );
    for failure in &report.failures {
        println!(
            "  #{} {} [{}] {}",
            failure.index,
            failure.external_id.as_deref().unwrap_or("-"),
            failure.kind,
            failure.message
        );
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
