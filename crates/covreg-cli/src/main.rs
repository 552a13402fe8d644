use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use covreg_core::{SortDirection, SortField};
use covreg_storage::{PgStore, RegionDayStore};
use covreg_sync::{CacheGate, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "covreg")]
#[command(about = "Regional COVID-19 data cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the storage schema.
    Migrate,
    /// Ensure rows for a date are cached and print them.
    Fetch {
        /// Date as YYYY-MM-DD; defaults to today (the "latest" feed).
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Sort column; unknown names fall back to the default order.
        #[arg(long)]
        sort_by: Option<String>,
        /// asc or desc (default desc).
        #[arg(long)]
        sort_order: Option<String>,
    },
    /// Print the most recent stored reporting date.
    Latest,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.ensure_schema().await?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Fetch {
            date,
            sort_by,
            sort_order,
        } => {
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let source = Arc::new(config.build_source()?);
            let gate = CacheGate::new(source, store.clone());

            let target = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
            let rows = match gate.ensure_available(target).await {
                Ok(rows) => rows,
                // A "today" request with nothing upstream falls back to the
                // most recent day already stored.
                Err(err) if date.is_none() => {
                    let latest = store.latest_date().await?;
                    match latest {
                        Some(latest) => gate.ensure_available(latest).await?,
                        None => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            };

            let effective = rows.first().map(|r| r.submission_date);
            let rows = match (effective, &sort_by) {
                (Some(effective), Some(tag)) => {
                    let field = SortField::parse(tag);
                    let direction = sort_order
                        .as_deref()
                        .and_then(SortDirection::parse)
                        .unwrap_or_default();
                    store.read_by_date(effective, field, direction).await?
                }
                _ => rows,
            };

            for row in &rows {
                println!(
                    "{}  {:>3}  {:<24} {:>9}",
                    row.submission_date, row.region_code, row.region_name, row.total_positive_cases
                );
            }
        }
        Commands::Latest => {
            let store = PgStore::connect(&config.database_url).await?;
            match store.latest_date().await? {
                Some(date) => println!("{date}"),
                None => println!("no data stored yet"),
            }
        }
    }

    Ok(())
}
