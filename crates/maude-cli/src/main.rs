use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use maude_core::YearSpec;
use maude_sources::DEFAULT_TABLES;
use maude_sync::{CanonicalPolicy, EventQuery, IngestPipeline, IngestRequest, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "maude-cli")]
#[command(about = "Local mirror of the FDA MAUDE adverse event dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load tables for the given years.
    Ingest {
        /// A year, a list (2018,2019), a range (2015-2024), all, latest, or current.
        #[arg(long, default_value = "latest")]
        years: YearSpec,
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Use only files already in the data directory.
        #[arg(long)]
        local: bool,
        #[arg(long)]
        force_refetch: bool,
        #[arg(long)]
        force_refresh: bool,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Re-check every loaded (table, year) against upstream.
    Update {
        #[arg(long)]
        add_new_years: bool,
        #[arg(long)]
        local: bool,
    },
    Status,
    /// Search devices and print deduplicated events as JSON.
    Events {
        #[arg(long)]
        brand_name: Option<String>,
        #[arg(long)]
        generic_name: Option<String>,
        #[arg(long)]
        manufacturer_name: Option<String>,
        #[arg(long)]
        product_code: Option<String>,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long)]
        no_dedup: bool,
        #[arg(long, default_value = "earliest_loaded")]
        policy: CanonicalPolicy,
        /// List events with more than one report instead of the rows.
        #[arg(long)]
        multi_report: bool,
    },
    /// Serve the JSON API, running scheduled updates when enabled.
    Serve {
        #[arg(long, env = "MAUDE_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let pipeline = IngestPipeline::from_config(config).await?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Ingest {
            years,
            tables,
            local,
            force_refetch,
            force_refresh,
            strict,
            chunk_size,
        } => {
            let tables = if tables.is_empty() {
                DEFAULT_TABLES.iter().map(|t| t.to_string()).collect()
            } else {
                tables
            };
            let mut request = IngestRequest::new(years, tables);
            request.fetch = !local;
            request.force_refetch = force_refetch;
            request.force_refresh = force_refresh;
            request.chunk_size = chunk_size;
            if strict {
                request.strict = Some(true);
            }
            let report = pipeline.ingest(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Update { add_new_years, local } => {
            let report = pipeline.update(add_new_years, !local).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Events {
            brand_name,
            generic_name,
            manufacturer_name,
            product_code,
            start,
            end,
            no_dedup,
            policy,
            multi_report,
        } => {
            let mut query = EventQuery::new().deduplicate(!no_dedup).policy(policy);
            if let Some(v) = brand_name {
                query = query.brand_name(v);
            }
            if let Some(v) = generic_name {
                query = query.generic_name(v);
            }
            if let Some(v) = manufacturer_name {
                query = query.manufacturer_name(v);
            }
            if let Some(v) = product_code {
                query = query.product_code(v);
            }
            if start.is_some() || end.is_some() {
                query = query.received_between(start, end);
            }
            if multi_report {
                let events = pipeline.multi_report_events(&query).await?;
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                let rows = pipeline.query_events(&query).await?;
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
        Commands::Serve { port } => {
            let pipeline = Arc::new(pipeline);
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(crons = ?pipeline.config().update_crons, "scheduled updates enabled");
            }
            let state = maude_web::AppState::new(pipeline.store().clone(), Arc::clone(pipeline.catalog()));
            maude_web::serve(state, port).await?;
        }
    }

    Ok(())
}
