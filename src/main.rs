//! Catalog sync daemon.
//!
//! Polls the Postgres movie catalog for changes and delivers the affected
//! documents to Elasticsearch, advancing per-stream watermarks only after
//! each batch is acknowledged.
//!
//! # Usage
//!
//! ```bash
//! # Continuous polling with default settings
//! cinesync --database-url postgres://app@localhost/movies
//!
//! # One pass and exit (for cron-style scheduling)
//! cinesync --database-url postgres://app@localhost/movies --once
//!
//! # Custom index names and state location
//! cinesync \
//!     --database-url postgres://app@localhost/movies \
//!     --elasticsearch-url http://search:9200 \
//!     --state-path /var/lib/cinesync/watermarks.json
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) stops the loop after the current pass. A pass interrupted
//! harder than that is safe: watermarks only ever advance after delivery, so
//! the next run redetects and redelivers whatever was in flight.

use anyhow::{Context, Result};
use cinesync::{
    DirectorPrecedence, ElasticConfig, ElasticIndexer, PostgresCatalog, RetryPolicy, SyncConfig,
    SyncOrchestrator, WatermarkStore,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Catalog sync daemon.
#[derive(Parser, Debug)]
#[command(name = "cinesync")]
#[command(about = "Incremental Postgres → Elasticsearch catalog sync")]
#[command(version)]
struct Args {
    /// Postgres connection string for the catalog database
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Elasticsearch base URL
    #[arg(long, env = "ELASTICSEARCH_URL", default_value = "http://localhost:9200")]
    elasticsearch_url: String,

    /// Path of the watermark state file
    #[arg(long, default_value = "./data/watermarks.json")]
    state_path: PathBuf,

    /// Seconds between polling passes
    #[arg(long, default_value = "60")]
    interval_secs: u64,

    /// Maximum primary-table rows per detection cycle
    #[arg(long, default_value = "100")]
    page_size: i64,

    /// Movies index name
    #[arg(long, default_value = "movies")]
    movies_index: String,

    /// Genres index name
    #[arg(long, default_value = "genres")]
    genres_index: String,

    /// Persons index name
    #[arg(long, default_value = "persons")]
    persons_index: String,

    /// Which director credit wins when a film has several: "first" or "last"
    #[arg(long, default_value = "last")]
    director_precedence: String,

    /// Run a single polling pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("cinesync=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let director_precedence = match args.director_precedence.as_str() {
        "first" => DirectorPrecedence::FirstCredit,
        "last" => DirectorPrecedence::LastCredit,
        other => anyhow::bail!("unknown director precedence {other:?} (expected first|last)"),
    };

    tracing::info!("Catalog sync daemon starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Elasticsearch: {}", args.elasticsearch_url);
    tracing::info!("  State file: {}", args.state_path.display());
    tracing::info!("  Interval: {}s", args.interval_secs);
    tracing::info!("  Page size: {}", args.page_size);
    tracing::info!(
        "  Indices: {}, {}, {}",
        args.movies_index,
        args.genres_index,
        args.persons_index
    );

    let retry = RetryPolicy::default();

    // Both remote dependencies are brought up under the shared backoff
    // policy; the daemon waits for them rather than exiting.
    let catalog = retry
        .run("Postgres connection", || {
            PostgresCatalog::connect(&args.database_url)
        })
        .await;

    let indexer = ElasticIndexer::new(ElasticConfig {
        url: args.elasticsearch_url.clone(),
        ..Default::default()
    })
    .context("Failed to build Elasticsearch client")?;
    retry
        .run("Elasticsearch connection", || indexer.ping())
        .await;
    tracing::info!("Connected to Elasticsearch");

    let store = WatermarkStore::open(&args.state_path)
        .with_context(|| format!("Failed to open watermark store at {:?}", args.state_path))?;

    let config = SyncConfig {
        page_size: args.page_size,
        movies_index: args.movies_index,
        genres_index: args.genres_index,
        persons_index: args.persons_index,
        director_precedence,
        interval: Duration::from_secs(args.interval_secs),
    };

    let mut orchestrator = SyncOrchestrator::new(catalog, indexer, store, config);
    orchestrator
        .ensure_indices()
        .await
        .context("Failed to create indices")?;

    if args.once {
        let stats = orchestrator.run_once().await?;
        tracing::info!(
            "Pass complete: {} movies, {} genres, {} persons in {:?}",
            stats.filmwork_documents,
            stats.genre_documents,
            stats.person_documents,
            stats.duration
        );
        return Ok(());
    }

    // Set up graceful shutdown
    let running = orchestrator.stop_flag();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping after current pass...");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    orchestrator.run_periodic().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
