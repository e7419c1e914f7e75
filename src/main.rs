//! # Shelf Insight CLI (`shelf`)
//!
//! ## Usage
//!
//! ```bash
//! shelf --config ./config/shelf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelf init` | Create the SQLite database and run schema migrations |
//! | `shelf import <csv>` | Import a reading-history export |
//! | `shelf enrich` | Fetch catalog metadata for pending books |
//! | `shelf embed` | Embed missing or stale books |
//! | `shelf cluster` | Group embedded books by similarity |
//! | `shelf stats` | Print reading statistics |
//! | `shelf insights <kind>` | Generate an LLM insight report |
//! | `shelf history` | List recent LLM exchanges |
//! | `shelf serve` | Start the HTTP server |
//! | `shelf reset` | Drop and recreate all tables |

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shelf_insight::insights::{InsightKind, InsightRequest};
use shelf_insight::{
    cluster, config, db, embedding, enrich, ingest, insights, logging, migrate, server, stats,
};

/// Shelf Insight: import, enrich, cluster, and narrate your reading history.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/shelf.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "shelf", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelf.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Import a reading-history CSV export.
    ///
    /// Rows without a title are skipped. Re-importing the same file updates
    /// existing books instead of duplicating them.
    Import {
        /// Path to the CSV file.
        path: PathBuf,
    },

    /// Look up pending books in the catalog.
    Enrich {
        /// Maximum number of books to look up.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Embed books whose embedding is missing or stale.
    Embed {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Cluster embedded books and store assignments and 2-D coordinates.
    Cluster,

    /// Show reading statistics.
    Stats,

    /// Generate an insight report.
    Insights {
        /// insights, profile, quick, comprehensive, or recommendations.
        kind: String,

        /// What to recommend (required for `recommendations`).
        #[arg(long)]
        query: Option<String>,

        /// Number of recommendations.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List recent LLM exchanges.
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Drop all tables and recreate the schema.
    Reset {
        /// Skip the confirmation guard.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // API keys may live in a local .env file.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { path } => {
            ingest::run_import(&cfg, &path).await?;
        }
        Commands::Enrich { limit } => {
            enrich::run_enrich(&cfg, limit).await?;
        }
        Commands::Embed { limit } => {
            embedding::run_embed(&cfg, limit).await?;
        }
        Commands::Cluster => {
            cluster::run_cluster(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Insights { kind, query, limit } => {
            let kind: InsightKind = kind.parse()?;
            let request = InsightRequest {
                kind,
                query,
                limit,
            };
            insights::run_insights(&cfg, request).await?;
        }
        Commands::History { limit } => {
            insights::run_history(&cfg, limit).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every imported book and insight; pass --yes to confirm");
            }
            let pool = db::connect(&cfg).await?;
            migrate::reset(&pool).await?;
            pool.close().await;
            println!("Database reset.");
        }
    }

    Ok(())
}
