use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod aggregate;
mod breadcrumbs;
mod config;
mod db;
mod export;
mod harvest;
mod index;
mod models;
mod pipeline;
mod syllabus;

use config::Settings;
use export::{FileSink, HttpSink, RecordSink, TableSink};

#[derive(Parser)]
#[command(name = "progress-export")]
#[command(about = "Learner progress and breadcrumb export for LMS programs", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SinkKind {
    Http,
    Table,
    File,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small demonstration program
    Seed,
    /// Import activity events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Harvest the program's course trees into the breadcrumbs table
    Breadcrumbs {
        /// Write a CSV file instead of replacing the table
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Aggregate learner progress and deliver it to a sink
    Export {
        #[arg(long, value_enum, default_value_t = SinkKind::Http)]
        sink: SinkKind,
        /// Target file for the file sink
        #[arg(long, default_value = "progress.json")]
        out: PathBuf,
        /// Export at most this many learners
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings;
    init_tracing(&settings.log_level);

    let database_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL must be set to the LMS Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .context("failed to build HTTP client")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} activity events from {}.", csv.display());
        }
        Commands::Breadcrumbs { out } => {
            let source = db::PgSource::new(pool.clone());
            let (harvest, _) = pipeline::harvest_source(&source, &settings.program_code).await?;
            let weights = match &settings.syllabus_url {
                Some(url) => syllabus::load_weights(&client, url).await?,
                None => syllabus::WeightTable::default(),
            };
            let rows = breadcrumbs::build_rows(&harvest, &weights);

            match out {
                Some(path) => {
                    breadcrumbs::write_csv(&path, &rows)?;
                    println!("Wrote {} breadcrumbs to {}.", rows.len(), path.display());
                }
                None => {
                    let stored = db::store_breadcrumbs(&pool, &rows).await?;
                    println!("Stored {stored} breadcrumbs.");
                }
            }
        }
        Commands::Export { sink, out, limit } => {
            let syllabus_url = settings
                .syllabus_url
                .as_deref()
                .context("SYLLABUS_URL must be set to export fractions")?;
            let weights = syllabus::load_weights(&client, syllabus_url).await?;

            let sink: Box<dyn RecordSink> = match sink {
                SinkKind::Http => {
                    let endpoint = settings
                        .export_endpoint
                        .clone()
                        .context("EXPORT_ENDPOINT must be set for the http sink")?;
                    Box::new(HttpSink::new(client.clone(), endpoint))
                }
                SinkKind::Table => Box::new(TableSink::new(pool.clone())),
                SinkKind::File => Box::new(FileSink::new(out)),
            };

            let config = settings.export_config(limit);
            info!(sink = %sink.describe(), ?config, "starting export");

            let source = db::PgSource::new(pool.clone());
            let summary = pipeline::run_export(
                &source,
                sink.as_ref(),
                &settings.program_code,
                &weights,
                &config,
                chrono::Utc::now(),
            )
            .await?;

            println!(
                "Exported {} of {} learners to {} ({} unmatched events, {} unweighted lessons).",
                summary.delivered,
                summary.learners,
                sink.describe(),
                summary.unmatched_events,
                summary.unweighted_lessons
            );
        }
    }

    Ok(())
}
