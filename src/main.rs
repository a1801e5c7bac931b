use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use school_stats::api::{self, ApiState};
use school_stats::config::Settings;
use school_stats::db::{self, PgBackend};
use school_stats::report;
use school_stats::{JobRunner, PeriodKind, SourceReader, StatsEngine};

#[derive(Parser)]
#[command(name = "school-stats")]
#[command(about = "Periodic class and student statistics for the school platform", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo class with a week of records
    Seed,
    /// Run one aggregation sweep and exit
    Tick {
        /// Reference instant (RFC 3339); defaults to now, earlier values backfill
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Run the recurring sweep and the read API until interrupted
    Serve,
    /// Generate a markdown report for one class
    Report {
        #[arg(long)]
        class_id: Uuid,
        #[arg(long, default_value = "week")]
        period: PeriodKind,
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Import height and weight measurements from a CSV file
    ImportMeasurements {
        #[arg(long)]
        csv: PathBuf,
    },
}

async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn engine(backend: Arc<PgBackend>, settings: &Settings) -> anyhow::Result<StatsEngine> {
    Ok(
        StatsEngine::new(backend.clone(), backend, settings.calculator()?)
            .with_read_timeout(settings.read_timeout()),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(err) => {
                error!("Failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings;
    settings.validate().context("invalid settings")?;
    let pool = connect(&settings).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, &settings.calculator()?).await?;
            println!("Seed data inserted.");
        }
        Commands::Tick { at } => {
            let backend = Arc::new(PgBackend::new(pool));
            let runner = JobRunner::new(engine(backend, &settings)?);
            let report = runner.tick(at.unwrap_or_else(Utc::now)).await;
            println!(
                "Sweep {:?}: {} classes, {} students, {} stats written, {} failed.",
                report.outcome, report.classes, report.students, report.written, report.failed
            );
            if report.failed > 0 {
                anyhow::bail!("sweep finished with {} failures", report.failed);
            }
        }
        Commands::Serve => {
            let backend = Arc::new(PgBackend::new(pool));
            let runner = JobRunner::new(engine(backend.clone(), &settings)?);
            let handle = runner.start(settings.tick_interval());

            let state = ApiState::new(backend.clone(), backend, settings.calculator()?);
            let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
            let served = api::serve(state, addr, shutdown_signal()).await;

            handle.stop().await;
            served.context("read API failed")?;
        }
        Commands::Report {
            class_id,
            period,
            at,
            out,
        } => {
            let backend = PgBackend::new(pool);
            let calculator = settings.calculator()?;
            let class = backend
                .active_classes()
                .await?
                .into_iter()
                .find(|class| class.id == class_id)
                .with_context(|| format!("no active class with id {class_id}"))?;
            let window = calculator.window(period, at.unwrap_or_else(Utc::now));

            let loaded = report::load_class_report(&backend, &backend, class, window).await?;
            std::fs::write(&out, report::build_report(&loaded, &calculator))
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::ImportMeasurements { csv } => {
            let inserted = db::import_measurements(&pool, &csv).await?;
            println!("Inserted {inserted} measurements from {}.", csv.display());
        }
    }

    Ok(())
}
