use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use immersion_sync::{build_scheduler, run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "immersion-cli")]
#[command(about = "Pôle emploi agency referential sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the referential against the agency store once.
    Sync {
        /// Read the referential from a captured JSON payload instead of the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Run the sync on the SYNC_CRON schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        fixture: None,
        reports_dir: None,
    }) {
        Commands::Sync {
            fixture,
            reports_dir,
        } => {
            if fixture.is_some() {
                config.referential_fixture = fixture;
            }
            if reports_dir.is_some() {
                config.reports_dir = reports_dir;
            }
            let summary = run_sync_once(&config).await?;
            let report = &summary.report;
            println!(
                "sync complete: run_id={} total={} added={} hasNoEmail={} matchedEmail={} matchedNearby={} toManyMatch={} duration={:.1}s",
                summary.run_id,
                report.total,
                report.added,
                report.has_no_email,
                report.matched_email,
                report.matched_nearby,
                report.too_many_matches,
                summary.duration_secs
            );
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let mut sched = build_scheduler(config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "agency sync scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("agency sync scheduler stopped");
        }
    }

    Ok(())
}
