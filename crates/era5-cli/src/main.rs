use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use era5_sync::{Services, SyncConfig};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "era5-cli")]
#[command(about = "ERA5 reanalysis acquisition scheduler")]
struct Cli {
    /// Print reports as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply migrations and add status columns for configured targets.
    Migrate,
    /// Migrate, then create the month calendar.
    Init,
    /// Run one acquisition tick.
    Tick,
    /// Run one reconciler pass over every aggregate target.
    Reconcile,
    /// Clear download claims older than the grace period.
    Heal,
    /// Write a status report under reports/.
    Status,
    /// Start the long-running scheduler.
    Run,
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let services = Services::from_config(SyncConfig::from_env()).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            services.migrate().await?;
            println!("migrations applied");
        }
        Commands::Init => {
            let created = services.init(Utc::now()).await?;
            println!("month calendar ready: {created} months created");
        }
        Commands::Tick => {
            let report = services.tick(Utc::now()).await;
            print(cli.json, &report, || {
                format!(
                    "tick {}: selection={:?} outcome={:?}",
                    report.run_id, report.selection, report.outcome
                )
            })?;
            if let Some(reason) = report.failure_reason() {
                bail!("acquisition failed: {reason}");
            }
        }
        Commands::Reconcile => {
            let report = services.reconcile().await;
            print(cli.json, &report, || {
                format!(
                    "reconcile complete: targets={} purged_months={}",
                    report.targets.len(),
                    report.purged_months()
                )
            })?;
            if !report.is_clean() {
                bail!("reconcile failed: {:?}", report.errors);
            }
        }
        Commands::Heal => {
            let healed = services.heal(Utc::now()).await?;
            print(cli.json, &healed, || format!("cleared {} stale claims", healed.len()))?;
        }
        Commands::Status => {
            let report = services.status_report().await?;
            print(cli.json, &report.summary, || {
                format!(
                    "status: months={} acquired={} pending={} in_flight={} report={}",
                    report.summary.months,
                    report.summary.acquired,
                    report.summary.pending,
                    report.summary.in_flight,
                    report.reports_dir.display()
                )
            })?;
        }
        Commands::Run => {
            services.runner().await?.run_until_shutdown().await?;
        }
    }

    Ok(())
}
