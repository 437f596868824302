//! `cadence` — run the workers declared in cadence.toml and report on them.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use cadence_core::CadenceConfig;
use cadence_scheduler::{admin, ShutdownMode, StartOutcome, WorkerManager};

mod tasks;

/// Periodic background workers with jitter, overlap prevention and timeouts.
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Path to cadence.toml (falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long)]
    config: Option<String>,

    /// Stop all workers after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<u64>,

    /// Seconds between status reports.
    #[arg(long, default_value_t = 5)]
    report_every: u64,

    /// Print reports as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Cancel running jobs on exit instead of letting them finish.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CadenceConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();

    let manager = Arc::new(WorkerManager::new(&config.scheduler));
    for settings in &config.workers {
        match manager.start(tasks::spec_for(settings)) {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyRunning) => {
                warn!(worker = %settings.name, "duplicate worker in config, skipped")
            }
            Err(e) => {
                error!(worker = %settings.name, code = e.code(), error = %e, "worker not started")
            }
        }
    }
    info!(workers = manager.registry().len(), "cadence running");

    let deadline = async {
        match cli.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupt);

    let mut reports = tokio::time::interval(Duration::from_secs(cli.report_every.max(1)));
    reports.tick().await;
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received, stopping workers");
                break;
            }
            _ = &mut deadline => {
                info!("run duration elapsed, stopping workers");
                break;
            }
            _ = reports.tick() => report(&manager, cli.json)?,
        }
    }

    report(&manager, cli.json)?;

    let mode = if cli.force {
        ShutdownMode::Forced
    } else {
        ShutdownMode::Graceful
    };
    // Stopping blocks on thread joins and drain waits.
    let stopper = Arc::clone(&manager);
    let outcomes = tokio::task::spawn_blocking(move || stopper.stop_all(mode)).await?;
    for (name, outcome) in &outcomes {
        info!(worker = %name, ?outcome, "stop");
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }
    Ok(())
}

fn report(manager: &WorkerManager, json: bool) -> anyhow::Result<()> {
    let rows = admin::rows(manager.registry());
    if json {
        println!("{}", serde_json::to_string(&rows)?);
    } else {
        print!("{}", admin::render_table(&rows));
    }
    Ok(())
}
