use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcm_monitor::{Monitor, MonitorConfig};
use tcm_storage::{JsonFileStore, StateStore};
use tcm_web::AppState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tcm-cli")]
#[command(about = "Trade compliance monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run,
    Serve,
    Alerts,
    Forward { ids: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let monitor = build_monitor(config).await?;
            match monitor.try_run().await? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => eprintln!("a check is already running"),
            }
        }
        Commands::Serve => {
            let web_port = config.web_port;
            let monitor = build_monitor(config).await?;

            // Startup check runs concurrently with the server, same as the
            // scheduled ones.
            let startup = Arc::clone(&monitor);
            tokio::spawn(async move {
                if let Err(err) = startup.try_run().await {
                    error!(error = %err, "startup check failed");
                }
            });

            if let Some(mut sched) = monitor.maybe_build_scheduler().await? {
                sched.start().await.context("starting scheduler")?;
            }

            let state = AppState::new(Arc::clone(&monitor));
            tokio::select! {
                res = tcm_web::serve(state, web_port) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }
            monitor.wait_idle().await;
        }
        Commands::Alerts => {
            let store = JsonFileStore::new(config.data_dir.clone());
            let alerts = store.list_alerts().await?;
            println!("{}", serde_json::to_string_pretty(&alerts)?);
        }
        Commands::Forward { ids } => {
            let monitor = build_monitor(config).await?;
            let report = monitor.forward_alerts(&ids).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn build_monitor(config: MonitorConfig) -> Result<Arc<Monitor>> {
    let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
    Ok(Arc::new(Monitor::new(config, store).await?))
}
