use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gamefeed_ingest::{build_controller, maybe_build_scheduler, IngestConfig};
use gamefeed_storage::{PrivateNetworkGuard, TargetGuard};
use gamefeed_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gamefeed")]
#[command(about = "Educational game feed ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API, with the cron scheduler when enabled.
    Serve,
    /// Run one ingestion pass and print its report.
    RunOnce,
    /// Print whether the private-network guard would refuse a URL.
    CheckUrl { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gamefeed=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let controller = build_controller(&config).await?;
            let scheduler = maybe_build_scheduler(controller.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.cron, "scheduler started");
            }
            gamefeed_web::serve(AppState::new(controller), gamefeed_web::port_from_env()).await?;
        }
        Commands::RunOnce => {
            let controller = build_controller(&config).await?;
            controller.start();
            controller.wait_idle().await;
            let report = controller.last_run().context("run finished without a report")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckUrl { url } => {
            let guard = PrivateNetworkGuard::new(config.guard_fail_closed);
            let unsafe_target = tokio::task::spawn_blocking(move || guard.is_unsafe(&url))
                .await
                .context("guard check panicked")?;
            println!("{}", if unsafe_target { "unsafe" } else { "safe" });
        }
    }

    Ok(())
}
