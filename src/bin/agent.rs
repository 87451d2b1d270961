//! Drover agent binary: on-host telemetry collection and command
//! execution. See the `drover` library for the core functionality.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use drover::agent::update::{self, RestartStrategy, UPDATED_EXIT_CODE, VERSION};
use drover::agent::{self, AgentExit};
use drover::config::{config_dir, AgentConfig};

#[derive(Parser)]
#[command(name = "drover-agent")]
#[command(version = VERSION)]
#[command(about = "On-host telemetry agent for reverse-proxy fleets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent.
    Start,
    /// Query a running local agent's readiness endpoint.
    Status,
    /// Print the effective configuration.
    Config,
    /// Check for (or install) a newer agent build.
    Update {
        /// Show version information without installing.
        #[arg(long)]
        check: bool,
    },
    /// Clear the degraded flag on a managed config file (operator action).
    ClearDegraded {
        /// The managed file path to clear.
        path: PathBuf,
    },
    /// Rewrite the WAL dropping acknowledged records (agent must be stopped).
    CompactBuffer,
}

/// Pick the log file: env override, else the config dir.
fn log_file_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROVER_LOG_FILE") {
        return PathBuf::from(path);
    }
    config_dir()
        .map(|dir| dir.join("drover-agent.log"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/drover-agent.log"))
}

fn init_logging(log_path: &PathBuf) {
    let target = std::fs::File::create(log_path)
        .map(|file| env_logger::Target::Pipe(Box::new(file)))
        .unwrap_or(env_logger::Target::Stderr);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(target)
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_path = log_file_path();
    init_logging(&log_path);

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));

    match cli.command {
        Commands::Start => {
            let config = AgentConfig::load()?;
            let (shutdown_tx, _) = watch::channel(false);

            // Signal handling: SIGINT/SIGTERM flip the shutdown channel.
            {
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let mut sigterm = tokio::signal::unix::signal(
                        tokio::signal::unix::SignalKind::terminate(),
                    )
                    .expect("sigterm handler installs");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                    log::info!("[Agent] shutdown signal received");
                    let _ = shutdown_tx.send(true);
                });
            }

            let service_unit = config.service_unit.clone();
            let exit = agent::run(config, Some(log_path), shutdown_tx).await?;
            if exit == AgentExit::UpdatedRestart {
                match update::restart_strategy(service_unit.as_deref()) {
                    RestartStrategy::OrchestratorExit => {
                        println!("Updated; exiting for orchestrator restart");
                        std::process::exit(UPDATED_EXIT_CODE);
                    }
                    RestartStrategy::ServiceManager => {
                        let unit = service_unit.expect("strategy implies a unit");
                        let status = std::process::Command::new("systemctl")
                            .args(["restart", &unit])
                            .status();
                        if let Err(e) = status {
                            log::warn!("systemctl restart failed: {e}; exiting for supervisor");
                        }
                    }
                    RestartStrategy::SupervisorExit => {
                        println!("Updated; exiting for supervisor restart");
                    }
                }
            }
        }
        Commands::Status => {
            let config = AgentConfig::load()?;
            if config.health_port == 0 {
                anyhow::bail!("health endpoint disabled (health_port = 0)");
            }
            let url = format!("http://127.0.0.1:{}/readyz", config.health_port);
            let response = reqwest::get(&url).await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            if !status.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            let config = AgentConfig::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Update { check } => {
            let config = AgentConfig::load()?;
            let server = config.update_server.clone();
            if check {
                let status =
                    tokio::task::spawn_blocking(move || update::check(&server)).await??;
                match status {
                    update::UpdateStatus::UpdateAvailable { current, latest } => {
                        println!("Current version: {current}");
                        println!("Latest version: {latest}");
                        println!("Run 'drover-agent update' to install");
                    }
                    update::UpdateStatus::UpToDate { version } => {
                        println!("Running the latest version ({version})");
                    }
                    update::UpdateStatus::AheadOfRelease { current, latest } => {
                        println!("Running {current}, ahead of the latest release {latest}");
                    }
                }
            } else {
                let helper = config.update_helper.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    update::install(&server, helper.as_deref())
                })
                .await??;
                match outcome {
                    update::UpdateOutcome::Applied { version } => {
                        println!("Updated to {version}; restart the agent to pick it up");
                    }
                    update::UpdateOutcome::AlreadyCurrent => {
                        println!("Already running the latest version");
                    }
                }
            }
        }
        Commands::CompactBuffer => {
            let config = AgentConfig::load()?;
            let reclaimed = drover::wal::WalBuffer::compact(&config.buffer_path)?;
            println!(
                "Compacted {}: reclaimed {reclaimed} bytes",
                config.buffer_path.display()
            );
        }
        Commands::ClearDegraded { path } => {
            let config = AgentConfig::load()?;
            let applier = drover::agent::apply::ConfigApplier::from_config(&config);
            if applier.is_degraded(&path) {
                applier.clear_degraded(&path);
                println!("Cleared degraded flag for {}", path.display());
            } else {
                println!("{} is not marked degraded", path.display());
            }
        }
    }

    Ok(())
}
