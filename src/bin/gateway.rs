//! Drover gateway binary: terminates agent streams, houses the fleet
//! registry and command router, and batches telemetry into sinks.

use anyhow::Result;
use clap::{Parser, Subcommand};

use drover::agent::update::VERSION;
use drover::config::{config_dir, GatewayConfig};
use drover::gateway::{server, GatewayState};

#[derive(Parser)]
#[command(name = "drover-gateway")]
#[command(version = VERSION)]
#[command(about = "Central gateway for reverse-proxy fleet agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway.
    Start,
    /// Print the effective configuration.
    Config,
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("DROVER_LOG_FILE") {
        if let Ok(file) = std::fs::File::create(&path) {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    builder.format_timestamp_secs().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Start => {
            let config = GatewayConfig::load()?;
            log::info!(
                "[Gateway] v{VERSION} starting on {} (config dir {})",
                config.listen_addr,
                config_dir()?.display()
            );
            let state = GatewayState::from_config(config);
            let shutdown_rx = state.shutdown_rx();

            // Signal handling mirrors the agent: SIGINT/SIGTERM drain.
            let server_state = std::sync::Arc::clone(&state);
            let server_task =
                tokio::spawn(async move { server::serve(server_state, shutdown_rx).await });

            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler installs");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            log::info!("[Gateway] shutdown signal received");

            state.shutdown().await;
            let _ = server_task.await;
        }
        Commands::Config => {
            let config = GatewayConfig::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
