// ABOUTME: Entry point for the dappbox server
// ABOUTME: Parses CLI flags, loads configuration and runs the HTTP server

use clap::{Parser, Subcommand};
use dappbox_cli::config::{Config, ProviderKind};
use dappbox_cli::server::run_server;
use dappbox_cli::telemetry::init_tracing;
use dappbox_sandbox::SandboxSettings;
use tracing::info;

#[derive(Parser)]
#[command(name = "dappbox")]
#[command(about = "Control plane for per-project remote dev sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Address to bind (overrides DAPPBOX_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides DAPPBOX_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Sandbox backend: docker or memory (overrides DAPPBOX_PROVIDER)
        #[arg(long)]
        provider: Option<ProviderKind>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            provider,
        } => {
            let mut config = Config::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(provider) = provider {
                config.provider = provider;
            }

            init_tracing(config.log_format);
            let settings = SandboxSettings::from_env()?;
            info!(
                "Starting dappbox on {}:{} with {:?} provider",
                config.host, config.port, config.provider
            );
            run_server(config, settings).await
        }
    }
}
