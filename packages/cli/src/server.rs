// ABOUTME: HTTP server wiring: provider selection, middleware and graceful shutdown
// ABOUTME: Owns the sandbox services for the lifetime of the process

use anyhow::{bail, Context};
use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use dappbox_api::{create_sandbox_router, health_check};
use dappbox_sandbox::{
    DockerProvider, MemoryProvider, SandboxProvider, SandboxServices, SandboxSettings,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, ProviderKind};

/// Build the configured sandbox provider. The Docker backend must answer
/// before the server starts.
pub async fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn SandboxProvider>> {
    match config.provider {
        ProviderKind::Memory => {
            warn!("Using the in-memory provider; sandboxes are simulated");
            Ok(Arc::new(MemoryProvider::new()))
        }
        ProviderKind::Docker => {
            let docker = Arc::new(
                DockerProvider::new(config.public_host.clone())
                    .context("Failed to connect to Docker")?,
            );
            if !docker.is_available().await.unwrap_or(false) {
                bail!("Docker daemon is not responding");
            }
            if let Some(interval) = config.reaper_interval {
                info!("Reaping expired sandboxes every {:?}", interval);
                docker.clone().spawn_reaper(interval);
            }
            Ok(docker)
        }
    }
}

fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origin == "*" {
        return Ok(cors.allow_origin(Any));
    }
    let origin = origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid CORS origin: {}", origin))?;
    Ok(cors.allow_origin(origin))
}

/// Full application router: health check, sandbox API, tracing and CORS
pub fn create_app(services: Arc<SandboxServices>, config: &Config) -> anyhow::Result<Router> {
    Ok(Router::new()
        .route("/health", get(health_check))
        .merge(create_sandbox_router(services))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origin)?))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}

pub async fn run_server(config: Config, settings: SandboxSettings) -> anyhow::Result<()> {
    let provider = build_provider(&config).await?;
    let services = Arc::new(SandboxServices::new(provider, settings));
    let app = create_app(services.clone(), &config)?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Server listening on http://{}", addr);
    info!("CORS origin: {}", config.cors_origin);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown().await;
    info!("Server stopped");
    Ok(())
}
