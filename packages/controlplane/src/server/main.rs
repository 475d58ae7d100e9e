// Main entry point for the control plane server

use anyhow::{Context, Result};
use controlplane_core::kernel::dispatcher::{Dispatcher, DispatcherConfig};
use controlplane_core::kernel::Kernel;
use controlplane_core::server::app::build_app;
use controlplane_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,controlplane_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Steam automation control plane");

    let config = Config::from_env().context("Failed to load configuration")?;
    let port = config.port;

    let kernel = Kernel::new(config)
        .await
        .context("Failed to initialize kernel")?;

    // Background dispatcher, wound down with the server.
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        kernel.clone(),
        DispatcherConfig {
            lease: kernel.config.task_lease,
            ..DispatcherConfig::default()
        },
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    let app = build_app(kernel);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("Control plane listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = dispatcher_handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
