//! buildshell server entry point.

use buildshell_server::{http, BuildShellServer, ServerConfig};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("buildshell_server=info".parse()?)
                .add_directive("buildshell_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting buildshell server");

    // Load configuration from environment
    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    config.validate()?;
    // Missing tools only fail the matching stage, so just warn
    config.validate_warn();

    let server = BuildShellServer::new(&config)?;

    // Create shutdown broadcast channel
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let http_server = server.clone();
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_server, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(addr = %config.http_addr, "Server ready");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    // Sessions hold their sockets open, so cancel them before draining HTTP
    server.shutdown();
    let _ = shutdown_tx.send(());

    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
