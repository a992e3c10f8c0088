//! Startup helpers for the tangent tree server.

use std::process::ExitCode;

use crate::server::{self, AppState};
use crate::tree::core::config::TreeConfig;

/// Run the server until Ctrl-C (used by the `tangent-server` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting tangent tree v{}", env!("CARGO_PKG_VERSION"));

    let config = match TreeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };
    tracing::info!(
        "Provider endpoint: {} (model {})",
        config.provider.base_url,
        config.provider.model
    );
    if config.provider.api_key.is_none() {
        tracing::warn!("No API key configured; requests go out unauthenticated");
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let port = config.server.port;
    let result = rt.block_on(async move {
        let state = AppState::from_config(config).await?;
        server::run_server_with_shutdown(state, port, shutdown_signal()).await
    });

    if let Err(e) = result {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    tracing::info!("Server stopped");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
