//! Bootstrap utilities for catlet binaries.
//!
//! Shared initialization code for the controller and agent processes.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the CATLET_LOG environment variable.
///
/// Defaults to "info" level if CATLET_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for ctrl-c, logging instead of failing if the signal handler is unavailable.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
