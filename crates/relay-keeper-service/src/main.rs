//! # Relay-Keeper Service
//!
//! Binary entry point.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes logging
//! - Builds the resilient-call components and starts the dedupe sweeper
//! - Serves the health and status endpoints until shutdown

use relay_keeper_core::{OAuthRefreshClient, ResilientCall};
use relay_keeper_service::{
    load_config, start_server, AppState, LoggingConfig, ServiceError, CONFIG_FILE_ENV,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration is read before logging so the logging section applies.
    // Errors are reported once the subscriber is up.
    let explicit_path = std::env::var(CONFIG_FILE_ENV).ok();
    let loaded = load_config(explicit_path.as_deref());

    let default_logging = LoggingConfig::default();
    let logging = loaded
        .as_ref()
        .map(|c| &c.logging)
        .unwrap_or(&default_logging);
    init_tracing(logging);

    info!("Starting Relay-Keeper Service");

    let service_config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(
                error = %e,
                "Service configuration is invalid; aborting. Fix the configuration and restart."
            );
            std::process::exit(e.exit_code());
        }
    };

    // -------------------------------------------------------------------------
    // Build the resilient-call components
    // -------------------------------------------------------------------------
    let credentials = &service_config.relay.credentials;
    let refresher = match OAuthRefreshClient::new(
        &credentials.token_url,
        credentials.refresh_timeout(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to build token refresh client; aborting");
            std::process::exit(ServiceError::from(e).exit_code());
        }
    };

    let call = match ResilientCall::from_config(&service_config.relay, refresher) {
        Ok(call) => Arc::new(call),
        Err(e) => {
            error!(error = %e, "Failed to build resilient call; aborting");
            std::process::exit(ServiceError::from(e).exit_code());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = call.dedupe().spawn_sweeper(shutdown_rx);

    info!(
        host = %service_config.server.host,
        port = service_config.server.port,
        "Starting HTTP server"
    );

    let result = start_server(&service_config, AppState::new(call)).await;

    // Stop background work whether the server ended cleanly or not
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Dedupe sweeper ended abnormally");
    }

    if let Err(e) = result {
        error!("Server failed: {}", e);
        std::process::exit(e.exit_code());
    }

    info!("Relay-Keeper Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.default_filter().into());

    let json_layer = logging
        .json_format
        .then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!logging.json_format).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}
