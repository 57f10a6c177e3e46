//! # Relay-Keeper Service
//!
//! HTTP host for the resilient-call core. Builds one [`ResilientCall`] from
//! configuration and exposes its health and status to operators.

use axum::{extract::State, response::Json, routing::get, Router};
use relay_keeper_core::{
    CircuitSnapshot, CircuitState, ConfigError, RelayConfig, ResilientCall, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "RK_CONFIG_FILE";

// ============================================================================
// Configuration
// ============================================================================

/// Service configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Resilient-call core settings
    pub relay: RelayConfig,
}

impl ServiceConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                field: "server.port".to_string(),
                message: "must not be 0".to_string(),
            });
        }

        self.relay.validate()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the relay-keeper crates when `RUST_LOG` is unset
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub fn default_filter(&self) -> String {
        format!(
            "relay_keeper_service={level},relay_keeper_core={level},tower_http=debug",
            level = self.level
        )
    }
}

/// Load service configuration.
///
/// Sources, later overriding earlier:
///  1. `/etc/relay-keeper/service.yaml`
///  2. `./config/service.yaml`
///  3. `explicit_path`, normally taken from `RK_CONFIG_FILE`
///  4. Environment variables prefixed `RK__`, e.g. `RK__SERVER__PORT=9090`
///
/// Missing files are skipped, except an explicit path. The loaded
/// configuration is validated before it is returned.
pub fn load_config(explicit_path: Option<&str>) -> Result<ServiceConfig, ServiceError> {
    let mut builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/relay-keeper/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Some(path) = explicit_path.filter(|p| !p.is_empty()) {
        info!(path = %path, "Loading configuration from explicit path");
        builder = builder.add_source(
            config::File::with_name(path)
                .required(true)
                .format(config::FileFormat::Yaml),
        );
    }

    let service_config: ServiceConfig = builder
        .add_source(config::Environment::with_prefix("RK").separator("__"))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| ServiceError::ConfigLoad {
            message: e.to_string(),
        })?;

    service_config.validate()?;
    Ok(service_config)
}

// ============================================================================
// Errors
// ============================================================================

/// Service startup and runtime errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Failed to load configuration: {message}")]
    ConfigLoad { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl ServiceError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BindFailed { .. } => 1,
            Self::ServerFailed { .. } => 2,
            Self::ConfigLoad { .. } | Self::Configuration(_) => 3,
        }
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub call: Arc<ResilientCall>,
}

impl AppState {
    pub fn new(call: Arc<ResilientCall>) -> Self {
        Self { call }
    }

    pub fn call(&self) -> &Arc<ResilientCall> {
        &self.call
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: Timestamp,
    pub version: String,
}

/// Runtime view of the resilient-call components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `healthy` while the circuit is closed, `degraded` otherwise
    pub status: String,
    pub timestamp: Timestamp,
    pub circuit: CircuitSnapshot,
    pub dedupe_entries: usize,
    pub token_generation: u64,
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Timestamp::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let call = state.call();
    let circuit = call.circuit_breaker().snapshot();

    let status = if circuit.state == CircuitState::Closed {
        "healthy"
    } else {
        "degraded"
    };

    Json(StatusResponse {
        status: status.to_string(),
        timestamp: Timestamp::now(),
        circuit,
        dedupe_entries: call.dedupe().len(),
        token_generation: call.tokens().generation(),
    })
}

// ============================================================================
// Server
// ============================================================================

/// Serve the router until Ctrl+C or SIGTERM.
///
/// In-flight requests finish before this returns.
pub async fn start_server(config: &ServiceConfig, state: AppState) -> Result<(), ServiceError> {
    let address = format!("{}:{}", config.server.host, config.server.port);
    let addr: SocketAddr = address.parse().map_err(|e: std::net::AddrParseError| {
        ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        }
    })?;

    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::BindFailed {
                address: addr.to_string(),
                message: e.to_string(),
            })?;

    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?;

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C signal handler");
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
                error!(error = %e, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
