//! ualink API - HTTP and WebSocket host for the session runtime
//!
//! A thin edge over [`ualink_controller::Controller`] and [`ualink_hub::Hub`]:
//!
//! - `POST /api/v1/read`, `POST /api/v1/write`
//! - `GET /api/v1/export/tags`, `GET /api/v1/export/tags/folder` (JSON or CSV)
//! - `GET /api/v1/ws/clients`, `GET /health`
//! - `GET /ws/subscribe` for live data changes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ualink_api::{ServerBuilder, ServerConfig};
//! use ualink_cert::Provisioner;
//! use ualink_client::MemoryServer;
//! use ualink_controller::Controller;
//! use ualink_core::config::ClientConfig;
//! use ualink_hub::HubConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = Controller::new(
//!         ClientConfig::default(),
//!         Arc::new(MemoryServer::demo_plant()),
//!         Provisioner::default(),
//!     );
//!     let hub = controller.spawn_hub(HubConfig::default());
//!     let server = ServerBuilder::new(ServerConfig::default())
//!         .build(controller, hub)?;
//!
//!     server.run(ualink_api::shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```

pub mod export;
pub mod rest;
pub mod types;
pub mod websocket;

use anyhow::Context;
use rest::ApiState;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use ualink_controller::Controller;
use ualink_core::config::ApiConfig;
use ualink_hub::Hub;

// ============================================================================
// Server Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,

    /// Allow cross-origin requests from any origin
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            permissive_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn from_api_config(config: &ApiConfig) -> anyhow::Result<Self> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .with_context(|| format!("invalid API bind address {}:{}", config.bind_address, config.port))?;
        Ok(Self {
            bind_addr,
            ..Default::default()
        })
    }
}

// ============================================================================
// Server Builder
// ============================================================================

pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.config.bind_addr = bind_addr;
        self
    }

    /// Build the server
    pub fn build(self, controller: Arc<Controller>, hub: Hub) -> anyhow::Result<Server> {
        Ok(Server {
            config: self.config,
            state: ApiState::new(controller, hub),
        })
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct Server {
    config: ServerConfig,
    state: ApiState,
}

impl Server {
    pub fn state(&self) -> &ApiState {
        &self.state
    }

    /// All routes with the middleware stack applied.
    pub fn router(&self) -> axum::Router {
        let mut app = axum::Router::new()
            .merge(rest::create_rest_router(self.state.clone()))
            .merge(websocket::create_ws_router(self.state.clone()));

        app = app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
        if self.config.permissive_cors {
            app = app.layer(CorsLayer::permissive());
        }
        app
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "API server listening");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server failed")?;

        info!("API server shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Graceful Shutdown
// ============================================================================

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.permissive_cors);
    }

    #[test]
    fn test_from_api_config() {
        let api = ApiConfig {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 9090,
        };
        let config = ServerConfig::from_api_config(&api).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());

        let bad = ApiConfig {
            bind_address: "not an address".to_string(),
            ..api
        };
        assert!(ServerConfig::from_api_config(&bad).is_err());
    }
}
