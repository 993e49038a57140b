//! Interpose Server - control panel HTTP API.
//!
//! The foreground control panel is a thin client of this API; it never touches
//! the rule table itself. Every mutating route goes through the shared
//! [`StateCoordinator`](interpose_core::StateCoordinator).
//!
//! ## Endpoints
//!
//! - `GET /api/state` - Current `{active, address, port}`
//! - `GET /api/settings` - Saved target
//! - `POST /api/start` - Enable redirection (`{address?, port?}`)
//! - `POST /api/stop` - Disable redirection
//! - `POST /api/toggle` - Quick toggle
//! - `GET /api/events` - State event stream (SSE)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use interpose_core::{CommandShell, MemorySettings, RuleController, StateCoordinator};
//! use interpose_server::{AppState, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let rules = RuleController::new(Arc::new(CommandShell::su()));
//!     let coordinator = StateCoordinator::start(rules, Arc::new(MemorySettings::new())).unwrap();
//!     let server = Server::new(ServerConfig::default(), AppState::new(coordinator)).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, ErrorResponse, Result};
pub use models::{SettingsResponse, StartRequest};
pub use state::AppState;

/// Default API port.
pub const DEFAULT_PORT: u16 = 48780;

/// Default API host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/state", get(handlers::get_state))
        .route("/api/settings", get(handlers::get_settings))
        .route("/api/start", post(handlers::start))
        .route("/api/stop", post(handlers::stop))
        .route("/api/toggle", post(handlers::toggle))
        .route("/api/events", get(handlers::events))
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves, then waits for open
    /// connections to finish.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<(), ServerError> {
        info!("Starting Interpose API server on {}", self.addr);
        let listener = bind(self.addr)?;

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("API server stopped");
        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Binds with SO_REUSEADDR so a restarted daemon can reclaim its port while
/// old sockets linger in TIME_WAIT.
fn bind(addr: SocketAddr) -> std::result::Result<tokio::net::TcpListener, ServerError> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let err = |e| ServerError::BindError(addr, e);

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(err)?;
    socket.set_reuse_address(true).map_err(err)?;
    socket.bind(&addr.into()).map_err(err)?;
    socket.listen(128).map_err(err)?;
    socket.set_nonblocking(true).map_err(err)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).map_err(err)
}
