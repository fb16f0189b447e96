//! Optional HTTP status surface built on Actix Web.
//!
//! Operators and the host application read supervisor state through this
//! surface; it never holds state of its own. Start and stop requests are
//! forwarded to the runtime the server was started from, so processes and
//! their output tasks outlive the Actix worker that received the request.
//!
//! # Examples
//!
//! ```no_run
//! use mcp_supervisor::McpSupervisor;
//! use mcp_supervisor::api::ApiServer;
//! use mcp_supervisor::config::ApiConfig;
//!
//! # async fn example() -> mcp_supervisor::Result<()> {
//! let supervisor = McpSupervisor::from_config_file("config/mcp_servers.yaml")?;
//! let api = ApiServer::start(&ApiConfig::default(), supervisor)?;
//! println!("Status at http://{}/api/v1/mcp/status", api.local_addr());
//!
//! // ...
//!
//! api.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod actix_error;
pub mod handlers;

use crate::McpSupervisor;
use crate::config::{ApiConfig, DEFAULT_WORKERS};
use crate::error::{Error, Result};
use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer, middleware, web};
use std::future::Future;
use std::net::SocketAddr;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    supervisor: McpSupervisor,
    runtime: Handle,
}

impl ApiState {
    /// State bound to the current tokio runtime
    ///
    /// Must be called from within a runtime.
    pub fn new(supervisor: McpSupervisor) -> Self {
        Self {
            supervisor,
            runtime: Handle::current(),
        }
    }

    /// The supervisor behind the surface
    pub fn supervisor(&self) -> &McpSupervisor {
        &self.supervisor
    }

    /// Runs a supervisor operation on the owning runtime.
    ///
    /// The operation completes even if the HTTP client goes away.
    pub async fn run<F>(&self, operation: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime
            .spawn(operation)
            .await
            .map_err(|e| Error::Other(format!("Supervisor task failed: {}", e)))?
    }
}

/// Registers the status routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/mcp/status", web::get().to(handlers::get_status))
        .route(
            "/api/v1/mcp/servers/{name}/start",
            web::post().to(handlers::start_server),
        )
        .route(
            "/api/v1/mcp/servers/{name}/stop",
            web::post().to(handlers::stop_server),
        );
}

/// HTTP status server
pub struct ApiServer;

impl ApiServer {
    /// Bind and start serving in the background
    ///
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(skip(config, supervisor), fields(address = %config.address, port = config.port))]
    pub fn start(config: &ApiConfig, supervisor: McpSupervisor) -> Result<ApiServerHandle> {
        let state = web::Data::new(ApiState::new(supervisor));

        let mut server_builder = HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .wrap(middleware::Logger::default())
                .wrap(cors)
                .app_data(state.clone())
                .configure(configure)
        });

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        tracing::info!(workers = workers, "Setting number of Actix Web workers");
        server_builder = server_builder.workers(workers);

        let server_builder = server_builder
            .bind((config.address.as_str(), config.port))
            .map_err(|e| Error::Other(format!("Failed to bind status server: {}", e)))?;
        let local_addr = server_builder
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| Error::Other("Status server bound to no address".to_string()))?;

        let server = server_builder.run();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Status server error");
            }
            tracing::info!("Status server shut down");
        });

        tracing::info!(address = %local_addr, "Status server started");
        Ok(ApiServerHandle {
            handle,
            task,
            local_addr,
        })
    }
}

/// Handle to a running status server
pub struct ApiServerHandle {
    handle: ServerHandle,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ApiServerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the server to finish
    pub async fn shutdown(self) {
        tracing::info!("Stopping status server");
        self.handle.stop(true).await;
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Status server task error");
        }
    }
}
