//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown future resolves. The
//! separation lets the binary wire up storage and the generation manager
//! between binding and serving, and report the bound port when the OS
//! assigns one.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::engine::generation::GenerationManager;

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, liveness_handler, purchase_handler, readiness_handler, reserve_handler,
    AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Manages the HTTP server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `POST /reserve` -- claim an item, returns the reservation code
    /// - `POST /purchase` -- confirm a reservation
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    #[must_use]
    pub fn build_router(&self, manager: Arc<GenerationManager>) -> Router {
        let state = AppState {
            manager,
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/reserve", post(reserve_handler))
            .route("/purchase", post(purchase_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future resolves, then drains.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining; new requests get 503
    /// 2. The current generation drains within its grace period
    /// 3. The store hard-flushes and health transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error on fatal I/O failure.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        manager: Arc<GenerationManager>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router(Arc::clone(&manager));
        let shutdown_ctrl = Arc::clone(&self.shutdown);
        let listener = self
            .listener
            .expect("start() must be called before serve()");

        shutdown_ctrl.set_ready();
        info!("serving HTTP connections");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        shutdown_ctrl.trigger_shutdown();
        manager.shutdown().await;
        shutdown_ctrl.set_stopped();
        info!("server stopped");
        Ok(())
    }
}
