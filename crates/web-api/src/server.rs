use crate::handlers;
use axum::{routing::get, Router};
use botfleet_controller::LeaderState;
use botfleet_coord::CoordStore;
use botfleet_gameserver::BreakerBoard;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub coord: Arc<dyn CoordStore>,
    pub leader_rx: watch::Receiver<LeaderState>,
    pub breakers: Arc<BreakerBoard>,
}

/// Ops listener: liveness, readiness, and a plaintext metrics scrape.
pub struct HealthServer {
    state: AppState,
}

impl HealthServer {
    #[must_use]
    pub fn new(
        coord: Arc<dyn CoordStore>,
        leader_rx: watch::Receiver<LeaderState>,
        breakers: Arc<BreakerBoard>,
    ) -> Self {
        Self {
            state: AppState {
                coord,
                leader_rx,
                breakers,
            },
        }
    }

    /// Builds the router with all ops routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/ready", get(handlers::ready))
            .route("/metrics", get(handlers::metrics))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until the cancellation token fires.
    ///
    /// # Errors
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(self, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Health listener on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;

        Ok(())
    }
}
