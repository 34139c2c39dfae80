//! Kubelet probes
//!
//! `/healthz` answers as long as the process serves HTTP. `/readyz` reports
//! ready only while the HTTPRoute controller is running and the API server
//! answers a version request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::store::ApiHealth;

/// Why `/readyz` is failing, if it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    ControllerStopped,
    ApiNotReady,
    ApiUnreachable,
}

pub struct HealthState<C: ApiHealth> {
    controller_running: AtomicBool,
    api: Arc<C>,
}

impl<C: ApiHealth> HealthState<C> {
    pub fn new(api: Arc<C>) -> Self {
        Self {
            controller_running: AtomicBool::new(false),
            api,
        }
    }

    /// Record whether the HTTPRoute controller loop is being driven
    pub fn set_controller_running(&self, running: bool) {
        let was = self.controller_running.swap(running, Ordering::SeqCst);
        if was != running {
            info!(running, "HTTPRoute controller state changed");
        }
    }

    pub fn controller_running(&self) -> bool {
        self.controller_running.load(Ordering::SeqCst)
    }

    async fn readiness(&self) -> Readiness {
        if !self.controller_running() {
            return Readiness::ControllerStopped;
        }
        match self.api.check_readiness().await {
            Ok(true) => Readiness::Ready,
            Ok(false) => Readiness::ApiNotReady,
            Err(e) => {
                warn!(error = %e, "Kubernetes API server unreachable");
                Readiness::ApiUnreachable
            }
        }
    }
}

/// Serve the probes on loopback until the listener fails.
pub async fn run_health_server<C: ApiHealth + 'static>(
    state: Arc<HealthState<C>>,
    port: u16,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<C>))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port, "Probe server listening");

    axum::serve(listener, app).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz<C: ApiHealth + 'static>(State(state): State<Arc<HealthState<C>>>) -> StatusCode {
    match state.readiness().await {
        Readiness::Ready => StatusCode::OK,
        reason => {
            debug!(?reason, "Not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
