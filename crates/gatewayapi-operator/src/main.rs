use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gatewayapi_operator::controllers::{httproute, ControllerContext};
use gatewayapi_operator::health::{run_health_server, HealthState};
use gatewayapi_operator::store::KubeStore;
use gatewayapi_operator::OperatorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("gatewayapi-operator starting");

    let config = OperatorConfig::from_env().context("Invalid operator configuration")?;
    info!(
        gateway_class = %config.gateway_class_name,
        default_cluster_issuer = %config.default_cluster_issuer,
        default_ipam_zone = %config.default_ipam_zone,
        field_manager = %config.field_manager,
        conflict_retry_attempts = config.conflict_retry.attempts(),
        "Loaded configuration"
    );

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let store = Arc::new(KubeStore::new(kube_client.clone()));
    let health_port = config.health_port;

    let ctx = Arc::new(ControllerContext::new(
        store.clone(),
        store.clone(),
        Arc::new(config),
    ));

    let health = Arc::new(HealthState::new(store));
    let health_server = tokio::spawn(run_health_server(health.clone(), health_port));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    info!("Starting HTTPRoute controller");

    let controller = async {
        health.set_controller_running(true);
        httproute::run(kube_client, ctx).await;
        health.set_controller_running(false);
    };

    select! {
        _ = controller => {
            // The controller drains and returns once it sees a shutdown signal
            info!("HTTPRoute controller stopped");
        }
        result = health_server => {
            match result {
                Ok(Ok(())) => bail!("Health server exited unexpectedly"),
                Ok(Err(e)) => return Err(e).context("Health server failed"),
                Err(e) => bail!("Health server task failed: {}", e),
            }
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
