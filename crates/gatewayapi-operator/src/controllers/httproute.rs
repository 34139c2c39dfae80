//! HTTPRoute controller
//!
//! Watches gateway.networking.k8s.io/v1 HTTPRoutes and keeps the shared
//! Gateways they reference in sync.
//!
//! Each event runs a small state machine against the latest copy of the
//! route:
//!
//! 1. Load the route; a vanished route ends the event.
//! 2. A deleting route holding our finalizer refreshes every gateway it was
//!    attached to and then releases the finalizer.
//! 3. Disabled and parent-less routes are ignored.
//! 4. If the route moved to another gateway, the old one is refreshed.
//! 5. The finalizer and bookkeeping annotations are ensured.
//! 6. The target gateway is created, validated and patched as needed.
//!
//! Only one reconciliation runs at a time within the process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{self, Action};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{annotations, FINALIZER};
use crate::gateway::{GatewaySync, SyncError, SyncOutcome};
use crate::resources::HTTPRoute;
use crate::route::{
    effective_parent, has_finalizer, is_deleting, GatewayRef, GatewaySettings, RouteSettings,
};
use crate::store::StoreError;
use crate::validate::PolicyViolation;

use super::retry::{compute_backoff, retry_on_conflict, ErrorKind, RetryError};
use super::ControllerContext;

/// Periodic resync for routes whose gateway is in sync
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("Gave up updating route after {attempts} conflicting attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SyncError> for ReconcileError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(e) => Self::Store(e),
            SyncError::Policy(e) => Self::Policy(e),
            SyncError::Serialization(e) => Self::Serialization(e),
        }
    }
}

impl From<RetryError> for ReconcileError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => {
                Self::RetriesExhausted { attempts, source }
            }
            RetryError::Store(e) => Self::Store(e),
        }
    }
}

/// How a reconciliation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    NotFound,
    Disabled,
    NoParentRef,
    Finalized,
    /// Finalizer was just added; the resulting update re-triggers the route
    FinalizerAdded,
    Synced(SyncOutcome),
}

/// Route as loaded at the start of the event
struct Loaded {
    route: HTTPRoute,
    settings: RouteSettings,
}

/// Enabled route with a resolved parent gateway
struct Attached {
    route: HTTPRoute,
    settings: RouteSettings,
    gateway: GatewayRef,
}

enum State {
    Load,
    CheckEnabled(Loaded),
    CheckParent(Loaded),
    Deleting(Loaded),
    CheckMigration(Attached),
    EnsureFinalizer(Attached),
    SyncAnnotations(Attached),
    ResolveSettings(Attached),
    EnsureGateway(Attached, GatewaySettings),
    Done(Outcome),
}

struct Reconciler<'a> {
    ctx: &'a ControllerContext,
    namespace: &'a str,
    name: &'a str,
}

impl<'a> Reconciler<'a> {
    fn sync(&self) -> GatewaySync<'_> {
        GatewaySync::new(
            self.ctx.routes.as_ref(),
            self.ctx.gateways.as_ref(),
            &self.ctx.config,
        )
    }

    async fn step(&self, state: State) -> Result<State, ReconcileError> {
        match state {
            State::Load => self.load().await,
            State::CheckEnabled(loaded) => Ok(self.check_enabled(loaded)),
            State::CheckParent(loaded) => Ok(self.check_parent(loaded)),
            State::Deleting(loaded) => self.finalize(loaded).await,
            State::CheckMigration(attached) => Ok(self.check_migration(attached).await),
            State::EnsureFinalizer(attached) => self.ensure_finalizer(attached).await,
            State::SyncAnnotations(attached) => self.sync_annotations(attached).await,
            State::ResolveSettings(attached) => Ok(self.resolve_settings(attached)),
            State::EnsureGateway(attached, settings) => {
                self.ensure_gateway(attached, settings).await
            }
            State::Done(outcome) => Ok(State::Done(outcome)),
        }
    }

    async fn load(&self) -> Result<State, ReconcileError> {
        match self.ctx.routes.get(self.namespace, self.name).await? {
            None => {
                debug!("HTTPRoute not found");
                Ok(State::Done(Outcome::NotFound))
            }
            Some(route) => {
                let settings = RouteSettings::from_route(&route);
                Ok(State::CheckEnabled(Loaded { route, settings }))
            }
        }
    }

    fn check_enabled(&self, loaded: Loaded) -> State {
        // A deleting route we still hold must be released even if it was
        // disabled or detached in the meantime
        if is_deleting(&loaded.route) && has_finalizer(&loaded.route) {
            return State::Deleting(loaded);
        }
        if !loaded.settings.enabled {
            debug!("HTTPRoute not enabled, skipping");
            return State::Done(Outcome::Disabled);
        }
        State::CheckParent(loaded)
    }

    fn check_parent(&self, loaded: Loaded) -> State {
        if is_deleting(&loaded.route) {
            return State::Deleting(loaded);
        }
        match effective_parent(&loaded.route) {
            None => {
                info!("HTTPRoute has no parent reference, skipping");
                State::Done(Outcome::NoParentRef)
            }
            Some(gateway) => State::CheckMigration(Attached {
                route: loaded.route,
                settings: loaded.settings,
                gateway,
            }),
        }
    }

    async fn finalize(&self, loaded: Loaded) -> Result<State, ReconcileError> {
        if !has_finalizer(&loaded.route) {
            debug!("Deleting HTTPRoute holds no finalizer of ours");
            return Ok(State::Done(Outcome::Finalized));
        }

        let mut targets: Vec<GatewayRef> = Vec::new();
        if let Some(raw) = loaded.settings.previous_gateway.as_deref() {
            match raw.parse() {
                Ok(previous) => targets.push(previous),
                Err(e) => warn!(error = %e, "Ignoring invalid previous gateway reference"),
            }
        }
        if let Some(current) = effective_parent(&loaded.route) {
            if !targets.contains(&current) {
                targets.push(current);
            }
        }

        let sync = self.sync();
        for target in &targets {
            let outcome = sync.refresh(target).await?;
            info!(gateway = %target, outcome = %outcome, "Refreshed gateway for deleted route");
        }

        self.remove_finalizer().await?;
        info!(gateways = targets.len(), "HTTPRoute finalized");
        Ok(State::Done(Outcome::Finalized))
    }

    async fn check_migration(&self, attached: Attached) -> State {
        let current = attached.gateway.to_string();
        match attached.settings.previous_gateway.as_deref() {
            Some(raw) if raw != current => match raw.parse::<GatewayRef>() {
                Ok(previous) => {
                    info!(from = %previous, to = %current, "HTTPRoute moved to another gateway");
                    match self.sync().refresh(&previous).await {
                        Ok(outcome) => {
                            info!(gateway = %previous, outcome = %outcome, "Refreshed previous gateway")
                        }
                        Err(e) => {
                            warn!(gateway = %previous, error = %e, "Failed to refresh previous gateway")
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring invalid previous gateway reference"),
            },
            _ => {}
        }
        State::EnsureFinalizer(attached)
    }

    async fn ensure_finalizer(&self, attached: Attached) -> Result<State, ReconcileError> {
        if has_finalizer(&attached.route) {
            return Ok(State::SyncAnnotations(attached));
        }
        self.add_finalizer().await?;
        info!("Added finalizer to HTTPRoute");
        Ok(State::Done(Outcome::FinalizerAdded))
    }

    async fn sync_annotations(&self, attached: Attached) -> Result<State, ReconcileError> {
        let current = attached.gateway.to_string();
        let up_to_date = attached.settings.reconciled
            && attached.settings.previous_gateway.as_deref() == Some(current.as_str());
        if up_to_date {
            return Ok(State::ResolveSettings(attached));
        }

        let patch = json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "annotations": BTreeMap::from([
                    (annotations::RECONCILED, "true"),
                    (annotations::PREVIOUS_GATEWAY, current.as_str()),
                ]),
            },
        });
        self.ctx
            .routes
            .apply(
                self.namespace,
                self.name,
                &patch,
                &self.ctx.config.field_manager,
            )
            .await?;
        debug!(gateway = %attached.gateway, "Updated HTTPRoute bookkeeping annotations");
        Ok(State::ResolveSettings(attached))
    }

    fn resolve_settings(&self, attached: Attached) -> State {
        let settings = attached.settings.effective(&self.ctx.config);
        debug!(
            cluster_issuer = %settings.cluster_issuer,
            ipam_zone = %settings.ipam_zone,
            "Resolved gateway settings"
        );
        State::EnsureGateway(attached, settings)
    }

    async fn ensure_gateway(
        &self,
        attached: Attached,
        settings: GatewaySettings,
    ) -> Result<State, ReconcileError> {
        let outcome = self.sync().ensure(&attached.gateway, &settings).await?;
        info!(gateway = %attached.gateway, outcome = %outcome, "Gateway synced");
        Ok(State::Done(Outcome::Synced(outcome)))
    }

    async fn add_finalizer(&self) -> Result<(), ReconcileError> {
        let routes = self.ctx.routes.as_ref();
        let (namespace, name) = (self.namespace, self.name);

        retry_on_conflict(self.ctx.config.conflict_retry, move || async move {
            let route = routes.get(namespace, name).await?.ok_or_else(|| StoreError::NotFound {
                kind: "HTTPRoute".to_string(),
                key: format!("{namespace}/{name}"),
            })?;
            if has_finalizer(&route) {
                return Ok(());
            }
            let mut finalizers = route.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            routes
                .merge(namespace, name, &finalizers_patch(&route, &finalizers))
                .await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(())
    }

    /// Remove our finalizer; a route that is already gone counts as done
    async fn remove_finalizer(&self) -> Result<(), ReconcileError> {
        let routes = self.ctx.routes.as_ref();
        let (namespace, name) = (self.namespace, self.name);

        retry_on_conflict(self.ctx.config.conflict_retry, move || async move {
            let Some(route) = routes.get(namespace, name).await? else {
                return Ok(());
            };
            if !has_finalizer(&route) {
                return Ok(());
            }
            let finalizers: Vec<String> = route
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != FINALIZER)
                .cloned()
                .collect();
            match routes
                .merge(namespace, name, &finalizers_patch(&route, &finalizers))
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }
}

/// Merge patch replacing the finalizer list, conditional on the read version
fn finalizers_patch(route: &HTTPRoute, finalizers: &[String]) -> serde_json::Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": route.metadata.resource_version,
        }
    })
}

/// Run the state machine for one route to completion.
///
/// Reconciliations are serialized process-wide.
pub async fn reconcile_route(
    ctx: &ControllerContext,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcileError> {
    let _serial = ctx.serial.lock().await;

    let reconciler = Reconciler {
        ctx,
        namespace,
        name,
    };
    let mut state = State::Load;
    loop {
        state = match state {
            State::Done(outcome) => return Ok(outcome),
            other => reconciler.step(other).await?,
        };
    }
}

#[instrument(
    skip(route, ctx),
    fields(
        name = %route.metadata.name.as_deref().unwrap_or("unknown"),
        namespace = %route.metadata.namespace.as_deref().unwrap_or("unknown")
    )
)]
async fn reconcile(
    route: Arc<HTTPRoute>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let namespace = route
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| ReconcileError::MissingField("metadata.namespace".to_string()))?;
    let name = route
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ReconcileError::MissingField("metadata.name".to_string()))?;

    let outcome = reconcile_route(&ctx, namespace, name).await?;

    ctx.retry_tracker.reset(&format!("{namespace}/{name}"));
    debug!(outcome = ?outcome, "HTTPRoute reconciliation complete");

    Ok(match outcome {
        Outcome::Synced(_) => Action::requeue(RESYNC_INTERVAL),
        _ => Action::await_change(),
    })
}

/// Classify error type for retry behavior
fn classify_error(error: &ReconcileError) -> ErrorKind {
    match error {
        ReconcileError::Store(_) => ErrorKind::Transient,
        ReconcileError::RetriesExhausted { .. } => ErrorKind::Transient,
        ReconcileError::Policy(_) => ErrorKind::Permanent,
        ReconcileError::MissingField(_) => ErrorKind::Permanent,
        ReconcileError::Serialization(_) => ErrorKind::Permanent,
    }
}

fn error_policy(route: Arc<HTTPRoute>, error: &ReconcileError, ctx: Arc<ControllerContext>) -> Action {
    let key = format!(
        "{}/{}",
        route.metadata.namespace.as_deref().unwrap_or_default(),
        route.name_any()
    );
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&key);

    warn!(
        route = %key,
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "HTTPRoute reconciliation failed"
    );

    compute_backoff(attempt, kind)
}

/// Start the HTTPRoute controller
pub async fn run(client: Client, ctx: Arc<ControllerContext>) {
    let routes: Api<HTTPRoute> = Api::all(client);

    Controller::new(routes, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = ?obj.namespace,
                        "HTTPRoute reconciled successfully"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "HTTPRoute controller error");
                }
            }
        })
        .await;
}
