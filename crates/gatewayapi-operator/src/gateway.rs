//! Gateway lifecycle: create, patch listeners, delete
//!
//! [`GatewaySync`] owns the decision for one gateway per call. The listener
//! set is always recomputed from all routes, so concurrent events for the
//! same gateway converge on the same result.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::aggregate::collect_listeners;
use crate::config::gateway::{ISSUER_ANNOTATION, ZONE_ANNOTATION};
use crate::config::OperatorConfig;
use crate::resources::{Gateway, GatewayInfrastructure, GatewaySpec, HTTPRoute, Listener};
use crate::route::{GatewayRef, GatewaySettings};
use crate::store::{ResourceStore, StoreError};
use crate::validate::{self, PolicyViolation};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("Failed to encode gateway patch: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a sync did to the gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Patched,
    Unchanged,
    Deleted,
    /// Gateway does not exist and none was created
    Absent,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Patched => "patched",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::Absent => "absent",
        };
        f.write_str(s)
    }
}

/// Build a new gateway carrying the issuer and zone it will be held to
pub fn new_gateway(
    target: &GatewayRef,
    settings: &GatewaySettings,
    gateway_class_name: &str,
    listeners: Vec<Listener>,
) -> Gateway {
    let mut gateway = Gateway::new(
        &target.name,
        GatewaySpec {
            gateway_class_name: gateway_class_name.to_string(),
            listeners,
            infrastructure: Some(GatewayInfrastructure {
                annotations: BTreeMap::from([(
                    ZONE_ANNOTATION.to_string(),
                    settings.ipam_zone.clone(),
                )]),
            }),
        },
    );
    gateway.metadata.namespace = Some(target.namespace.clone());
    gateway.metadata.annotations = Some(BTreeMap::from([(
        ISSUER_ANNOTATION.to_string(),
        settings.cluster_issuer.clone(),
    )]));
    gateway
}

/// Merge patch replacing the whole listener list, conditional on the read
/// version. Other fields, including the class name and recorded settings,
/// are left to whoever owns them.
fn listeners_patch(
    existing: &Gateway,
    listeners: &[Listener],
) -> Result<serde_json::Value, serde_json::Error> {
    Ok(json!({
        "metadata": {
            "resourceVersion": existing.metadata.resource_version,
        },
        "spec": {
            "listeners": serde_json::to_value(listeners)?,
        },
    }))
}

/// Order-insensitive listener set comparison
fn listeners_equal(current: &[Listener], desired: &[Listener]) -> bool {
    current.len() == desired.len()
        && desired.iter().all(|l| current.contains(l))
        && current.iter().all(|l| desired.contains(l))
}

/// Synchronizes gateways with the routes that reference them
pub struct GatewaySync<'a> {
    routes: &'a dyn ResourceStore<HTTPRoute>,
    gateways: &'a dyn ResourceStore<Gateway>,
    config: &'a OperatorConfig,
}

impl<'a> GatewaySync<'a> {
    pub fn new(
        routes: &'a dyn ResourceStore<HTTPRoute>,
        gateways: &'a dyn ResourceStore<Gateway>,
        config: &'a OperatorConfig,
    ) -> Self {
        Self {
            routes,
            gateways,
            config,
        }
    }

    /// Bring `target` in line for a route that wants `settings`.
    ///
    /// Creates the gateway when absent. An existing gateway is validated
    /// against `settings` before any write.
    #[instrument(skip_all, fields(gateway = %target))]
    pub async fn ensure(
        &self,
        target: &GatewayRef,
        settings: &GatewaySettings,
    ) -> Result<SyncOutcome, SyncError> {
        match self.gateways.get(&target.namespace, &target.name).await? {
            None => self.create(target, settings).await,
            Some(existing) => {
                validate::check(&existing, settings)?;
                self.sync_existing(target, &existing).await
            }
        }
    }

    /// Recompute `target` after a route left it. Absent gateways are left alone.
    #[instrument(skip_all, fields(gateway = %target))]
    pub async fn refresh(&self, target: &GatewayRef) -> Result<SyncOutcome, SyncError> {
        match self.gateways.get(&target.namespace, &target.name).await? {
            None => {
                debug!("Gateway absent, nothing to refresh");
                Ok(SyncOutcome::Absent)
            }
            Some(existing) => self.sync_existing(target, &existing).await,
        }
    }

    async fn create(
        &self,
        target: &GatewayRef,
        settings: &GatewaySettings,
    ) -> Result<SyncOutcome, SyncError> {
        let aggregation = collect_listeners(self.routes, target).await?;
        if aggregation.is_empty() {
            info!("No hostnames for gateway, not creating it");
            return Ok(SyncOutcome::Absent);
        }

        let listeners = aggregation.listeners.len();
        let gateway = new_gateway(
            target,
            settings,
            &self.config.gateway_class_name,
            aggregation.listeners,
        );
        self.gateways.create(&gateway).await?;

        info!(
            listeners,
            cluster_issuer = %settings.cluster_issuer,
            ipam_zone = %settings.ipam_zone,
            gateway_class = %self.config.gateway_class_name,
            "Created gateway"
        );
        Ok(SyncOutcome::Created)
    }

    async fn sync_existing(
        &self,
        target: &GatewayRef,
        existing: &Gateway,
    ) -> Result<SyncOutcome, SyncError> {
        let aggregation = collect_listeners(self.routes, target).await?;

        if aggregation.is_empty() {
            let resource_version = existing.metadata.resource_version.as_deref();
            return match self
                .gateways
                .delete(&target.namespace, &target.name, resource_version)
                .await
            {
                Ok(()) => {
                    info!("Deleted gateway with no remaining routes");
                    Ok(SyncOutcome::Deleted)
                }
                Err(e) if e.is_not_found() => {
                    debug!("Gateway already gone");
                    Ok(SyncOutcome::Absent)
                }
                Err(e) => Err(e.into()),
            };
        }

        if listeners_equal(&existing.spec.listeners, &aggregation.listeners) {
            debug!(
                listeners = aggregation.listeners.len(),
                "Gateway listeners up to date"
            );
            return Ok(SyncOutcome::Unchanged);
        }

        let patch = listeners_patch(existing, &aggregation.listeners)?;
        self.gateways
            .merge(&target.namespace, &target.name, &patch)
            .await?;

        info!(
            previous = existing.spec.listeners.len(),
            listeners = aggregation.listeners.len(),
            "Patched gateway listeners"
        );
        Ok(SyncOutcome::Patched)
    }
}
