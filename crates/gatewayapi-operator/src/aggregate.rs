//! Route-to-gateway hostname aggregation
//!
//! A gateway's desired listener set is recomputed from scratch on every sync:
//! the union of hostnames of all enabled, non-deleting routes whose first
//! parent reference names the gateway.

use std::collections::BTreeSet;

use tracing::info;

use crate::listener::https_listener;
use crate::resources::{HTTPRoute, Listener};
use crate::route::{effective_parent, is_deleting, GatewayRef, RouteSettings};
use crate::store::{ResourceStore, StoreError};

/// Result of aggregating routes for one gateway
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Aggregation {
    /// Listeners ordered by hostname
    pub listeners: Vec<Listener>,
    /// Routes attached to the gateway
    pub matched: usize,
    /// Routes ignored because they are deleting or disabled
    pub skipped: usize,
    /// Routes inspected
    pub total: usize,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Aggregate `routes` into the listener set for `target`.
pub fn aggregate(routes: &[HTTPRoute], target: &GatewayRef) -> Aggregation {
    let mut hostnames = BTreeSet::new();
    let mut matched = 0;
    let mut skipped = 0;

    for route in routes {
        if is_deleting(route) || !RouteSettings::from_route(route).enabled {
            skipped += 1;
            continue;
        }
        if effective_parent(route).as_ref() != Some(target) {
            continue;
        }

        matched += 1;
        hostnames.extend(
            route
                .spec
                .hostnames
                .iter()
                .filter(|h| !h.is_empty())
                .map(String::as_str),
        );
    }

    Aggregation {
        listeners: hostnames
            .into_iter()
            .map(|h| https_listener(h, &target.namespace))
            .collect(),
        matched,
        skipped,
        total: routes.len(),
    }
}

/// List all routes from the store and aggregate them for `target`.
pub async fn collect_listeners(
    routes: &dyn ResourceStore<HTTPRoute>,
    target: &GatewayRef,
) -> Result<Aggregation, StoreError> {
    let all = routes.list().await?;
    let aggregation = aggregate(&all, target);

    info!(
        gateway = %target,
        listeners = aggregation.listeners.len(),
        matched = aggregation.matched,
        skipped = aggregation.skipped,
        total = aggregation.total,
        "Aggregated routes for gateway"
    );

    Ok(aggregation)
}
