//! Typed view of an HTTPRoute's operator settings
//!
//! Raw annotations are converted once per reconciliation into
//! [`RouteSettings`]; defaults are applied when resolving
//! [`GatewaySettings`] so the rest of the core never touches string maps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::config::{annotations, OperatorConfig, FINALIZER};
use crate::resources::HTTPRoute;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayRefError {
    #[error("Invalid gateway reference {0:?}, expected namespace/name")]
    InvalidFormat(String),
}

/// Namespaced identity of a Gateway
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GatewayRef {
    pub namespace: String,
    pub name: String,
}

impl GatewayRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for GatewayRef {
    type Err = GatewayRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(GatewayRefError::InvalidFormat(s.to_string())),
        }
    }
}

/// Issuer and zone a gateway must carry for a route
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewaySettings {
    pub cluster_issuer: String,
    pub ipam_zone: String,
}

/// Operator-relevant annotations of a route
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteSettings {
    pub enabled: bool,
    /// Issuer declared on the route, if any
    pub cluster_issuer: Option<String>,
    /// Zone declared on the route, if any
    pub ipam_zone: Option<String>,
    pub reconciled: bool,
    /// Raw previous-gateway annotation; parsed lazily since it may be malformed
    pub previous_gateway: Option<String>,
}

impl RouteSettings {
    pub fn from_annotations(annots: &BTreeMap<String, String>) -> Self {
        let declared = |key: &str| {
            annots
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        Self {
            enabled: annots
                .get(annotations::ENABLED)
                .map(|v| v == "true")
                .unwrap_or(false),
            cluster_issuer: declared(annotations::CLUSTER_ISSUER),
            ipam_zone: declared(annotations::IPAM_ZONE),
            reconciled: annots.contains_key(annotations::RECONCILED),
            previous_gateway: declared(annotations::PREVIOUS_GATEWAY),
        }
    }

    pub fn from_route(route: &HTTPRoute) -> Self {
        route
            .metadata
            .annotations
            .as_ref()
            .map(Self::from_annotations)
            .unwrap_or_default()
    }

    /// Declared issuer/zone, falling back to the configured defaults
    pub fn effective(&self, config: &OperatorConfig) -> GatewaySettings {
        GatewaySettings {
            cluster_issuer: self
                .cluster_issuer
                .clone()
                .unwrap_or_else(|| config.default_cluster_issuer.clone()),
            ipam_zone: self
                .ipam_zone
                .clone()
                .unwrap_or_else(|| config.default_ipam_zone.clone()),
        }
    }
}

pub fn is_deleting(route: &HTTPRoute) -> bool {
    route.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(route: &HTTPRoute) -> bool {
    route
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|s| s == FINALIZER))
        .unwrap_or(false)
}

/// Gateway named by the route's first parent reference.
///
/// The parent namespace defaults to the route's own namespace.
pub fn effective_parent(route: &HTTPRoute) -> Option<GatewayRef> {
    let parent = route.spec.parent_refs.first()?;
    let namespace = parent
        .namespace
        .clone()
        .or_else(|| route.metadata.namespace.clone())
        .unwrap_or_default();
    Some(GatewayRef::new(namespace, parent.name.clone()))
}
