//! Operator configuration and the annotation contract
//!
//! [`OperatorConfig`] is built once at startup and shared by reference with
//! every component. Annotation keys and the finalizer are fixed constants.

use std::time::Duration;

use thiserror::Error;

use crate::controllers::retry::ConflictRetry;

/// Annotations read from (and written to) HTTPRoutes
pub mod annotations {
    /// Opt-in annotation - must be "true" to process the route
    pub const ENABLED: &str = "gatewayapi-operator.vitistack.io/enabled";
    /// cert-manager cluster issuer requested by the route
    pub const CLUSTER_ISSUER: &str = "gatewayapi-operator.vitistack.io/cluster-issuer";
    /// IPAM zone requested by the route
    pub const IPAM_ZONE: &str = "ipam.vitistack.io/zone";
    /// Set once the operator has processed the route
    pub const RECONCILED: &str = "gatewayapi-operator.vitistack.io/reconciled";
    /// `namespace/name` of the gateway the route was last synced to
    pub const PREVIOUS_GATEWAY: &str = "gatewayapi-operator.vitistack.io/previous-gateway";
}

/// Keys recorded on managed Gateways
pub mod gateway {
    /// Top-level gateway annotation holding the cluster issuer
    pub const ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";
    /// Key inside `spec.infrastructure.annotations` holding the IPAM zone
    pub const ZONE_ANNOTATION: &str = "ipam.vitistack.io/zone";
}

/// Finalizer placed on every managed HTTPRoute
pub const FINALIZER: &str = "gatewayapi-operator.vitistack.io/finalizer";

pub const DEFAULT_GATEWAY_CLASS: &str = "eg";
pub const DEFAULT_CLUSTER_ISSUER: &str = "internpki";
pub const DEFAULT_IPAM_ZONE: &str = "hnet-private";
pub const DEFAULT_FIELD_MANAGER: &str = "gatewayapi-operator";
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;
const CONFLICT_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

/// Runtime configuration shared by all components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// GatewayClass used when creating gateways
    pub gateway_class_name: String,
    /// Issuer used when a route does not declare one
    pub default_cluster_issuer: String,
    /// Zone used when a route does not declare one
    pub default_ipam_zone: String,
    /// Field manager for server-side apply
    pub field_manager: String,
    /// Bound on read-modify-write loops against a single route
    pub conflict_retry: ConflictRetry,
    /// Port for the health probe server
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            gateway_class_name: DEFAULT_GATEWAY_CLASS.to_string(),
            default_cluster_issuer: DEFAULT_CLUSTER_ISSUER.to_string(),
            default_ipam_zone: DEFAULT_IPAM_ZONE.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            conflict_retry: ConflictRetry::new(DEFAULT_CONFLICT_ATTEMPTS, CONFLICT_PAUSE),
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `GATEWAY_CLASS_NAME` (default: `eg`)
    /// - `DEFAULT_CLUSTER_ISSUER` (default: `internpki`)
    /// - `DEFAULT_IPAM_ZONE` (default: `hnet-private`)
    /// - `FIELD_MANAGER` (default: `gatewayapi-operator`)
    /// - `CONFLICT_RETRY_ATTEMPTS` (default: 5, at least 1)
    /// - `HEALTH_PORT` (default: 8081)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = non_empty(&lookup, "GATEWAY_CLASS_NAME")? {
            config.gateway_class_name = v;
        }
        if let Some(v) = non_empty(&lookup, "DEFAULT_CLUSTER_ISSUER")? {
            config.default_cluster_issuer = v;
        }
        if let Some(v) = non_empty(&lookup, "DEFAULT_IPAM_ZONE")? {
            config.default_ipam_zone = v;
        }
        if let Some(v) = non_empty(&lookup, "FIELD_MANAGER")? {
            config.field_manager = v;
        }
        if let Some(raw) = lookup("CONFLICT_RETRY_ATTEMPTS") {
            let attempts = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or(ConfigError::InvalidValue {
                    var: "CONFLICT_RETRY_ATTEMPTS",
                    value: raw.clone(),
                })?;
            config.conflict_retry = ConflictRetry::new(attempts, CONFLICT_PAUSE);
        }
        if let Some(raw) = lookup("HEALTH_PORT") {
            config.health_port = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "HEALTH_PORT",
                value: raw.clone(),
            })?;
        }

        Ok(config)
    }
}

fn non_empty<F>(lookup: &F, var: &'static str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(var) {
        Some(v) if v.trim().is_empty() => Err(ConfigError::Empty { var }),
        Some(v) => Ok(Some(v.trim().to_string())),
        None => Ok(None),
    }
}
