//! Issuer and zone policy for shared gateways
//!
//! A gateway records the issuer and zone it was created with. Every later
//! route must agree with both; disagreement is rejected, never merged.

use std::fmt;

use thiserror::Error;

use crate::config::gateway::{ISSUER_ANNOTATION, ZONE_ANNOTATION};
use crate::resources::Gateway;
use crate::route::GatewaySettings;

/// Gateway attribute a route can conflict on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attribute {
    ClusterIssuer,
    IpamZone,
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterIssuer => f.write_str("cluster issuer"),
            Self::IpamZone => f.write_str("IPAM zone"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Gateway {attribute} is {gateway_value:?} but route requests {route_value:?}")]
pub struct PolicyViolation {
    pub attribute: Attribute,
    pub gateway_value: String,
    pub route_value: String,
}

/// Issuer recorded on the gateway's annotations
pub fn recorded_issuer(gateway: &Gateway) -> Option<&str> {
    gateway
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ISSUER_ANNOTATION))
        .map(String::as_str)
}

/// Zone recorded in the gateway's infrastructure annotations
pub fn recorded_zone(gateway: &Gateway) -> Option<&str> {
    gateway
        .spec
        .infrastructure
        .as_ref()
        .and_then(|i| i.annotations.get(ZONE_ANNOTATION))
        .map(String::as_str)
}

/// Check a route's effective settings against an existing gateway.
///
/// The issuer is always enforced; a gateway without one reads as `""`.
/// The zone is only enforced once the gateway records one.
pub fn check(gateway: &Gateway, settings: &GatewaySettings) -> Result<(), PolicyViolation> {
    let issuer = recorded_issuer(gateway).unwrap_or_default();
    if issuer != settings.cluster_issuer {
        return Err(PolicyViolation {
            attribute: Attribute::ClusterIssuer,
            gateway_value: issuer.to_string(),
            route_value: settings.cluster_issuer.clone(),
        });
    }

    if let Some(zone) = recorded_zone(gateway) {
        if zone != settings.ipam_zone {
            return Err(PolicyViolation {
                attribute: Attribute::IpamZone,
                gateway_value: zone.to_string(),
                route_value: settings.ipam_zone.clone(),
            });
        }
    }

    Ok(())
}
