//! HTTPS listener construction

use crate::resources::{
    AllowedRoutes, FromNamespaces, GatewayTlsConfig, Listener, RouteNamespaces,
    SecretObjectReference, TlsMode,
};

pub const HTTPS_PORT: i32 = 443;
pub const HTTPS_PROTOCOL: &str = "HTTPS";

const CERTIFICATE_SUFFIX: &str = "-tls";

/// Name of the secret holding the certificate for `hostname`
pub fn certificate_secret_name(hostname: &str) -> String {
    format!("{hostname}{CERTIFICATE_SUFFIX}")
}

/// Build the terminating HTTPS listener for one hostname.
///
/// The certificate secret lives in the gateway's namespace. Callers filter
/// out empty hostnames.
pub fn https_listener(hostname: &str, gateway_namespace: &str) -> Listener {
    Listener {
        name: hostname.to_string(),
        hostname: Some(hostname.to_string()),
        port: HTTPS_PORT,
        protocol: HTTPS_PROTOCOL.to_string(),
        tls: Some(GatewayTlsConfig {
            mode: Some(TlsMode::Terminate),
            certificate_refs: vec![SecretObjectReference {
                group: Some(String::new()),
                kind: Some("Secret".to_string()),
                name: certificate_secret_name(hostname),
                namespace: Some(gateway_namespace.to_string()),
            }],
        }),
        allowed_routes: Some(AllowedRoutes {
            namespaces: Some(RouteNamespaces {
                from: Some(FromNamespaces::All),
            }),
        }),
    }
}
