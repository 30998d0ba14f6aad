#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Identity and naming primitives shared by every other crate in the
//! workspace: the Gateway work-queue key, the derived Envoy node id, and the
//! bit-exact name formats for the xDS resources we emit.

use sha2::{Digest, Sha256};

/// The fixed controller name. GatewayClasses whose `controllerName` equals
/// this value are accepted; it is also the SSA field manager.
pub const CONTROLLER_NAME: &str = "sigs.k8s.io/wg-ai-gateway-envoy-controller";

/// Label stamped on every infra object this controller manages. A
/// pre-existing object without this label is never overwritten.
pub const MANAGED_GATEWAY_LABEL: &str = "aigateway.networking.k8s.io/managed";

/// Namespace where the control plane itself runs.
pub const SYSTEM_NAMESPACE: &str = "ai-gateway-system";

/// Name of the Service exposing the xDS server inside [`SYSTEM_NAMESPACE`].
pub const XDS_SERVICE_NAME: &str = "ai-gateway-controller";

pub const XDS_PORT: u16 = 15001;

/// File name of the Envoy bootstrap config inside the per-Gateway ConfigMap.
pub const ENVOY_BOOTSTRAP_FILE: &str = "envoy.yaml";

/// The managed-label value: the controller name with `/` replaced by `-` so
/// it is a valid label value.
pub fn managed_label_value() -> String {
    CONTROLLER_NAME.replace('/', "-")
}

/// Identifies one Gateway: the work-queue key, the snapshot-cache key (via
/// [`GatewayRef::node_id`]), and the name root of the owned infra objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

    /// Stable proxy identity: `envoy-proxy-` followed by the first 6 bytes of
    /// `sha256("ns/name")` in lowercase hex (12 characters).
    pub fn node_id(&self) -> String {
        let digest = Sha256::digest(format!("{}/{}", self.namespace, self.name).as_bytes());
        let mut id = String::with_capacity(12 + "envoy-proxy-".len());
        id.push_str("envoy-proxy-");
        for byte in &digest[..6] {
            id.push_str(&format!("{byte:02x}"));
        }
        id
    }
}

impl std::fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Envoy listener name for a Gateway port: `listener-<port>`.
pub fn listener_name(port: i32) -> String {
    format!("listener-{port}")
}

/// Inline route configuration name for a Gateway listener:
/// `listener_<name>_routes`.
pub fn route_config_name(listener: &str) -> String {
    format!("listener_{listener}_routes")
}

/// Envoy route name: `<route-ns>-<route-name>-rule<ri>-match<mi>`.
pub fn envoy_route_name(namespace: &str, name: &str, rule: usize, matched: usize) -> String {
    format!("{namespace}-{name}-rule{rule}-match{matched}")
}

/// Virtual host name: `<gateway>-vh-<port>-<domain>`.
pub fn virtual_host_name(gateway: &str, port: i32, domain: &str) -> String {
    format!("{gateway}-vh-{port}-{domain}")
}

/// Envoy cluster name: `<backend-ns>-<backend-name>`, with a `-<port>` suffix
/// when the port is not 80 or 443 (the tie-breaker for multi-port backends).
pub fn cluster_name(namespace: &str, name: &str, port: u16) -> String {
    if port == 80 || port == 443 {
        format!("{namespace}-{name}")
    } else {
        format!("{namespace}-{name}-{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_and_sized() {
        let gw = GatewayRef::new("default", "web");
        let id = gw.node_id();
        assert_eq!(id, gw.node_id());
        assert_eq!(id.len(), "envoy-proxy-".len() + 12);
        assert!(id.starts_with("envoy-proxy-"));
        assert!(id["envoy-proxy-".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn node_id_depends_on_both_parts() {
        assert_ne!(
            GatewayRef::new("a", "b").node_id(),
            GatewayRef::new("b", "a").node_id()
        );
        assert_ne!(
            GatewayRef::new("default", "web").node_id(),
            GatewayRef::new("default", "web2").node_id()
        );
    }

    #[test]
    fn cluster_names_suffix_nonstandard_ports() {
        assert_eq!(cluster_name("ns1", "api", 80), "ns1-api");
        assert_eq!(cluster_name("ns1", "api", 443), "ns1-api");
        assert_eq!(cluster_name("ns1", "api", 8080), "ns1-api-8080");
    }

    #[test]
    fn managed_label_value_is_label_safe() {
        assert_eq!(
            managed_label_value(),
            "sigs.k8s.io-wg-ai-gateway-envoy-controller"
        );
        assert!(!managed_label_value().contains('/'));
    }
}
