use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backend describes an AI-aware upstream destination that HTTPRoutes may
/// reference through `backendRefs` with `kind: Backend`.
#[derive(Clone, Debug, kube::CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "aigateway.networking.k8s.io",
    version = "v0alpha0",
    kind = "Backend",
    status = "BackendStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// The destination to route traffic to.
    pub destination: BackendDestination,

    /// Optional extension processors applied to this backend. Opaque to the
    /// translator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<BackendExtension>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendDestination {
    #[serde(flatten)]
    pub target: BackendTarget,

    /// Ports exposed by the destination. When empty, a single HTTP port 80 is
    /// assumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<BackendPort>>,
}

/// Where the backend lives: a DNS name outside the cluster or a Kubernetes
/// Service inside it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type")]
pub enum BackendTarget {
    /// A fully qualified domain name outside the cluster. Hostnames must not
    /// be `cluster.local` domains or otherwise refer to in-cluster services.
    Fqdn { fqdn: FqdnBackend },

    /// A Kubernetes Service, resolved through EndpointSlices.
    KubernetesService { service: ServiceBackend },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FqdnBackend {
    /// Hostname of the backend service, e.g. `api.example.com`.
    pub hostname: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBackend {
    pub name: String,

    /// Defaults to the Backend's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendPort {
    pub number: u16,

    pub protocol: BackendProtocol,

    /// TLS configuration a client should use when talking to the backend on
    /// this port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<BackendTls>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_options: Option<BackendProtocolOptions>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BackendProtocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTP2")]
    Http2,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "MCP")]
    Mcp,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendTls {
    pub mode: BackendTlsMode,

    /// Server name indication presented to the upstream. Defaults to the
    /// backend hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    /// References to Secrets holding the CA bundle used to validate the
    /// backend's certificate. System CAs apply when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_refs: Option<Vec<BackendObjectReference>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_verify: Option<bool>,

    /// Client certificate for mutual TLS. Only used when mode is `Mutual`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_ref: Option<BackendObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_alt_names: Option<Vec<String>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BackendTlsMode {
    /// Do not configure TLS; the platform is assumed to handle it.
    #[default]
    None,
    /// TLS with server certificate verification.
    Simple,
    /// Mutual TLS.
    Mutual,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub name: String,

    /// Defaults to the Backend's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendProtocolOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpProtocolOptions>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpProtocolOptions {
    /// MCP protocol version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// URL path for MCP traffic. Default is `/mcp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl McpProtocolOptions {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/mcp")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// Per-controller status entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<BackendControllerStatus>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendControllerStatus {
    /// Controller name, e.g. `sigs.k8s.io/wg-ai-gateway-envoy-controller`.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>>,
}

/// Opaque extension hook; carried through the CRD but not interpreted by the
/// translator.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendExtension {
    pub name: String,

    #[serde(rename = "type")]
    pub extension_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_config: Option<serde_json::Value>,
}

impl Backend {
    /// The hostname for FQDN backends; `None` for in-cluster services.
    pub fn fqdn_hostname(&self) -> Option<&str> {
        match &self.spec.destination.target {
            BackendTarget::Fqdn { fqdn } => Some(fqdn.hostname.as_str()),
            BackendTarget::KubernetesService { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_roundtrips_tagged_union() {
        let json = serde_json::json!({
            "type": "Fqdn",
            "fqdn": { "hostname": "api.example.com" },
            "ports": [{ "number": 443, "protocol": "HTTP2" }],
        });
        let dst: BackendDestination = serde_json::from_value(json).unwrap();
        match &dst.target {
            BackendTarget::Fqdn { fqdn } => assert_eq!(fqdn.hostname, "api.example.com"),
            other => panic!("unexpected target: {other:?}"),
        }
        let ports = dst.ports.as_deref().unwrap();
        assert_eq!(ports[0].number, 443);
        assert_eq!(ports[0].protocol, BackendProtocol::Http2);
    }

    #[test]
    fn service_destination_parses() {
        let json = serde_json::json!({
            "type": "KubernetesService",
            "service": { "name": "whisper", "namespace": "ml" },
        });
        let dst: BackendDestination = serde_json::from_value(json).unwrap();
        match &dst.target {
            BackendTarget::KubernetesService { service } => {
                assert_eq!(service.name, "whisper");
                assert_eq!(service.namespace.as_deref(), Some("ml"));
            }
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn mcp_path_defaults() {
        let opts = McpProtocolOptions {
            version: None,
            path: None,
        };
        assert_eq!(opts.path(), "/mcp");
    }
}
