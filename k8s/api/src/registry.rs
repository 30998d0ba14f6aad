//! Fail-closed map from Group/Version/Kind to the `ApiResource` (carrying the
//! GVR plural) for every kind this controller reads or writes. Callers must
//! refuse to act on kinds the registry does not know.

use kube::core::ApiResource;

/// One registry row.
struct Entry {
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    plural: &'static str,
}

const ENTRIES: &[Entry] = &[
    // Core resources
    Entry {
        group: "",
        version: "v1",
        kind: "Service",
        plural: "services",
    },
    Entry {
        group: "",
        version: "v1",
        kind: "ConfigMap",
        plural: "configmaps",
    },
    Entry {
        group: "",
        version: "v1",
        kind: "Secret",
        plural: "secrets",
    },
    Entry {
        group: "",
        version: "v1",
        kind: "ServiceAccount",
        plural: "serviceaccounts",
    },
    Entry {
        group: "",
        version: "v1",
        kind: "Namespace",
        plural: "namespaces",
    },
    // Apps
    Entry {
        group: "apps",
        version: "v1",
        kind: "Deployment",
        plural: "deployments",
    },
    // Discovery
    Entry {
        group: "discovery.k8s.io",
        version: "v1",
        kind: "EndpointSlice",
        plural: "endpointslices",
    },
    // Gateway API
    Entry {
        group: "gateway.networking.k8s.io",
        version: "v1",
        kind: "GatewayClass",
        plural: "gatewayclasses",
    },
    Entry {
        group: "gateway.networking.k8s.io",
        version: "v1",
        kind: "Gateway",
        plural: "gateways",
    },
    Entry {
        group: "gateway.networking.k8s.io",
        version: "v1",
        kind: "HTTPRoute",
        plural: "httproutes",
    },
    // AI gateway resources
    Entry {
        group: "aigateway.networking.k8s.io",
        version: "v0alpha0",
        kind: "Backend",
        plural: "backends",
    },
];

/// Resolves `(group, version, kind)` to an [`ApiResource`]. Returns `None`
/// for unknown kinds.
pub fn to_api_resource(group: &str, version: &str, kind: &str) -> Option<ApiResource> {
    ENTRIES
        .iter()
        .find(|e| e.group == group && e.version == version && e.kind == kind)
        .map(|e| ApiResource {
            group: e.group.to_string(),
            version: e.version.to_string(),
            api_version: if e.group.is_empty() {
                e.version.to_string()
            } else {
                format!("{}/{}", e.group, e.version)
            },
            kind: e.kind.to_string(),
            plural: e.plural.to_string(),
        })
}

/// Resolves an `apiVersion` string (`group/version` or bare `version`) plus a
/// kind, as found on rendered manifests.
pub fn from_api_version(api_version: &str, kind: &str) -> Option<ApiResource> {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    to_api_resource(group, version, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_kinds() {
        let ar = to_api_resource("apps", "v1", "Deployment").unwrap();
        assert_eq!(ar.plural, "deployments");
        assert_eq!(ar.api_version, "apps/v1");

        let ar = to_api_resource("", "v1", "Service").unwrap();
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "services");

        let ar = from_api_version("gateway.networking.k8s.io/v1", "HTTPRoute").unwrap();
        assert_eq!(ar.plural, "httproutes");

        let ar = from_api_version("v1", "ConfigMap").unwrap();
        assert_eq!(ar.plural, "configmaps");
    }

    #[test]
    fn fails_closed_on_unknown_kinds() {
        assert!(to_api_resource("apps", "v1", "DaemonSet").is_none());
        assert!(to_api_resource("", "v1", "Pod").is_none());
        assert!(from_api_version("example.com/v1", "Widget").is_none());
    }
}
