use super::render::*;
use super::*;
use ai_gateway_controller_k8s_api::gateway::Gateway;

fn mk_gateway() -> (Gateway, GatewayRef) {
    let gateway: Gateway = serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": "web",
            "namespace": "default",
            "uid": "1234-5678",
        },
        "spec": {
            "gatewayClassName": "ai-gateway",
            "listeners": [
                { "name": "http", "port": 80, "protocol": "HTTP" },
                { "name": "https", "port": 443, "protocol": "HTTPS" },
                { "name": "http-alt", "port": 80, "protocol": "HTTP" },
            ],
        },
    }))
    .unwrap();
    (gateway, GatewayRef::new("default", "web"))
}

#[test]
fn renders_four_manifests_named_by_node_id() {
    let (gateway, gateway_ref) = mk_gateway();
    let node_id = gateway_ref.node_id();

    let manifests =
        render_gateway_manifests(&node_id, &gateway_ref, &gateway, "envoyproxy/envoy:v1.37-latest")
            .unwrap();
    assert_eq!(manifests.len(), 4);

    let mut kinds = Vec::new();
    for manifest in &manifests {
        let value: serde_json::Value = serde_yaml::from_str(manifest).unwrap();
        kinds.push(value["kind"].as_str().unwrap().to_string());
        assert_eq!(value["metadata"]["name"].as_str(), Some(node_id.as_str()));
        assert_eq!(value["metadata"]["namespace"].as_str(), Some("default"));
    }
    kinds.sort();
    assert_eq!(kinds, ["ConfigMap", "Deployment", "Service", "ServiceAccount"]);
}

#[test]
fn configmap_embeds_bootstrap_with_node_id() {
    let (gateway, gateway_ref) = mk_gateway();
    let node_id = gateway_ref.node_id();

    let manifests =
        render_gateway_manifests(&node_id, &gateway_ref, &gateway, "img").unwrap();
    let configmap = manifests
        .iter()
        .find(|m| m.contains("kind: ConfigMap"))
        .unwrap();
    let value: serde_json::Value = serde_yaml::from_str(configmap).unwrap();
    let bootstrap = value["data"]["envoy.yaml"].as_str().unwrap();
    assert!(bootstrap.contains(&format!("id: {node_id}")));
    assert!(bootstrap.contains("ai-gateway-controller.ai-gateway-system.svc.cluster.local"));
    assert!(bootstrap.contains("port_value: 15001"));

    // The embedded bootstrap must itself be valid YAML.
    let parsed: serde_json::Value = serde_yaml::from_str(bootstrap).unwrap();
    assert_eq!(parsed["node"]["id"].as_str(), Some(node_id.as_str()));
}

#[test]
fn service_ports_are_unique_per_port() {
    let (gateway, _) = mk_gateway();
    let ports = extract_service_ports(&gateway);
    assert_eq!(ports.len(), 2);
    assert_eq!(ports[0].name, "http");
    assert_eq!(ports[0].port, 80);
    assert_eq!(ports[0].app_protocol, "http");
    assert_eq!(ports[1].name, "https");
    assert_eq!(ports[1].port, 443);
}

#[test]
fn listener_names_are_sanitized_for_ports() {
    let gateway: Gateway = serde_json::from_value(serde_json::json!({
        "metadata": { "name": "web", "namespace": "default" },
        "spec": {
            "gatewayClassName": "ai-gateway",
            "listeners": [
                { "name": "web.example.com", "port": 80, "protocol": "HTTP" },
            ],
        },
    }))
    .unwrap();
    let ports = extract_service_ports(&gateway);
    assert_eq!(ports[0].name, "web-example-com");
}

#[test]
fn split_documents_drops_empty_parts() {
    let docs = split_yaml_documents("---\na: 1\n---\n\n---\nb: 2\n");
    assert_eq!(docs, vec!["a: 1".to_string(), "b: 2".to_string()]);
}

#[test]
fn prepare_manifest_injects_managed_label_and_resolves_gvr() {
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: envoy-proxy-abc\n  namespace: default\ndata:\n  k: v\n";
    let (object, resource) = prepare_manifest(manifest).unwrap();
    assert_eq!(resource.kind, "ConfigMap");
    assert_eq!(resource.plural, "configmaps");
    assert_eq!(
        object.labels().get(MANAGED_GATEWAY_LABEL).map(String::as_str),
        Some("sigs.k8s.io-wg-ai-gateway-envoy-controller")
    );
}

#[test]
fn prepare_manifest_fails_closed_on_unknown_kinds() {
    let manifest = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: x\n  namespace: default\n";
    assert!(prepare_manifest(manifest).is_err());
}

#[test]
fn never_manages_unlabeled_objects() {
    // A pre-existing object without the managed label is skipped entirely.
    let (manageable, _) = can_manage(&InfraLookup::Found {
        managed: false,
        resource_version: Some("7".to_string()),
    });
    assert!(!manageable);

    let (manageable, version) = can_manage(&InfraLookup::Found {
        managed: true,
        resource_version: Some("7".to_string()),
    });
    assert!(manageable);
    assert_eq!(version.as_deref(), Some("7"));

    assert_eq!(can_manage(&InfraLookup::Missing), (true, None));
    assert_eq!(can_manage(&InfraLookup::UnknownKind), (true, None));
}
