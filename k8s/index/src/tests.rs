use super::*;
use ai_gateway_controller_k8s_api::gateway::HTTPRoute;
use kubert::index::IndexNamespacedResource;
use tokio::sync::mpsc;

fn mk_index() -> (
    SharedIndex,
    mpsc::UnboundedReceiver<GatewayRef>,
    mpsc::UnboundedReceiver<Update>,
) {
    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    (Index::shared(keys_tx, status_tx), keys_rx, status_rx)
}

fn mk_gateway_class(name: &str, controller: &str) -> GatewayClass {
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "generation": 1 },
        "spec": { "controllerName": controller },
    }))
    .expect("valid GatewayClass")
}

fn mk_gateway(namespace: &str, name: &str, class: &str) -> Gateway {
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "gatewayClassName": class,
            "listeners": [
                { "name": "web", "port": 80, "protocol": "HTTP" },
            ],
        },
    }))
    .expect("valid Gateway")
}

fn mk_route(namespace: &str, name: &str, parents: &[(&str, Option<&str>)]) -> HTTPRoute {
    let parent_refs = parents
        .iter()
        .map(|(parent, ns)| {
            let mut parent_ref = serde_json::json!({ "name": parent });
            if let Some(ns) = ns {
                parent_ref["namespace"] = serde_json::json!(ns);
            }
            parent_ref
        })
        .collect::<Vec<_>>();
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": namespace },
        "spec": { "parentRefs": parent_refs, "rules": [] },
    }))
    .expect("valid HTTPRoute")
}

#[test]
fn matching_gateway_class_is_accepted_and_patched() {
    let (index, mut keys, mut status) = mk_index();

    index
        .write()
        .apply_gateway_class(mk_gateway_class("ai-gateway", CONTROLLER_NAME));

    assert!(index.read().is_accepted_class("ai-gateway"));
    match status.try_recv() {
        Ok(Update::GatewayClass { name, status }) => {
            assert_eq!(name, "ai-gateway");
            let conditions = status.conditions.unwrap();
            assert_eq!(conditions[0].type_, "Accepted");
            assert_eq!(conditions[0].status, "True");
        }
        other => panic!("expected a GatewayClass update, got {other:?}"),
    }
    // No Gateway of this class is known yet, so there is nothing to enqueue.
    assert!(keys.try_recv().is_err());
}

#[test]
fn accepting_a_class_enqueues_its_gateways() {
    let (index, mut keys, _status) = mk_index();

    // The Gateway arrives before its class is accepted and is not enqueued.
    index.write().apply_gateway(mk_gateway("default", "web", "ai-gateway"));
    index.write().apply_gateway(mk_gateway("default", "other", "nginx"));
    assert!(keys.try_recv().is_err());

    index
        .write()
        .apply_gateway_class(mk_gateway_class("ai-gateway", CONTROLLER_NAME));

    // Acceptance re-dispatches the class's Gateways, and only those.
    assert_eq!(keys.try_recv().unwrap(), GatewayRef::new("default", "web"));
    assert!(keys.try_recv().is_err());
}

#[test]
fn foreign_gateway_class_is_ignored() {
    let (index, mut keys, mut status) = mk_index();

    index
        .write()
        .apply_gateway_class(mk_gateway_class("other", "example.com/other-controller"));

    assert!(!index.read().is_accepted_class("other"));
    assert!(status.try_recv().is_err());
    assert!(keys.try_recv().is_err());
}

#[test]
fn gateway_enqueued_only_for_accepted_class() {
    let (index, mut keys, _status) = mk_index();

    index
        .write()
        .apply_gateway_class(mk_gateway_class("ai-gateway", CONTROLLER_NAME));
    index.write().apply_gateway(mk_gateway("default", "web", "ai-gateway"));
    assert_eq!(keys.try_recv().unwrap(), GatewayRef::new("default", "web"));

    index.write().apply_gateway(mk_gateway("default", "other", "nginx"));
    assert!(keys.try_recv().is_err());
}

#[test]
fn gateway_delete_always_enqueues() {
    let (index, mut keys, _status) = mk_index();

    index.write().apply_gateway(mk_gateway("default", "web", "nginx"));
    assert!(keys.try_recv().is_err());

    index
        .write()
        .delete_gateway("default".to_string(), "web".to_string());
    assert_eq!(keys.try_recv().unwrap(), GatewayRef::new("default", "web"));
    assert!(index.read().gateway("default", "web").is_none());
}

#[test]
fn route_events_enqueue_parent_gateways() {
    let (index, mut keys, _status) = mk_index();

    index.write().apply_http_route(mk_route(
        "apps",
        "api-route",
        &[("web", None), ("edge", Some("infra"))],
    ));

    let mut enqueued = vec![keys.try_recv().unwrap(), keys.try_recv().unwrap()];
    enqueued.sort();
    assert_eq!(
        enqueued,
        vec![
            GatewayRef::new("apps", "web"),
            GatewayRef::new("infra", "edge"),
        ]
    );
}

#[test]
fn route_delete_enqueues_parents() {
    let (index, mut keys, _status) = mk_index();

    index
        .write()
        .apply_http_route(mk_route("apps", "api-route", &[("web", None)]));
    let _ = keys.try_recv();

    index
        .write()
        .delete_http_route("apps".to_string(), "api-route".to_string());
    assert_eq!(keys.try_recv().unwrap(), GatewayRef::new("apps", "web"));
}

#[test]
fn accepted_gateways_filters_by_class() {
    let (index, _keys, _status) = mk_index();

    index
        .write()
        .apply_gateway_class(mk_gateway_class("ai-gateway", CONTROLLER_NAME));
    index.write().apply_gateway(mk_gateway("default", "ours", "ai-gateway"));
    index.write().apply_gateway(mk_gateway("default", "theirs", "nginx"));

    let accepted = index.read().accepted_gateways();
    assert_eq!(accepted, vec![GatewayRef::new("default", "ours")]);
}

#[test]
fn infra_lookup_reports_ownership() {
    let (index, _keys, _status) = mk_index();

    let labeled: ConfigMap = serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": "envoy-proxy-abc",
            "namespace": "default",
            "resourceVersion": "42",
            "labels": { (MANAGED_GATEWAY_LABEL): "x" },
        },
    }))
    .unwrap();
    let unlabeled: ConfigMap = serde_json::from_value(serde_json::json!({
        "metadata": { "name": "stray", "namespace": "default", "resourceVersion": "7" },
    }))
    .unwrap();
    IndexNamespacedResource::<ConfigMap>::apply(&mut *index.write(), labeled);
    IndexNamespacedResource::<ConfigMap>::apply(&mut *index.write(), unlabeled);

    let index = index.read();
    assert_eq!(
        index.infra_lookup("ConfigMap", "default", "envoy-proxy-abc"),
        InfraLookup::Found {
            managed: true,
            resource_version: Some("42".to_string()),
        }
    );
    assert_eq!(
        index.infra_lookup("ConfigMap", "default", "stray"),
        InfraLookup::Found {
            managed: false,
            resource_version: Some("7".to_string()),
        }
    );
    assert_eq!(
        index.infra_lookup("ConfigMap", "default", "absent"),
        InfraLookup::Missing
    );
    assert_eq!(
        index.infra_lookup("Pod", "default", "anything"),
        InfraLookup::UnknownKind
    );
}
