//! Listener validation and Envoy listener assembly.
//!
//! Conflict detection is a property of the Gateway alone: listeners sharing
//! a port must agree on protocol family and differ in hostname. Certificate
//! references of TLS listeners resolve against cached Secrets. Valid
//! HTTP/HTTPS listeners then compile their attached routes into virtual
//! hosts and one Envoy listener per port.

use crate::cluster::{build_clusters, typed_transport_socket, ResolvedBackend};
use crate::route::{compile_route, sort_routes};
use crate::{gateway_namespace, hostname, ClusterView, TranslationError};
use ahash::AHashMap as HashMap;
use ai_gateway_controller_core::{listener_name, route_config_name, virtual_host_name};
use ai_gateway_controller_k8s_api::{
    gateway::{
        Gateway, GatewayListeners, GatewayStatusListeners, GatewayStatusListenersSupportedKinds,
        HTTPRoute, HTTPRouteStatusParents, ListenerConditionReason, ListenerConditionType, GROUP,
    },
    Condition, Resource, ResourceExt, ResourceId, Secret,
};
use ai_gateway_controller_status::conditions::{
    is_condition_false, is_condition_true, new_condition, set_status_condition,
};
use envoy_api_rs::pb::envoy::config::accesslog::v3::{access_log, AccessLog};
use envoy_api_rs::pb::envoy::config::cluster::v3::Cluster;
use envoy_api_rs::pb::envoy::config::core::v3::{
    address, socket_address, Address, SocketAddress,
};
use envoy_api_rs::pb::envoy::config::listener::v3::{
    filter, listener_filter, Filter, FilterChain, FilterChainMatch, Listener as EnvoyListener,
    ListenerFilter,
};
use envoy_api_rs::pb::envoy::config::route::v3::{RouteConfiguration, VirtualHost};
use envoy_api_rs::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_api_rs::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_api_rs::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter,
};
use envoy_api_rs::pb::envoy::extensions::access_loggers::file::v3::FileAccessLog;
use envoy_api_rs::pb::envoy::extensions::transport_sockets::tls::v3::DownstreamTlsContext;
use envoy_api_rs::pb::google::protobuf::{Any, Duration};
use prost::Message;
use std::collections::BTreeMap;
use std::sync::Arc;

const HCM_FILTER: &str = "envoy.filters.network.http_connection_manager";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const FILE_ACCESS_LOG: &str = "envoy.access_loggers.file";
const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

fn any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// Conflict detection over the Gateway's listeners. Returns per-listener
/// conditions keyed by listener name: `Conflicted` for port conflicts,
/// `ResolvedRefs` for certificate resolution.
pub(crate) fn validate_listener_conflicts(
    gateway: &Gateway,
    view: &ClusterView,
) -> HashMap<String, Vec<Condition>> {
    let generation = gateway.meta().generation;
    let gateway_ns = gateway_namespace(gateway);

    let mut conditions: HashMap<String, Vec<Condition>> = gateway
        .spec
        .listeners
        .iter()
        .map(|l| (l.name.clone(), Vec::new()))
        .collect();

    let mut by_port: BTreeMap<i32, Vec<&GatewayListeners>> = BTreeMap::new();
    for listener in &gateway.spec.listeners {
        by_port.entry(listener.port).or_default().push(listener);
    }

    for listeners in by_port.values() {
        let has_datagram = listeners
            .iter()
            .any(|l| matches!(l.protocol.as_str(), "TCP" | "UDP"));
        let has_stream = listeners
            .iter()
            .any(|l| matches!(l.protocol.as_str(), "HTTP" | "HTTPS" | "TLS"));

        // A TCP/UDP listener cannot share a port with HTTP/HTTPS/TLS
        // listeners; everything on the port conflicts.
        if has_datagram && has_stream {
            for listener in listeners {
                set_condition(
                    &mut conditions,
                    &listener.name,
                    new_condition(
                        ListenerConditionType::Conflicted,
                        "True",
                        ListenerConditionReason::ProtocolConflict,
                        "Protocol conflict: TCP/UDP listeners cannot share a port with HTTP/HTTPS/TLS listeners.",
                        generation,
                    ),
                );
            }
            continue;
        }

        // Hostname-distinguished listeners on one port must have unique
        // hostnames; an absent hostname is the empty hostname.
        let mut seen: HashMap<String, String> = HashMap::new();
        for listener in listeners {
            if !matches!(listener.protocol.as_str(), "HTTP" | "HTTPS" | "TLS") {
                continue;
            }
            let hostname = listener.hostname.clone().unwrap_or_default();
            if let Some(other) = seen.get(&hostname) {
                let conflict = new_condition(
                    ListenerConditionType::Conflicted,
                    "True",
                    ListenerConditionReason::HostnameConflict,
                    format!("Hostname '{hostname}' conflicts with another listener on the same port."),
                    generation,
                );
                set_condition(&mut conditions, &listener.name, conflict.clone());
                set_condition(&mut conditions, &other.clone(), conflict);
            } else {
                seen.insert(hostname, listener.name.clone());
            }
        }
    }

    // Certificate resolution for listeners that survived conflict checks.
    for listener in &gateway.spec.listeners {
        let listener_conditions = conditions.entry(listener.name.clone()).or_default();
        if is_condition_true(listener_conditions, "Conflicted") {
            continue;
        }

        let Some(tls) = &listener.tls else {
            set_status_condition(listener_conditions, resolved_refs_ok(generation));
            continue;
        };

        for cert_ref in tls.certificate_refs.iter().flatten() {
            if cert_ref.group.as_deref().is_some_and(|g| !g.is_empty()) {
                set_status_condition(
                    listener_conditions,
                    invalid_certificate_ref(
                        format!(
                            "unsupported certificate ref group: {}",
                            cert_ref.group.as_deref().unwrap_or_default()
                        ),
                        generation,
                    ),
                );
                break;
            }
            if cert_ref.kind.as_deref().is_some_and(|k| k != "Secret") {
                set_status_condition(
                    listener_conditions,
                    invalid_certificate_ref(
                        format!(
                            "unsupported certificate ref kind: {}",
                            cert_ref.kind.as_deref().unwrap_or_default()
                        ),
                        generation,
                    ),
                );
                break;
            }

            let namespace = cert_ref.namespace.as_deref().unwrap_or(&gateway_ns);
            let Some(secret) = view.secret(namespace, &cert_ref.name) else {
                set_status_condition(
                    listener_conditions,
                    invalid_certificate_ref(
                        format!("reference to Secret {namespace}/{} not found", cert_ref.name),
                        generation,
                    ),
                );
                break;
            };
            if let Err(error) = validate_secret_certificate(secret) {
                set_status_condition(
                    listener_conditions,
                    invalid_certificate_ref(
                        format!("malformed Secret {namespace}/{}: {error}", cert_ref.name),
                        generation,
                    ),
                );
                break;
            }
        }

        if !is_condition_false(listener_conditions, "ResolvedRefs") {
            set_status_condition(listener_conditions, resolved_refs_ok(generation));
        }
    }

    conditions
}

fn set_condition(
    conditions: &mut HashMap<String, Vec<Condition>>,
    listener: &str,
    condition: Condition,
) {
    set_status_condition(conditions.entry(listener.to_string()).or_default(), condition);
}

fn resolved_refs_ok(generation: Option<i64>) -> Condition {
    new_condition(
        ListenerConditionType::ResolvedRefs,
        "True",
        ListenerConditionReason::ResolvedRefs,
        "All references resolved",
        generation,
    )
}

fn invalid_certificate_ref(message: String, generation: Option<i64>) -> Condition {
    new_condition(
        ListenerConditionType::ResolvedRefs,
        "False",
        ListenerConditionReason::InvalidCertificateRef,
        message,
        generation,
    )
}

/// Both `tls.crt` and `tls.key` must hold at least one PEM block.
fn validate_secret_certificate(secret: &Secret) -> Result<(), String> {
    for key in ["tls.key", "tls.crt"] {
        let data = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| format!("does not contain key {key}"))?;
        pem::parse(&data.0).map_err(|_| format!("key {key} is not valid PEM"))?;
    }
    Ok(())
}

/// Listener kinds admitted for routing. Only HTTPRoute is translated.
fn supported_kinds(
    listener: &GatewayListeners,
) -> (Vec<GatewayStatusListenersSupportedKinds>, bool) {
    let mut kinds = Vec::new();
    let mut all_valid = true;

    let declared = listener
        .allowed_routes
        .as_ref()
        .and_then(|a| a.kinds.as_deref())
        .unwrap_or_default();
    if !declared.is_empty() {
        for kind in declared {
            let group_ok = kind
                .group
                .as_deref()
                .map_or(true, |g| g.is_empty() || g == GROUP);
            if group_ok && kind.kind == "HTTPRoute" {
                kinds.push(GatewayStatusListenersSupportedKinds {
                    group: Some(GROUP.to_string()),
                    kind: kind.kind.clone(),
                });
            } else {
                all_valid = false;
            }
        }
    } else if matches!(listener.protocol.as_str(), "HTTP" | "HTTPS") {
        kinds.push(GatewayStatusListenersSupportedKinds {
            group: Some(GROUP.to_string()),
            kind: "HTTPRoute".to_string(),
        });
    }

    (kinds, all_valid)
}

/// Checks one listener against the conflict conditions and its declared
/// route kinds. Returns its status and whether it should be programmed.
fn validate_listener(
    listener: &GatewayListeners,
    generation: Option<i64>,
    conflict_conditions: &HashMap<String, Vec<Condition>>,
) -> (GatewayStatusListeners, bool) {
    let mut status = GatewayStatusListeners {
        name: listener.name.clone(),
        supported_kinds: Vec::new(),
        conditions: conflict_conditions
            .get(&listener.name)
            .cloned()
            .unwrap_or_default(),
        attached_routes: 0,
    };

    let (kinds, all_valid) = supported_kinds(listener);
    status.supported_kinds = kinds;

    if !all_valid {
        set_status_condition(
            &mut status.conditions,
            new_condition(
                ListenerConditionType::ResolvedRefs,
                "False",
                ListenerConditionReason::InvalidRouteKinds,
                "Invalid route kinds specified in allowedRoutes",
                generation,
            ),
        );
        return (status, false);
    }

    if is_condition_true(&status.conditions, "Conflicted") {
        return (status, false);
    }

    if !is_condition_false(&status.conditions, "ResolvedRefs") {
        set_status_condition(
            &mut status.conditions,
            new_condition(
                ListenerConditionType::ResolvedRefs,
                "True",
                ListenerConditionReason::ResolvedRefs,
                "All references resolved",
                generation,
            ),
        );
    }

    (status, true)
}

pub(crate) struct BuiltListeners {
    pub listeners: Vec<EnvoyListener>,
    pub clusters: Vec<Cluster>,
    pub backends: Vec<ResolvedBackend>,
    pub listener_statuses: Vec<GatewayStatusListeners>,
}

/// Compiles attached routes per listener, buckets them into virtual hosts,
/// and emits one Envoy listener per port.
pub(crate) fn build_listeners(
    gateway: &Gateway,
    view: &ClusterView,
    routes_by_listener: &HashMap<String, Vec<Arc<HTTPRoute>>>,
    route_statuses: &mut BTreeMap<ResourceId, Vec<HTTPRouteStatusParents>>,
    conflict_conditions: &HashMap<String, Vec<Condition>>,
) -> Result<BuiltListeners, TranslationError> {
    let generation = gateway.meta().generation;
    let gateway_name = gateway.name_unchecked();

    let mut by_port: BTreeMap<i32, Vec<&GatewayListeners>> = BTreeMap::new();
    for listener in &gateway.spec.listeners {
        by_port.entry(listener.port).or_default().push(listener);
    }

    let mut envoy_listeners = Vec::new();
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    let mut backends = Vec::new();
    let mut statuses: HashMap<String, GatewayStatusListeners> = HashMap::new();

    for (port, listeners) in &by_port {
        let mut filter_chains = Vec::new();

        for listener in listeners {
            let (mut status, valid) = validate_listener(listener, generation, conflict_conditions);
            if !valid {
                statuses.insert(listener.name.clone(), status);
                continue;
            }

            let mut attached_routes = 0;
            match listener.protocol.as_str() {
                "HTTP" | "HTTPS" => {
                    let mut virtual_hosts: BTreeMap<String, VirtualHost> = BTreeMap::new();

                    for route in routes_by_listener
                        .get(&listener.name)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                    {
                        let compiled = compile_route(route, view);

                        // Record the resolution outcome on every accepted
                        // parent of this route.
                        let route_id = ResourceId::new(
                            route.namespace().unwrap_or_default(),
                            route.name_unchecked(),
                        );
                        if let Some(parents) = route_statuses.get_mut(&route_id) {
                            for parent in parents.iter_mut() {
                                let conditions = parent.conditions.get_or_insert_with(Vec::new);
                                if is_condition_true(conditions, "Accepted") {
                                    set_status_condition(
                                        conditions,
                                        compiled.resolved_refs.clone(),
                                    );
                                }
                            }
                        }

                        for cluster in build_clusters(&compiled.backends, view)? {
                            clusters.entry(cluster.name.clone()).or_insert(cluster);
                        }
                        backends.extend(compiled.backends);

                        if compiled.envoy_routes.is_empty() {
                            continue;
                        }
                        attached_routes += 1;

                        let route_hostnames =
                            route.spec.hostnames.clone().unwrap_or_default();
                        for domain in hostname::intersecting_hostnames(
                            listener.hostname.as_deref(),
                            &route_hostnames,
                        ) {
                            let virtual_host = virtual_hosts
                                .entry(domain.clone())
                                .or_insert_with(|| VirtualHost {
                                    name: virtual_host_name(&gateway_name, *port, &domain),
                                    domains: vec![domain.clone()],
                                    ..Default::default()
                                });
                            virtual_host
                                .routes
                                .extend(compiled.envoy_routes.iter().cloned());
                        }
                    }

                    let mut all_virtual_hosts: Vec<VirtualHost> =
                        virtual_hosts.into_values().collect();
                    for virtual_host in &mut all_virtual_hosts {
                        sort_routes(&mut virtual_host.routes);
                    }

                    let route_config = RouteConfiguration {
                        name: route_config_name(&listener.name),
                        virtual_hosts: all_virtual_hosts,
                        ..Default::default()
                    };

                    filter_chains.push(filter_chain(&gateway_name, listener, route_config));
                    set_status_condition(
                        &mut status.conditions,
                        new_condition(
                            ListenerConditionType::Programmed,
                            "True",
                            ListenerConditionReason::Programmed,
                            "Listener is programmed",
                            generation,
                        ),
                    );
                }
                protocol => {
                    tracing::warn!(
                        gateway = %gateway_name,
                        listener = %listener.name,
                        %protocol,
                        "Unsupported listener protocol for routing"
                    );
                }
            }

            status.attached_routes = attached_routes;
            set_status_condition(
                &mut status.conditions,
                new_condition(
                    ListenerConditionType::Accepted,
                    "True",
                    ListenerConditionReason::Accepted,
                    "Listener is valid",
                    generation,
                ),
            );
            statuses.insert(listener.name.clone(), status);
        }

        if !filter_chains.is_empty() {
            envoy_listeners.push(EnvoyListener {
                name: listener_name(*port),
                address: Some(Address {
                    address: Some(address::Address::SocketAddress(SocketAddress {
                        address: "0.0.0.0".to_string(),
                        port_specifier: Some(socket_address::PortSpecifier::PortValue(
                            *port as u32,
                        )),
                        ..Default::default()
                    })),
                }),
                filter_chains,
                listener_filters: vec![tls_inspector()],
                ..Default::default()
            });
        }
    }

    // Statuses in the Gateway's declared listener order.
    let listener_statuses = gateway
        .spec
        .listeners
        .iter()
        .filter_map(|l| statuses.remove(&l.name))
        .collect();

    Ok(BuiltListeners {
        listeners: envoy_listeners,
        clusters: clusters.into_values().collect(),
        backends,
        listener_statuses,
    })
}

/// The HTTP connection manager chain for one listener, with the route
/// configuration inlined.
fn filter_chain(
    gateway_name: &str,
    listener: &GatewayListeners,
    route_config: RouteConfiguration,
) -> FilterChain {
    let hcm = HttpConnectionManager {
        codec_type: http_connection_manager::CodecType::Auto as i32,
        stat_prefix: format!("gateway_{gateway_name}_listener_{}", listener.name),
        route_specifier: Some(http_connection_manager::RouteSpecifier::RouteConfig(
            route_config,
        )),
        http_filters: vec![HttpFilter {
            name: ROUTER_FILTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(any(
                "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router",
                &Router::default(),
            ))),
            ..Default::default()
        }],
        request_timeout: Some(Duration {
            seconds: 60,
            nanos: 0,
        }),
        stream_idle_timeout: Some(Duration {
            seconds: 15,
            nanos: 0,
        }),
        drain_timeout: Some(Duration {
            seconds: 15,
            nanos: 0,
        }),
        access_log: vec![AccessLog {
            name: FILE_ACCESS_LOG.to_string(),
            config_type: Some(access_log::ConfigType::TypedConfig(any(
                "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog",
                &FileAccessLog {
                    path: "/dev/stdout".to_string(),
                    ..Default::default()
                },
            ))),
            ..Default::default()
        }],
        ..Default::default()
    };

    let mut chain = FilterChain {
        filters: vec![Filter {
            name: HCM_FILTER.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(any(
                "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                &hcm,
            ))),
        }],
        ..Default::default()
    };

    if listener.protocol == "HTTPS" {
        // Certificates are wired separately; the context is a placeholder
        // that pins the chain to TLS.
        if let Some(hostname) = &listener.hostname {
            chain.filter_chain_match = Some(FilterChainMatch {
                server_names: vec![hostname.clone()],
                ..Default::default()
            });
        }
        chain.transport_socket = Some(typed_transport_socket(
            TLS_TRANSPORT_SOCKET,
            &DownstreamTlsContext::default(),
            "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext",
        ));
    }

    chain
}

fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: TLS_INSPECTOR.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(any(
            "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector",
            &TlsInspector::default(),
        ))),
        ..Default::default()
    }
}
