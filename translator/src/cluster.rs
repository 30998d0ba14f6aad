//! Backend materialization: Envoy clusters per declared port, EDS load
//! assignments from EndpointSlices, and upstream TLS contexts.

use crate::{ClusterView, TranslationError};
use ai_gateway_controller_core::cluster_name;
use ai_gateway_controller_k8s_api::{
    Backend, BackendPort, BackendProtocol, BackendTarget, BackendTls, BackendTlsMode, ResourceId,
    Service,
};
use envoy_api_rs::pb::envoy::config::cluster::v3::{cluster, Cluster};
use envoy_api_rs::pb::envoy::config::core::v3::{
    address, config_source, data_source, socket_address, transport_socket, Address,
    AggregatedConfigSource, ApiVersion, ConfigSource, DataSource, HealthStatus, SocketAddress,
    TransportSocket,
};
use envoy_api_rs::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_api_rs::pb::envoy::extensions::transport_sockets::tls::v3::{
    certificate_validation_context, common_tls_context, subject_alt_name_matcher,
    CertificateValidationContext, CommonTlsContext, SubjectAltNameMatcher, TlsCertificate,
    UpstreamTlsContext,
};
use envoy_api_rs::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_api_rs::pb::google::protobuf::Duration;
use prost::Message;
use std::collections::BTreeMap;

const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

/// A backendRef resolved into something clusters can be built from: a
/// Backend resource, or a Service synthesized into one.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedBackend {
    /// Names the cluster: the Backend's (or Service's) namespace and name.
    pub id: ResourceId,
    pub target: ResolvedTarget,
    /// Declared ports, defaulted to one HTTP port 80 when the destination
    /// declares none.
    pub ports: Vec<BackendPort>,
}

#[derive(Clone, Debug)]
pub(crate) enum ResolvedTarget {
    /// Resolved over DNS.
    Dns { hostname: String },
    /// Resolved through the EndpointSlices of an in-cluster Service.
    Eds { service: ResourceId },
}

fn default_ports() -> Vec<BackendPort> {
    vec![BackendPort {
        number: 80,
        protocol: BackendProtocol::Http,
        tls: None,
        protocol_options: None,
    }]
}

impl ResolvedBackend {
    pub(crate) fn from_backend(namespace: &str, name: &str, backend: &Backend) -> Self {
        let target = match &backend.spec.destination.target {
            BackendTarget::Fqdn { fqdn } => ResolvedTarget::Dns {
                hostname: fqdn.hostname.clone(),
            },
            BackendTarget::KubernetesService { service } => ResolvedTarget::Eds {
                service: ResourceId::new(
                    service.namespace.as_deref().unwrap_or(namespace),
                    &*service.name,
                ),
            },
        };
        let ports = match backend.spec.destination.ports.as_deref() {
            Some(ports) if !ports.is_empty() => ports.to_vec(),
            _ => default_ports(),
        };
        Self {
            id: ResourceId::new(namespace, name),
            target,
            ports,
        }
    }

    /// A Service backendRef stands in for a Backend whose destination is
    /// that service, carrying the referenced port when it matches a declared
    /// ServicePort.
    pub(crate) fn from_service(
        namespace: &str,
        name: &str,
        service: &Service,
        port: Option<i32>,
    ) -> Self {
        let ports = port
            .and_then(|wanted| {
                service
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.ports.as_ref())
                    .and_then(|ports| ports.iter().find(|p| p.port == wanted))
                    .map(|p| {
                        vec![BackendPort {
                            number: p.port as u16,
                            protocol: BackendProtocol::Http,
                            tls: None,
                            protocol_options: None,
                        }]
                    })
            })
            .unwrap_or_else(default_ports);
        Self {
            id: ResourceId::new(namespace, name),
            target: ResolvedTarget::Eds {
                service: ResourceId::new(namespace, name),
            },
            ports,
        }
    }

    /// The hostname for DNS targets.
    pub(crate) fn hostname(&self) -> Option<&str> {
        match &self.target {
            ResolvedTarget::Dns { hostname } => Some(hostname),
            ResolvedTarget::Eds { .. } => None,
        }
    }

    /// The declared port a route's cluster reference resolves to: the
    /// backendRef's port when it matches a declared one, otherwise the first
    /// declared port.
    pub(crate) fn route_port(&self, requested: Option<i32>) -> u16 {
        if let Some(requested) = requested {
            if let Some(port) = self.ports.iter().find(|p| i32::from(p.number) == requested) {
                return port.number;
            }
        }
        self.ports.first().map(|p| p.number).unwrap_or(80)
    }
}

/// One cluster per declared port of every resolved backend.
pub(crate) fn build_clusters(
    backends: &[ResolvedBackend],
    view: &ClusterView,
) -> Result<Vec<Cluster>, TranslationError> {
    let mut clusters = BTreeMap::new();

    for backend in backends {
        for port in &backend.ports {
            let name = cluster_name(&backend.id.namespace, &backend.id.name, port.number);
            if clusters.contains_key(&name) {
                continue;
            }

            let mut cluster = Cluster {
                name: name.clone(),
                connect_timeout: Some(Duration {
                    seconds: 5,
                    nanos: 0,
                }),
                ..Default::default()
            };

            match &backend.target {
                ResolvedTarget::Dns { hostname } => {
                    cluster.cluster_discovery_type = Some(cluster::ClusterDiscoveryType::Type(
                        cluster::DiscoveryType::LogicalDns as i32,
                    ));
                    cluster.dns_lookup_family = cluster::DnsLookupFamily::V4Only as i32;
                    cluster.load_assignment = Some(load_assignment(
                        &name,
                        hostname,
                        u32::from(port.number),
                    ));
                }
                ResolvedTarget::Eds { .. } => {
                    cluster.cluster_discovery_type = Some(cluster::ClusterDiscoveryType::Type(
                        cluster::DiscoveryType::Eds as i32,
                    ));
                    cluster.eds_cluster_config = Some(cluster::EdsClusterConfig {
                        eds_config: Some(ConfigSource {
                            config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                                AggregatedConfigSource::default(),
                            )),
                            resource_api_version: ApiVersion::V3 as i32,
                            ..Default::default()
                        }),
                        service_name: name.clone(),
                    });
                }
            }

            if let Some(tls) = &port.tls {
                if !matches!(tls.mode, BackendTlsMode::None) {
                    cluster.transport_socket = Some(upstream_transport_socket(
                        tls,
                        backend.hostname(),
                        port.protocol,
                        &backend.id.namespace,
                        view,
                    )?);
                }
            }

            clusters.insert(name, cluster);
        }
    }

    Ok(clusters.into_values().collect())
}

/// EDS load assignments for every Kubernetes-service backend, from the ready
/// endpoints of its EndpointSlices.
pub(crate) fn build_endpoints(
    backends: &[ResolvedBackend],
    view: &ClusterView,
) -> Vec<ClusterLoadAssignment> {
    let mut assignments = BTreeMap::new();

    for backend in backends {
        let ResolvedTarget::Eds { service } = &backend.target else {
            continue;
        };
        for port in &backend.ports {
            let name = cluster_name(&backend.id.namespace, &backend.id.name, port.number);
            if assignments.contains_key(&name) {
                continue;
            }

            let mut lb_endpoints = Vec::new();
            for slice in view.endpoint_slices_for(&service.namespace, &service.name) {
                for endpoint in &slice.endpoints {
                    let ready = endpoint
                        .conditions
                        .as_ref()
                        .and_then(|c| c.ready)
                        .unwrap_or(true);
                    if !ready {
                        continue;
                    }
                    for address in &endpoint.addresses {
                        lb_endpoints.push(LbEndpoint {
                            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(
                                Endpoint {
                                    address: Some(socket_address(
                                        address,
                                        u32::from(port.number),
                                    )),
                                    ..Default::default()
                                },
                            )),
                            health_status: HealthStatus::Healthy as i32,
                            ..Default::default()
                        });
                    }
                }
            }

            assignments.insert(
                name.clone(),
                ClusterLoadAssignment {
                    cluster_name: name,
                    endpoints: vec![LocalityLbEndpoints {
                        lb_endpoints,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            );
        }
    }

    assignments.into_values().collect()
}

fn socket_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn load_assignment(cluster: &str, host: &str, port: u32) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: vec![LbEndpoint {
                host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                    address: Some(socket_address(host, port)),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn inline_bytes(bytes: Vec<u8>) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes)),
        ..Default::default()
    }
}

pub(crate) fn typed_transport_socket<M: Message>(name: &str, config: &M, type_url: &str) -> TransportSocket {
    TransportSocket {
        name: name.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(
            envoy_api_rs::pb::google::protobuf::Any {
                type_url: type_url.to_string(),
                value: config.encode_to_vec(),
            },
        )),
    }
}

fn upstream_transport_socket(
    tls: &BackendTls,
    hostname: Option<&str>,
    protocol: BackendProtocol,
    default_namespace: &str,
    view: &ClusterView,
) -> Result<TransportSocket, TranslationError> {
    let context = upstream_tls_context(tls, hostname, protocol, default_namespace, view)?;
    Ok(typed_transport_socket(
        TLS_TRANSPORT_SOCKET,
        &context,
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext",
    ))
}

/// Maps a port's TLS configuration to an `UpstreamTlsContext`.
fn upstream_tls_context(
    tls: &BackendTls,
    hostname: Option<&str>,
    protocol: BackendProtocol,
    default_namespace: &str,
    view: &ClusterView,
) -> Result<UpstreamTlsContext, TranslationError> {
    let mut context = UpstreamTlsContext::default();

    // Explicit SNI wins; otherwise present the backend hostname.
    match (&tls.sni, hostname) {
        (Some(sni), _) if !sni.is_empty() => context.sni = sni.clone(),
        (_, Some(hostname)) => context.sni = hostname.to_string(),
        _ => {}
    }

    let mut common = CommonTlsContext::default();
    match protocol {
        BackendProtocol::Http2 => common.alpn_protocols = vec!["h2".to_string()],
        BackendProtocol::Http => common.alpn_protocols = vec!["http/1.1".to_string()],
        BackendProtocol::Tcp | BackendProtocol::Mcp => {}
    }

    let mut validation = CertificateValidationContext::default();
    let mut has_validation = false;

    if tls.insecure_skip_verify.unwrap_or(false) {
        validation.trust_chain_verification =
            certificate_validation_context::TrustChainVerification::AcceptUntrusted as i32;
        has_validation = true;
    }

    if let Some(refs) = tls.ca_bundle_refs.as_deref() {
        if !refs.is_empty() {
            let mut bundle = Vec::new();
            for ca_ref in refs {
                let namespace = ca_ref.namespace.as_deref().unwrap_or(default_namespace);
                let secret = view.secret(namespace, &ca_ref.name).ok_or_else(|| {
                    TranslationError::CaBundle(format!(
                        "secret {namespace}/{} not found",
                        ca_ref.name
                    ))
                })?;
                // Prefer ca.crt, fall back to tls.crt.
                let data = secret
                    .data
                    .as_ref()
                    .and_then(|data| data.get("ca.crt").or_else(|| data.get("tls.crt")))
                    .ok_or_else(|| {
                        TranslationError::CaBundle(format!(
                            "secret {namespace}/{} does not contain ca.crt or tls.crt",
                            ca_ref.name
                        ))
                    })?;
                bundle.extend_from_slice(&data.0);
            }
            validation.trusted_ca = Some(inline_bytes(bundle));
            has_validation = true;
        }
    }

    if let Some(sans) = tls.subject_alt_names.as_deref() {
        for san in sans {
            validation
                .match_typed_subject_alt_names
                .push(SubjectAltNameMatcher {
                    san_type: subject_alt_name_matcher::SanType::Dns as i32,
                    matcher: Some(StringMatcher {
                        match_pattern: Some(MatchPattern::Exact(san.clone())),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            has_validation = true;
        }
    }

    if has_validation {
        common.validation_context_type = Some(
            common_tls_context::ValidationContextType::ValidationContext(validation),
        );
    }

    if matches!(tls.mode, BackendTlsMode::Mutual) {
        if let Some(cert_ref) = &tls.client_certificate_ref {
            let namespace = cert_ref.namespace.as_deref().unwrap_or(default_namespace);
            let secret = view.secret(namespace, &cert_ref.name).ok_or_else(|| {
                TranslationError::ClientCertificate(format!(
                    "secret {namespace}/{} not found",
                    cert_ref.name
                ))
            })?;
            let data = secret.data.as_ref();
            let chain = data.and_then(|d| d.get("tls.crt")).ok_or_else(|| {
                TranslationError::ClientCertificate(format!(
                    "secret {namespace}/{} does not contain tls.crt",
                    cert_ref.name
                ))
            })?;
            let key = data.and_then(|d| d.get("tls.key")).ok_or_else(|| {
                TranslationError::ClientCertificate(format!(
                    "secret {namespace}/{} does not contain tls.key",
                    cert_ref.name
                ))
            })?;
            common.tls_certificates = vec![TlsCertificate {
                certificate_chain: Some(inline_bytes(chain.0.clone())),
                private_key: Some(inline_bytes(key.0.clone())),
                ..Default::default()
            }];
        }
    }

    context.common_tls_context = Some(common);
    Ok(context)
}
