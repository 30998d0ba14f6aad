#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Gateway → xDS translation.
//!
//! [`translate`] is a pure function over a Gateway and a point-in-time
//! [`ClusterView`] of everything it may reference: listener conflicts are
//! detected first, routes are gathered and attached, each listener's routes
//! compile into virtual hosts and filter chains, backends materialize into
//! clusters and endpoints, and the lot is bundled for the snapshot cache.
//! Repeated calls over the same inputs produce identical output, which is
//! what lets the reconciler re-run it idempotently.

mod cluster;
mod hostname;
mod listener;
mod route;

#[cfg(test)]
mod tests;

use ahash::AHashMap as HashMap;
use ai_gateway_controller_k8s_api::{
    gateway::{Gateway, GatewayStatusListeners, HTTPRoute, HTTPRouteStatusParents},
    Backend, EndpointSlice, Namespace, Resource, ResourceExt, ResourceId, Secret, Service,
};
use ai_gateway_controller_xds::ResourceSet;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything the translator may dereference, cloned out of the index so the
/// translation itself holds no locks and performs no I/O.
#[derive(Clone, Debug, Default)]
pub struct ClusterView {
    pub routes: Vec<Arc<HTTPRoute>>,
    pub backends: HashMap<ResourceId, Arc<Backend>>,
    pub services: HashMap<ResourceId, Arc<Service>>,
    pub secrets: HashMap<ResourceId, Arc<Secret>>,
    pub endpoint_slices: Vec<Arc<EndpointSlice>>,
    pub namespaces: HashMap<String, Arc<Namespace>>,
}

impl ClusterView {
    pub fn backend(&self, namespace: &str, name: &str) -> Option<&Backend> {
        self.backends
            .get(&ResourceId::new(namespace, name))
            .map(Arc::as_ref)
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<&Service> {
        self.services
            .get(&ResourceId::new(namespace, name))
            .map(Arc::as_ref)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<&Secret> {
        self.secrets
            .get(&ResourceId::new(namespace, name))
            .map(Arc::as_ref)
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name).map(Arc::as_ref)
    }

    /// EndpointSlices serving `service` in `namespace`, by the
    /// `kubernetes.io/service-name` label.
    pub fn endpoint_slices_for(&self, namespace: &str, service: &str) -> Vec<&EndpointSlice> {
        let mut slices: Vec<&EndpointSlice> = self
            .endpoint_slices
            .iter()
            .filter(|slice| {
                slice.meta().namespace.as_deref() == Some(namespace)
                    && slice
                        .meta()
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get("kubernetes.io/service-name"))
                        .map(String::as_str)
                        == Some(service)
            })
            .map(Arc::as_ref)
            .collect();
        slices.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        slices
    }
}

/// The output of one translation run.
#[derive(Clone, Debug, Default)]
pub struct Translation {
    pub resources: ResourceSet,
    /// Parent statuses for every route that targets this Gateway, keyed by
    /// the route's namespace/name.
    pub route_statuses: BTreeMap<ResourceId, Vec<HTTPRouteStatusParents>>,
    /// Per-listener statuses in the Gateway's listener declaration order.
    pub listener_statuses: Vec<GatewayStatusListeners>,
}

/// Hard translation failures. Reference problems that can be expressed as
/// conditions on the affected object are reported through statuses instead
/// and never abort the translation.
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("gateway has no namespace or name")]
    IncompleteGateway,

    #[error("failed to resolve CA bundle: {0}")]
    CaBundle(String),

    #[error("failed to resolve client certificate: {0}")]
    ClientCertificate(String),
}

/// Translates a Gateway and everything it references into the xDS resources
/// for its proxy, plus the statuses describing what was (not) admitted.
pub fn translate(gateway: &Gateway, view: &ClusterView) -> Result<Translation, TranslationError> {
    if gateway.meta().namespace.is_none() || gateway.meta().name.is_none() {
        return Err(TranslationError::IncompleteGateway);
    }

    let (routes_by_listener, mut route_statuses) = route::gather_routes(gateway, view);
    let listener_conditions = listener::validate_listener_conflicts(gateway, view);

    let built = listener::build_listeners(
        gateway,
        view,
        &routes_by_listener,
        &mut route_statuses,
        &listener_conditions,
    )?;

    let endpoints = cluster::build_endpoints(&built.backends, view);

    Ok(Translation {
        resources: ResourceSet {
            listeners: built.listeners,
            routes: Vec::new(),
            clusters: built.clusters,
            endpoints,
        },
        route_statuses,
        listener_statuses: built.listener_statuses,
    })
}

/// The namespace a Gateway lives in; callers have already rejected Gateways
/// without one.
pub(crate) fn gateway_namespace(gateway: &Gateway) -> String {
    gateway.namespace().unwrap_or_default()
}
