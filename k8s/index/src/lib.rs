#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The controller's resource cache.
//!
//! One [`Index`] receives every watch event through kubert's index traits and
//! keeps the latest copy of each resource the translator and deployer read.
//! Applying an event also performs dispatch: changes are mapped to the
//! Gateway keys they affect and those keys are pushed at the reconciler's
//! work queue.
//!
//! - A `GatewayClass` event updates the set of accepted classes, emits the
//!   class's `Accepted` condition, and re-enqueues every known Gateway of
//!   that class, so a Gateway created before its class was accepted becomes
//!   reconcilable the moment the class flips. Foreign classes never enqueue.
//! - A `Gateway` event enqueues its own key iff its `gatewayClassName` names
//!   an accepted class; deletions always enqueue so infra is torn down.
//! - An `HTTPRoute` event enqueues every Gateway named by its `parentRefs`.
//! - Backends, Services, Secrets, EndpointSlices, and Namespaces are cached
//!   for lookup only; re-translation is driven by the resync tick.

#[cfg(test)]
mod tests;

use ahash::AHashMap as HashMap;
use ai_gateway_controller_core::{GatewayRef, CONTROLLER_NAME, MANAGED_GATEWAY_LABEL};
use ai_gateway_controller_k8s_api::{
    gateway::{Gateway, GatewayClass, HTTPRoute},
    Backend, ConfigMap, Deployment, EndpointSlice, Namespace, Resource, ResourceExt, ResourceId,
    Secret, Service, ServiceAccount,
};
use ai_gateway_controller_status::{conditions, Update, UpdateSender};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Result of looking up an infra object for the deployer's ownership check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InfraLookup {
    /// The kind is not cached here; the caller cannot be protected against
    /// overwrites.
    UnknownKind,
    /// No object with that name exists.
    Missing,
    /// The object exists; `managed` reflects the managed label.
    Found {
        managed: bool,
        resource_version: Option<String>,
    },
}

pub struct Index {
    keys: UnboundedSender<GatewayRef>,
    status: UpdateSender,

    accepted_classes: ahash::AHashSet<String>,
    gateways: HashMap<ResourceId, Arc<Gateway>>,
    http_routes: HashMap<ResourceId, Arc<HTTPRoute>>,
    backends: HashMap<ResourceId, Arc<Backend>>,
    services: HashMap<ResourceId, Arc<Service>>,
    secrets: HashMap<ResourceId, Arc<Secret>>,
    endpoint_slices: HashMap<ResourceId, Arc<EndpointSlice>>,
    config_maps: HashMap<ResourceId, Arc<ConfigMap>>,
    service_accounts: HashMap<ResourceId, Arc<ServiceAccount>>,
    deployments: HashMap<ResourceId, Arc<Deployment>>,
    namespaces: HashMap<String, Arc<Namespace>>,
}

impl Index {
    pub fn shared(keys: UnboundedSender<GatewayRef>, status: UpdateSender) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            keys,
            status,
            accepted_classes: Default::default(),
            gateways: Default::default(),
            http_routes: Default::default(),
            backends: Default::default(),
            services: Default::default(),
            secrets: Default::default(),
            endpoint_slices: Default::default(),
            config_maps: Default::default(),
            service_accounts: Default::default(),
            deployments: Default::default(),
            namespaces: Default::default(),
        }))
    }

    fn enqueue(&self, key: GatewayRef) {
        if let Err(error) = self.keys.send(key) {
            tracing::error!(%error, "Work queue closed; dropping key");
        }
    }

    pub fn gateway(&self, namespace: &str, name: &str) -> Option<Arc<Gateway>> {
        self.gateways.get(&ResourceId::new(namespace, name)).cloned()
    }

    pub fn is_accepted_class(&self, class: &str) -> bool {
        self.accepted_classes.contains(class)
    }

    /// Keys of every Gateway whose class is accepted, for the resync tick.
    pub fn accepted_gateways(&self) -> Vec<GatewayRef> {
        self.gateways
            .iter()
            .filter(|(_, gw)| self.accepted_classes.contains(&gw.spec.gateway_class_name))
            .map(|(id, _)| GatewayRef::new(&*id.namespace, &*id.name))
            .collect()
    }

    pub fn http_routes(&self) -> Vec<Arc<HTTPRoute>> {
        self.http_routes.values().cloned().collect()
    }

    pub fn backends(&self) -> HashMap<ResourceId, Arc<Backend>> {
        self.backends.clone()
    }

    pub fn services(&self) -> HashMap<ResourceId, Arc<Service>> {
        self.services.clone()
    }

    pub fn secrets(&self) -> HashMap<ResourceId, Arc<Secret>> {
        self.secrets.clone()
    }

    pub fn endpoint_slices(&self) -> Vec<Arc<EndpointSlice>> {
        self.endpoint_slices.values().cloned().collect()
    }

    pub fn namespaces(&self) -> HashMap<String, Arc<Namespace>> {
        self.namespaces.clone()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ResourceId::new(namespace, name)).cloned()
    }

    /// Ownership lookup for the deployer. Only the four infra kinds are
    /// cached; anything else is [`InfraLookup::UnknownKind`].
    pub fn infra_lookup(&self, kind: &str, namespace: &str, name: &str) -> InfraLookup {
        let id = ResourceId::new(namespace, name);
        let meta = match kind {
            "ConfigMap" => self.config_maps.get(&id).map(|o| o.meta().clone()),
            "ServiceAccount" => self.service_accounts.get(&id).map(|o| o.meta().clone()),
            "Service" => self.services.get(&id).map(|o| o.meta().clone()),
            "Deployment" => self.deployments.get(&id).map(|o| o.meta().clone()),
            _ => return InfraLookup::UnknownKind,
        };
        match meta {
            None => InfraLookup::Missing,
            Some(meta) => InfraLookup::Found {
                managed: meta
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(MANAGED_GATEWAY_LABEL)),
                resource_version: meta.resource_version,
            },
        }
    }

    pub fn apply_gateway_class(&mut self, class: GatewayClass) {
        let name = class.name_unchecked();
        if class.spec.controller_name != CONTROLLER_NAME {
            tracing::debug!(%name, controller = %class.spec.controller_name, "Ignoring foreign GatewayClass");
            self.accepted_classes.remove(&name);
            return;
        }

        self.accepted_classes.insert(name.clone());
        self.enqueue_gateways_of_class(&name);

        let mut status = class.status.clone().unwrap_or_default();
        let mut existing = status.conditions.take().unwrap_or_default();
        conditions::set_status_condition(
            &mut existing,
            conditions::new_condition(
                "Accepted",
                "True",
                "Accepted",
                format!("GatewayClass is accepted by the {CONTROLLER_NAME} controller."),
                class.metadata.generation,
            ),
        );
        status.conditions = Some(existing);
        if let Err(error) = self.status.send(Update::GatewayClass { name, status }) {
            tracing::error!(%error, "Status channel closed");
        }
    }

    /// Every known Gateway of `class` becomes dirty when the class's
    /// acceptance changes.
    fn enqueue_gateways_of_class(&self, class: &str) {
        for (id, gateway) in &self.gateways {
            if gateway.spec.gateway_class_name == class {
                self.enqueue(GatewayRef::new(&*id.namespace, &*id.name));
            }
        }
    }

    pub fn apply_gateway(&mut self, gateway: Gateway) {
        let namespace = gateway.namespace().expect("Gateway must have a namespace");
        let name = gateway.name_unchecked();
        let key = GatewayRef::new(&namespace, &name);

        let accepted = self
            .accepted_classes
            .contains(&gateway.spec.gateway_class_name);
        self.gateways
            .insert(ResourceId::new(namespace, name), Arc::new(gateway));

        if accepted {
            self.enqueue(key);
        } else {
            tracing::debug!(gateway = %key, "Gateway references a class we do not accept");
        }
    }

    pub fn delete_gateway(&mut self, namespace: String, name: String) {
        self.gateways.remove(&ResourceId::new(&namespace, &name));
        // The sync handler observes the absence and tears down the infra.
        self.enqueue(GatewayRef::new(namespace, name));
    }

    pub fn apply_http_route(&mut self, route: HTTPRoute) {
        let namespace = route.namespace().expect("HTTPRoute must have a namespace");
        let name = route.name_unchecked();

        for parent in parent_gateways(&route, &namespace) {
            self.enqueue(parent);
        }
        self.http_routes
            .insert(ResourceId::new(namespace, name), Arc::new(route));
    }

    pub fn delete_http_route(&mut self, namespace: String, name: String) {
        if let Some(route) = self.http_routes.remove(&ResourceId::new(&namespace, &name)) {
            for parent in parent_gateways(&route, &namespace) {
                self.enqueue(parent);
            }
        }
    }
}

impl kubert::index::IndexClusterResource<GatewayClass> for Index {
    fn apply(&mut self, class: GatewayClass) {
        self.apply_gateway_class(class);
    }

    fn delete(&mut self, name: String) {
        self.accepted_classes.remove(&name);
    }
}

impl kubert::index::IndexNamespacedResource<Gateway> for Index {
    fn apply(&mut self, gateway: Gateway) {
        self.apply_gateway(gateway);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_gateway(namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<HTTPRoute> for Index {
    fn apply(&mut self, route: HTTPRoute) {
        self.apply_http_route(route);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_http_route(namespace, name);
    }
}

/// Gateway keys named by a route's parentRefs. Kind defaults to `Gateway`,
/// namespace to the route's own.
fn parent_gateways(route: &HTTPRoute, route_namespace: &str) -> Vec<GatewayRef> {
    route
        .spec
        .parent_refs
        .iter()
        .flatten()
        .filter(|parent| parent.kind.as_deref().unwrap_or("Gateway") == "Gateway")
        .map(|parent| {
            GatewayRef::new(
                parent.namespace.as_deref().unwrap_or(route_namespace),
                &*parent.name,
            )
        })
        .collect()
}

macro_rules! cache_only_index {
    ($ty:ty, $field:ident) => {
        impl kubert::index::IndexNamespacedResource<$ty> for Index {
            fn apply(&mut self, resource: $ty) {
                let namespace = resource.namespace().expect("resource must have a namespace");
                let name = resource.name_unchecked();
                self.$field
                    .insert(ResourceId::new(namespace, name), Arc::new(resource));
            }

            fn delete(&mut self, namespace: String, name: String) {
                self.$field.remove(&ResourceId::new(namespace, name));
            }
        }
    };
}

cache_only_index!(Backend, backends);
cache_only_index!(Service, services);
cache_only_index!(Secret, secrets);
cache_only_index!(EndpointSlice, endpoint_slices);
cache_only_index!(ConfigMap, config_maps);
cache_only_index!(ServiceAccount, service_accounts);
cache_only_index!(Deployment, deployments);

impl kubert::index::IndexClusterResource<Namespace> for Index {
    fn apply(&mut self, namespace: Namespace) {
        let name = namespace.name_unchecked();
        self.namespaces.insert(name, Arc::new(namespace));
    }

    fn delete(&mut self, name: String) {
        self.namespaces.remove(&name);
    }
}
