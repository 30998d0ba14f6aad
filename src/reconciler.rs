//! The control loop binding the pieces together: N workers drain the work
//! queue and, per Gateway key, deploy infra, translate, push xDS, and write
//! statuses.

use crate::queue::WorkQueue;
use ai_gateway_controller_core::{GatewayRef, CONTROLLER_NAME};
use ai_gateway_controller_deploy::{delete_gateway_infra, Deployer};
use ai_gateway_controller_index::SharedIndex;
use ai_gateway_controller_k8s_api::{
    gateway::{
        Gateway, GatewayConditionReason, GatewayConditionType, GatewayStatus,
        GatewayStatusAddresses, GatewayStatusListeners, HTTPRoute, HTTPRouteStatus,
        HTTPRouteStatusParents,
    },
    Client, Resource, ResourceExt, ResourceId, Service,
};
use ai_gateway_controller_status::{
    conditions::{new_condition, set_status_condition},
    Update, UpdateSender,
};
use ai_gateway_controller_translator::{translate, ClusterView, Translation};
use ai_gateway_controller_xds::ControlPlane;
use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;
use tracing::Instrument;

const WORKERS: usize = 2;

pub struct Reconciler {
    client: Client,
    index: SharedIndex,
    control_plane: ControlPlane,
    status: UpdateSender,
    envoy_image: String,
    queue: Arc<WorkQueue>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        index: SharedIndex,
        control_plane: ControlPlane,
        status: UpdateSender,
        envoy_image: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            index,
            control_plane,
            status,
            envoy_image,
            queue: WorkQueue::new(),
        })
    }

    /// Runs until `drain` fires: feeds dispatched keys into the queue, ticks
    /// the resync re-enqueue, and drives the workers.
    pub async fn run(
        self: Arc<Self>,
        mut keys: UnboundedReceiver<GatewayRef>,
        resync_period: Duration,
        drain: drain::Watch,
    ) {
        let feeder = {
            let queue = self.queue.clone();
            tokio::spawn(
                async move {
                    while let Some(key) = keys.recv().await {
                        queue.add(key);
                    }
                }
                .instrument(tracing::info_span!("dispatch")),
            )
        };

        if resync_period > Duration::ZERO {
            let queue = self.queue.clone();
            let index = self.index.clone();
            tokio::spawn(
                async move {
                    let mut interval = tokio::time::interval(resync_period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        for key in index.read().accepted_gateways() {
                            queue.add(key);
                        }
                    }
                }
                .instrument(tracing::info_span!("resync")),
            );
        }

        let mut workers = Vec::with_capacity(WORKERS);
        for worker in 0..WORKERS {
            let reconciler = self.clone();
            workers.push(tokio::spawn(
                async move { reconciler.worker().await }
                    .instrument(tracing::info_span!("worker", id = worker)),
            ));
        }
        tracing::info!("Started {WORKERS} workers");

        let release = drain.signaled().await;
        self.queue.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        feeder.abort();
        drop(release);
    }

    async fn worker(self: Arc<Self>) {
        while let Some(key) = self.queue.next().await {
            let reconciler = self.clone();
            let task_key = key.clone();
            // Each sync runs in its own task so a panic is contained and the
            // key is retried rather than the worker dying.
            let outcome =
                tokio::spawn(async move { reconciler.sync(task_key).await }).await;

            match outcome {
                Ok(Ok(())) => {
                    self.queue.forget(&key);
                    tracing::info!(gateway = %key, "Successfully synced");
                }
                Ok(Err(error)) => {
                    tracing::warn!(gateway = %key, %error, "Error syncing; requeueing");
                    self.queue.clone().requeue(key.clone());
                }
                Err(join_error) => {
                    tracing::error!(gateway = %key, %join_error, "Sync crashed; requeueing");
                    self.queue.clone().requeue(key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    async fn sync(&self, key: GatewayRef) -> Result<()> {
        let Some(gateway) = self.index.read().gateway(&key.namespace, &key.name) else {
            // The Gateway is gone: tear down its infra and drop its snapshot
            // so a reconnecting proxy cannot replay stale config.
            delete_gateway_infra(&self.client, &key).await?;
            self.control_plane.evict(&key.node_id());
            return Ok(());
        };

        tracing::info!(gateway = %key, "Syncing gateway");

        let deployer = Deployer::new(
            self.client.clone(),
            self.index.clone(),
            (*gateway).clone(),
            self.envoy_image.clone(),
        );
        deployer
            .deploy()
            .await
            .context("failed to deploy gateway infrastructure")?;

        let view = self.cluster_view();
        let translation = match translate(&gateway, &view) {
            Ok(translation) => translation,
            Err(error) => {
                self.send_status(Update::Gateway {
                    id: ResourceId::new(&*key.namespace, &*key.name),
                    status: failed_gateway_status(&gateway, &error.to_string()),
                });
                return Err(error).context("failed to translate gateway to xDS resources");
            }
        };

        self.control_plane
            .push(deployer.node_id(), &translation.resources);
        tracing::debug!(gateway = %key, node_id = %deployer.node_id(), "Updated xDS snapshot");

        self.write_statuses(&key, &gateway, translation);
        Ok(())
    }

    fn cluster_view(&self) -> ClusterView {
        let index = self.index.read();
        ClusterView {
            routes: index.http_routes(),
            backends: index.backends(),
            services: index.services(),
            secrets: index.secrets(),
            endpoint_slices: index.endpoint_slices(),
            namespaces: index.namespaces(),
        }
    }

    /// Gateway and route status writes. Failures inside the status
    /// controller are logged there and never fail the sync.
    fn write_statuses(&self, key: &GatewayRef, gateway: &Gateway, translation: Translation) {
        let addresses = self
            .index
            .read()
            .service(&key.namespace, &key.node_id())
            .map(|service| load_balancer_addresses(&service))
            .unwrap_or_default();

        self.send_status(Update::Gateway {
            id: ResourceId::new(&*key.namespace, &*key.name),
            status: programmed_gateway_status(gateway, translation.listener_statuses, addresses),
        });

        for (route_id, parents) in translation.route_statuses {
            let Some(route) = self
                .cluster_view_route(&route_id)
            else {
                continue;
            };
            self.send_status(Update::HttpRoute {
                id: route_id,
                status: merge_route_parents(&route, key, parents),
            });
        }
    }

    fn cluster_view_route(&self, id: &ResourceId) -> Option<Arc<HTTPRoute>> {
        self.index
            .read()
            .http_routes()
            .into_iter()
            .find(|route| {
                route.namespace().as_deref() == Some(&id.namespace)
                    && route.name_unchecked() == id.name
            })
    }

    fn send_status(&self, update: Update) {
        if let Err(error) = self.status.send(update) {
            tracing::error!(%error, "Status channel closed");
        }
    }
}

/// Addresses from the owned Service's LoadBalancer ingress.
fn load_balancer_addresses(service: &Service) -> Vec<GatewayStatusAddresses> {
    service
        .status
        .iter()
        .filter_map(|status| status.load_balancer.as_ref())
        .filter_map(|lb| lb.ingress.as_ref())
        .flatten()
        .filter_map(|ingress| {
            if let Some(ip) = &ingress.ip {
                Some(GatewayStatusAddresses {
                    r#type: Some("IPAddress".to_string()),
                    value: ip.clone(),
                })
            } else {
                ingress.hostname.as_ref().map(|hostname| GatewayStatusAddresses {
                    r#type: Some("Hostname".to_string()),
                    value: hostname.clone(),
                })
            }
        })
        .collect()
}

/// The Gateway's status after a successful reconciliation.
fn programmed_gateway_status(
    gateway: &Gateway,
    listeners: Vec<GatewayStatusListeners>,
    addresses: Vec<GatewayStatusAddresses>,
) -> GatewayStatus {
    let generation = gateway.meta().generation;
    let mut status = gateway.status.clone().unwrap_or_default();

    let mut conditions = status.conditions.take().unwrap_or_default();
    set_status_condition(
        &mut conditions,
        new_condition(
            GatewayConditionType::Accepted,
            "True",
            GatewayConditionReason::Accepted,
            "Gateway is accepted",
            generation,
        ),
    );
    set_status_condition(
        &mut conditions,
        new_condition(
            GatewayConditionType::Programmed,
            "True",
            GatewayConditionReason::Programmed,
            "Gateway is programmed",
            generation,
        ),
    );
    status.conditions = Some(conditions);
    status.listeners = Some(listeners);
    status.addresses = Some(addresses);
    status
}

/// The Gateway's status when translation failed outright.
fn failed_gateway_status(gateway: &Gateway, message: &str) -> GatewayStatus {
    let generation = gateway.meta().generation;
    let mut status = gateway.status.clone().unwrap_or_default();
    let mut conditions = status.conditions.take().unwrap_or_default();
    set_status_condition(
        &mut conditions,
        new_condition(
            GatewayConditionType::Programmed,
            "False",
            "TranslationError",
            message,
            generation,
        ),
    );
    status.conditions = Some(conditions);
    status
}

/// Replaces this controller's parent statuses for `gateway` on the route,
/// preserving entries owned by other controllers or other parents and the
/// transition times of semantically unchanged conditions.
fn merge_route_parents(
    route: &HTTPRoute,
    gateway: &GatewayRef,
    new_parents: Vec<HTTPRouteStatusParents>,
) -> HTTPRouteStatus {
    let route_ns = route.namespace().unwrap_or_default();
    let existing = route
        .status
        .clone()
        .map(|status| status.parents)
        .unwrap_or_default();

    let ours = |parent: &HTTPRouteStatusParents| {
        parent.controller_name == CONTROLLER_NAME
            && parent.parent_ref.name == gateway.name
            && parent.parent_ref.namespace.as_deref().unwrap_or(&route_ns) == gateway.namespace
    };

    let mut parents: Vec<HTTPRouteStatusParents> = Vec::new();
    let mut replaced: Vec<HTTPRouteStatusParents> = Vec::new();
    for parent in existing {
        if ours(&parent) {
            replaced.push(parent);
        } else {
            parents.push(parent);
        }
    }

    for mut parent in new_parents {
        // Keep transition times stable across repeated reconciliations.
        if let Some(previous) = replaced.iter().find(|p| {
            p.parent_ref.section_name == parent.parent_ref.section_name
                && p.parent_ref.port == parent.parent_ref.port
        }) {
            let mut conditions = previous.conditions.clone().unwrap_or_default();
            for condition in parent.conditions.take().unwrap_or_default() {
                set_status_condition(&mut conditions, condition);
            }
            parent.conditions = Some(conditions);
        }
        parents.push(parent);
    }

    HTTPRouteStatus { parents }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_gateway_controller_k8s_api::Condition;

    fn mk_gateway(generation: i64) -> Gateway {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web", "namespace": "default", "generation": generation },
            "spec": {
                "gatewayClassName": "ai-gateway",
                "listeners": [{ "name": "http", "port": 80, "protocol": "HTTP" }],
            },
        }))
        .unwrap()
    }

    fn condition(conditions: &[Condition], type_: &str) -> Condition {
        conditions
            .iter()
            .find(|c| c.type_ == type_)
            .unwrap_or_else(|| panic!("no {type_} condition"))
            .clone()
    }

    #[test]
    fn programmed_status_sets_both_conditions() {
        let gateway = mk_gateway(4);
        let status = programmed_gateway_status(&gateway, vec![], vec![]);
        let conditions = status.conditions.unwrap();
        let accepted = condition(&conditions, "Accepted");
        assert_eq!(accepted.status, "True");
        assert_eq!(accepted.observed_generation, Some(4));
        let programmed = condition(&conditions, "Programmed");
        assert_eq!(programmed.status, "True");
    }

    #[test]
    fn translation_failure_flips_programmed_without_dropping_accepted() {
        let mut gateway = mk_gateway(4);
        let ok = programmed_gateway_status(&gateway, vec![], vec![]);
        gateway.status = Some(ok);

        let failed = failed_gateway_status(&gateway, "bad cert");
        let conditions = failed.conditions.unwrap();
        let programmed = condition(&conditions, "Programmed");
        assert_eq!(programmed.status, "False");
        assert_eq!(programmed.reason, "TranslationError");
        assert_eq!(programmed.message, "bad cert");
        // The Accepted condition from the previous reconciliation stays.
        assert_eq!(condition(&conditions, "Accepted").status, "True");
    }

    #[test]
    fn programmed_flips_back_true_once_valid() {
        let mut gateway = mk_gateway(5);
        gateway.status = Some(failed_gateway_status(&gateway, "broken"));

        let healthy = programmed_gateway_status(&gateway, vec![], vec![]);
        let conditions = healthy.conditions.unwrap();
        assert_eq!(condition(&conditions, "Programmed").status, "True");
        assert_eq!(condition(&conditions, "Accepted").status, "True");
    }

    #[test]
    fn merge_preserves_foreign_parent_statuses() {
        let route: HTTPRoute = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "r", "namespace": "default" },
            "spec": { "parentRefs": [{ "name": "web" }], "rules": [] },
            "status": {
                "parents": [
                    {
                        "controllerName": "example.com/other",
                        "parentRef": { "name": "web" },
                        "conditions": [],
                    },
                    {
                        "controllerName": CONTROLLER_NAME,
                        "parentRef": { "name": "web" },
                        "conditions": [{
                            "type": "Accepted",
                            "status": "True",
                            "reason": "Accepted",
                            "message": "Route is accepted.",
                            "lastTransitionTime": "2026-01-01T00:00:00Z",
                        }],
                    },
                ],
            },
        }))
        .unwrap();

        let new_parent: HTTPRouteStatusParents = serde_json::from_value(serde_json::json!({
            "controllerName": CONTROLLER_NAME,
            "parentRef": { "name": "web" },
            "conditions": [{
                "type": "Accepted",
                "status": "True",
                "reason": "Accepted",
                "message": "Route is accepted.",
                "lastTransitionTime": "2026-02-02T00:00:00Z",
            }],
        }))
        .unwrap();

        let merged = merge_route_parents(
            &route,
            &GatewayRef::new("default", "web"),
            vec![new_parent],
        );
        assert_eq!(merged.parents.len(), 2);
        assert_eq!(merged.parents[0].controller_name, "example.com/other");

        // Semantically unchanged: the old transition time survives.
        let ours = &merged.parents[1];
        let accepted = condition(ours.conditions.as_deref().unwrap(), "Accepted");
        assert!(accepted.last_transition_time.0.to_rfc3339().starts_with("2026-01-01"));
    }

    #[test]
    fn load_balancer_addresses_prefer_ip() {
        let service: Service = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "envoy-proxy-x", "namespace": "default" },
            "status": {
                "loadBalancer": {
                    "ingress": [
                        { "ip": "203.0.113.7" },
                        { "hostname": "lb.example.com" },
                    ],
                },
            },
        }))
        .unwrap();

        let addresses = load_balancer_addresses(&service);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].r#type.as_deref(), Some("IPAddress"));
        assert_eq!(addresses[0].value, "203.0.113.7");
        assert_eq!(addresses[1].r#type.as_deref(), Some("Hostname"));
    }
}
