#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The infra deployer: renders the per-Gateway Envoy Deployment, Service,
//! ConfigMap, and ServiceAccount and applies them with conditional
//! server-side apply. An object that already exists without the managed
//! label is never overwritten.

mod render;

#[cfg(test)]
mod tests;

use ai_gateway_controller_core::{
    managed_label_value, GatewayRef, CONTROLLER_NAME, MANAGED_GATEWAY_LABEL,
};
use ai_gateway_controller_index::{InfraLookup, SharedIndex};
use ai_gateway_controller_k8s_api::{
    gateway::Gateway, registry, Api, Client, ConfigMap, Deployment, DynamicObject, Patch,
    PatchParams, Resource, ResourceExt, Service, ServiceAccount,
};
use anyhow::{anyhow, bail, Context as _, Result};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct Deployer {
    client: Client,
    index: SharedIndex,
    gateway: Gateway,
    gateway_ref: GatewayRef,
    node_id: String,
    envoy_image: String,
}

impl Deployer {
    pub fn new(client: Client, index: SharedIndex, gateway: Gateway, envoy_image: String) -> Self {
        let gateway_ref = GatewayRef::new(
            gateway.namespace().unwrap_or_default(),
            gateway.name_unchecked(),
        );
        let node_id = gateway_ref.node_id();
        Self {
            client,
            index,
            gateway,
            gateway_ref,
            node_id,
            envoy_image,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Renders and applies the gateway's infra, then waits (bounded) for it
    /// to become ready. Readiness failures are logged, not returned: the
    /// snapshot push proceeds regardless.
    pub async fn deploy(&self) -> Result<()> {
        let manifests = render::render_gateway_manifests(
            &self.node_id,
            &self.gateway_ref,
            &self.gateway,
            &self.envoy_image,
        )?;

        for manifest in &manifests {
            self.apply_manifest(manifest)
                .await
                .with_context(|| format!("applying infra for gateway {}", self.gateway_ref))?;
        }

        let (deployment, service) =
            tokio::join!(self.wait_for_deployment(), self.wait_for_service());
        if let Err(error) = deployment {
            tracing::warn!(gateway = %self.gateway_ref, %error, "Envoy deployment not ready");
        }
        if let Err(error) = service {
            tracing::warn!(gateway = %self.gateway_ref, %error, "Envoy service not ready");
        }
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let (mut object, resource) = prepare_manifest(manifest)?;
        let name = object.name_unchecked();
        let namespace = object
            .namespace()
            .unwrap_or_else(|| self.gateway_ref.namespace.clone());

        let lookup = self
            .index
            .read()
            .infra_lookup(&resource.kind, &namespace, &name);
        let (manageable, resource_version) = can_manage(&lookup);
        if !manageable {
            tracing::info!(
                kind = %resource.kind,
                %namespace,
                %name,
                "Skipping unmanaged object; it lacks the managed label"
            );
            return Ok(());
        }
        // Pin the apply to the version our decision was based on.
        object.meta_mut().resource_version = resource_version;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);
        let params = PatchParams::apply(CONTROLLER_NAME).force();
        api.patch(&name, &params, &Patch::Apply(&object))
            .await
            .with_context(|| format!("patch {}/{namespace}/{name}", resource.kind))?;
        tracing::debug!(kind = %resource.kind, %namespace, %name, "Applied infra object");
        Ok(())
    }

    async fn wait_for_deployment(&self) -> Result<()> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), &self.gateway_ref.namespace);
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Ok(deployment) = api.get(&self.node_id).await {
                let available = deployment
                    .status
                    .as_ref()
                    .and_then(|status| status.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Available" && c.status == "True")
                    });
                if available {
                    tracing::debug!(gateway = %self.gateway_ref, "Envoy deployment is available");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for deployment {} to become available", self.node_id);
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_service(&self) -> Result<()> {
        let api = Api::<Service>::namespaced(self.client.clone(), &self.gateway_ref.namespace);
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Ok(service) = api.get(&self.node_id).await {
                let has_cluster_ip = service
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.cluster_ip.as_deref())
                    .is_some_and(|ip| !ip.is_empty());
                if has_cluster_ip {
                    tracing::debug!(gateway = %self.gateway_ref, "Envoy service has a cluster IP");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for service {} to get a cluster IP", self.node_id);
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// Parses a rendered manifest, injects the managed label, and resolves its
/// API resource through the registry. Unknown kinds fail closed.
fn prepare_manifest(manifest: &str) -> Result<(DynamicObject, ai_gateway_controller_k8s_api::ApiResource)> {
    let value: serde_json::Value =
        serde_yaml::from_str(manifest).context("parsing rendered manifest")?;
    let mut object: DynamicObject =
        serde_json::from_value(value).context("manifest is not an object")?;

    object
        .labels_mut()
        .insert(MANAGED_GATEWAY_LABEL.to_string(), managed_label_value());

    let types = object
        .types
        .clone()
        .ok_or_else(|| anyhow!("manifest is missing apiVersion/kind"))?;
    let resource = registry::from_api_version(&types.api_version, &types.kind)
        .ok_or_else(|| anyhow!("unknown GVK {}/{}", types.api_version, types.kind))?;
    Ok((object, resource))
}

/// The conditional-SSA decision: manage unknown and absent objects freely,
/// manage existing objects only when they already carry the managed label.
fn can_manage(lookup: &InfraLookup) -> (bool, Option<String>) {
    match lookup {
        InfraLookup::UnknownKind | InfraLookup::Missing => (true, None),
        InfraLookup::Found {
            managed,
            resource_version,
        } => (*managed, resource_version.clone()),
    }
}

/// Deletes the four owned infra objects of a Gateway. NotFound is not an
/// error; anything else is.
pub async fn delete_gateway_infra(client: &Client, gateway: &GatewayRef) -> Result<()> {
    let node_id = gateway.node_id();
    let namespace = &gateway.namespace;
    tracing::info!(gateway = %gateway, %node_id, "Deleting gateway infrastructure");

    delete_ignoring_not_found(
        Api::<Deployment>::namespaced(client.clone(), namespace),
        &node_id,
    )
    .await
    .with_context(|| format!("deleting deployment {namespace}/{node_id}"))?;
    delete_ignoring_not_found(
        Api::<Service>::namespaced(client.clone(), namespace),
        &node_id,
    )
    .await
    .with_context(|| format!("deleting service {namespace}/{node_id}"))?;
    delete_ignoring_not_found(
        Api::<ConfigMap>::namespaced(client.clone(), namespace),
        &node_id,
    )
    .await
    .with_context(|| format!("deleting configmap {namespace}/{node_id}"))?;
    delete_ignoring_not_found(
        Api::<ServiceAccount>::namespaced(client.clone(), namespace),
        &node_id,
    )
    .await
    .with_context(|| format!("deleting serviceaccount {namespace}/{node_id}"))?;

    Ok(())
}

async fn delete_ignoring_not_found<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error.into()),
    }
}
