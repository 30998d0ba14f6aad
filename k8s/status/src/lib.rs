#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Status writing for Gateway API resources.
//!
//! Condition changes flow through an unbounded channel of [`Update`]s into the
//! [`Controller`], which patches the `status` subresource of the target
//! object. Patch failures are logged and never propagated back to the
//! reconciler.

pub mod conditions;

#[cfg(test)]
mod tests;

use ai_gateway_controller_k8s_api::{
    gateway::{Gateway, GatewayClass, GatewayClassStatus, GatewayStatus, HTTPRoute,
        HTTPRouteStatus},
    Api, Client, Patch, PatchParams, ResourceId,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub use self::conditions::set_status_condition;

/// A status write destined for the API server.
#[derive(Clone, Debug)]
pub enum Update {
    GatewayClass {
        name: String,
        status: GatewayClassStatus,
    },
    Gateway {
        id: ResourceId,
        status: GatewayStatus,
    },
    HttpRoute {
        id: ResourceId,
        status: HTTPRouteStatus,
    },
}

pub type UpdateSender = UnboundedSender<Update>;

/// Drains [`Update`]s and applies each as a merge patch on the target's
/// `status` subresource.
pub struct Controller {
    client: Client,
    updates: UnboundedReceiver<Update>,
}

impl Controller {
    pub fn new(client: Client, updates: UnboundedReceiver<Update>) -> Self {
        Self { client, updates }
    }

    pub async fn run(mut self) {
        let params = PatchParams::apply(ai_gateway_controller_core::CONTROLLER_NAME);

        while let Some(update) = self.updates.recv().await {
            match update {
                Update::GatewayClass { name, status } => {
                    let api = Api::<GatewayClass>::all(self.client.clone());
                    let patch = serde_json::json!({
                        "apiVersion": "gateway.networking.k8s.io/v1",
                        "kind": "GatewayClass",
                        "status": status,
                    });
                    if let Err(error) = api.patch_status(&name, &params, &Patch::Merge(patch)).await
                    {
                        tracing::warn!(%name, %error, "Failed to patch GatewayClass status");
                    }
                }
                Update::Gateway { id, status } => {
                    let api = Api::<Gateway>::namespaced(self.client.clone(), &id.namespace);
                    let patch = serde_json::json!({
                        "apiVersion": "gateway.networking.k8s.io/v1",
                        "kind": "Gateway",
                        "status": status,
                    });
                    if let Err(error) =
                        api.patch_status(&id.name, &params, &Patch::Merge(patch)).await
                    {
                        tracing::warn!(
                            namespace = %id.namespace,
                            name = %id.name,
                            %error,
                            "Failed to patch Gateway status"
                        );
                    }
                }
                Update::HttpRoute { id, status } => {
                    let api = Api::<HTTPRoute>::namespaced(self.client.clone(), &id.namespace);
                    let patch = serde_json::json!({
                        "apiVersion": "gateway.networking.k8s.io/v1",
                        "kind": "HTTPRoute",
                        "status": status,
                    });
                    if let Err(error) =
                        api.patch_status(&id.name, &params, &Patch::Merge(patch)).await
                    {
                        tracing::warn!(
                            namespace = %id.namespace,
                            name = %id.name,
                            %error,
                            "Failed to patch HTTPRoute status"
                        );
                    }
                }
            }
        }
    }
}
