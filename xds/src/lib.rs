#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The xDS side of the control plane: a snapshot cache keyed by Envoy node
//! id, and the ADS / LDS / RDS / CDS / EDS gRPC services that stream cached
//! snapshots to connected proxies.
//!
//! The reconciler is the only writer (through [`ControlPlane::push`]); the
//! gRPC streams are readers woken through a per-node epoch channel.

mod cache;
mod resource;
mod server;

pub use self::cache::{NamedResource, Snapshot, SnapshotCache};
pub use self::resource::{
    ResourceSet, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Default)]
pub struct ControlPlane {
    cache: Arc<SnapshotCache>,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new snapshot for `node_id`. All resource types share one
    /// version so a proxy never observes a listener whose cluster is missing
    /// within a single snapshot.
    pub fn push(&self, node_id: &str, resources: &ResourceSet) {
        let version = next_version();
        let snapshot = Snapshot::new(version.clone(), resources);
        tracing::debug!(
            node = %node_id,
            %version,
            listeners = resources.listeners.len(),
            clusters = resources.clusters.len(),
            endpoints = resources.endpoints.len(),
            "Installing xDS snapshot"
        );
        self.cache.set(node_id, snapshot);
    }

    /// Drops the node's snapshot, e.g. when its Gateway is deleted.
    pub fn evict(&self, node_id: &str) {
        self.cache.remove(node_id);
    }

    pub fn snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.cache.get(node_id)
    }

    /// Serves the discovery gRPC services on `addr` until `drain` fires,
    /// then performs a graceful stop.
    pub async fn serve(&self, addr: SocketAddr, drain: drain::Watch) -> Result<()> {
        server::serve(self.cache.clone(), addr, drain).await
    }
}

/// Monotonic snapshot version: nanoseconds since the epoch.
fn next_version() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_api_rs::pb::envoy::config::cluster::v3::Cluster;
    use envoy_api_rs::pb::envoy::config::listener::v3::Listener;

    fn mk_set() -> ResourceSet {
        ResourceSet {
            listeners: vec![Listener {
                name: "listener-80".to_string(),
                ..Default::default()
            }],
            clusters: vec![Cluster {
                name: "ns1-api".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn push_installs_a_consistent_snapshot() {
        let cp = ControlPlane::new();
        cp.push("envoy-proxy-abcdef012345", &mk_set());

        let snapshot = cp.snapshot("envoy-proxy-abcdef012345").unwrap();
        let listeners = snapshot.resources(LISTENER_TYPE_URL);
        let clusters = snapshot.resources(CLUSTER_TYPE_URL);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].name, "listener-80");
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "ns1-api");
        assert!(snapshot.resources(ENDPOINT_TYPE_URL).is_empty());
    }

    #[test]
    fn versions_are_monotonic_per_push() {
        let cp = ControlPlane::new();
        cp.push("node", &mk_set());
        let first = cp.snapshot("node").unwrap().version().to_string();
        cp.push("node", &mk_set());
        let second = cp.snapshot("node").unwrap().version().to_string();
        assert!(second.parse::<u128>().unwrap() >= first.parse::<u128>().unwrap());
    }

    #[test]
    fn evict_removes_the_snapshot() {
        let cp = ControlPlane::new();
        cp.push("node", &mk_set());
        cp.evict("node");
        assert!(cp.snapshot("node").is_none());
    }
}
