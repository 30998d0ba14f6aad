use crate::resource::{
    to_any, ResourceSet, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
};
use ahash::AHashMap as HashMap;
use envoy_api_rs::pb::google::protobuf::Any;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// A named resource as it appears in a discovery response.
#[derive(Clone, Debug)]
pub struct NamedResource {
    pub name: String,
    pub resource: Any,
}

/// A versioned, immutable bundle of xDS resources for one node. Every type
/// shares the snapshot's version string.
#[derive(Debug)]
pub struct Snapshot {
    version: String,
    resources: HashMap<&'static str, Vec<NamedResource>>,
}

impl Snapshot {
    pub fn new(version: String, set: &ResourceSet) -> Self {
        let mut resources: HashMap<&'static str, Vec<NamedResource>> = HashMap::new();
        resources.insert(
            LISTENER_TYPE_URL,
            set.listeners
                .iter()
                .map(|l| NamedResource {
                    name: l.name.clone(),
                    resource: to_any(LISTENER_TYPE_URL, l),
                })
                .collect(),
        );
        resources.insert(
            ROUTE_TYPE_URL,
            set.routes
                .iter()
                .map(|r| NamedResource {
                    name: r.name.clone(),
                    resource: to_any(ROUTE_TYPE_URL, r),
                })
                .collect(),
        );
        resources.insert(
            CLUSTER_TYPE_URL,
            set.clusters
                .iter()
                .map(|c| NamedResource {
                    name: c.name.clone(),
                    resource: to_any(CLUSTER_TYPE_URL, c),
                })
                .collect(),
        );
        resources.insert(
            ENDPOINT_TYPE_URL,
            set.endpoints
                .iter()
                .map(|e| NamedResource {
                    name: e.cluster_name.clone(),
                    resource: to_any(ENDPOINT_TYPE_URL, e),
                })
                .collect(),
        );
        Self { version, resources }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn resources(&self, type_url: &str) -> &[NamedResource] {
        self.resources.get(type_url).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct Entry {
    snapshot: Option<Arc<Snapshot>>,
    epoch: watch::Sender<u64>,
}

impl Entry {
    fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            snapshot: None,
            epoch,
        }
    }
}

/// Thread-safe snapshot store keyed by node id. Streams subscribe to a
/// node's epoch channel and re-read the snapshot whenever it ticks; the swap
/// is atomic so readers observe either the old or the new snapshot, never a
/// mix.
#[derive(Default)]
pub struct SnapshotCache {
    nodes: RwLock<HashMap<String, Entry>>,
}

impl SnapshotCache {
    pub fn set(&self, node_id: &str, snapshot: Snapshot) {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .entry(node_id.to_string())
            .or_insert_with(Entry::new);
        entry.snapshot = Some(Arc::new(snapshot));
        entry.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.nodes.read().get(node_id)?.snapshot.clone()
    }

    pub fn remove(&self, node_id: &str) {
        if let Some(entry) = self.nodes.write().get_mut(node_id) {
            entry.snapshot = None;
            entry.epoch.send_modify(|epoch| *epoch += 1);
        }
    }

    /// Subscribes to snapshot changes for `node_id`, creating the entry when
    /// the proxy connects before its first snapshot is pushed.
    pub fn watch(&self, node_id: &str) -> watch::Receiver<u64> {
        let mut nodes = self.nodes.write();
        nodes
            .entry(node_id.to_string())
            .or_insert_with(Entry::new)
            .epoch
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_wakes_on_set_and_remove() {
        let cache = SnapshotCache::default();
        let mut rx = cache.watch("node");
        assert!(!rx.has_changed().unwrap());

        cache.set("node", Snapshot::new("1".into(), &ResourceSet::default()));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();
        assert!(cache.get("node").is_some());

        cache.remove("node");
        assert!(rx.has_changed().unwrap());
        assert!(cache.get("node").is_none());
    }
}
