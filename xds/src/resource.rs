//! Typed resource bundle handed from the translator to the snapshot cache,
//! and the `google.protobuf.Any` packing used on the wire.

use envoy_api_rs::pb::envoy::config::cluster::v3::Cluster;
use envoy_api_rs::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_api_rs::pb::envoy::config::listener::v3::Listener;
use envoy_api_rs::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_api_rs::pb::google::protobuf::Any;
use prost::Message;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// One Gateway's worth of xDS state, keyed the way the snapshot stores it.
/// Route configurations are inlined into each listener's connection manager,
/// so `routes` stays empty unless RDS is in use.
#[derive(Clone, Debug, Default)]
pub struct ResourceSet {
    pub listeners: Vec<Listener>,
    pub routes: Vec<RouteConfiguration>,
    pub clusters: Vec<Cluster>,
    pub endpoints: Vec<ClusterLoadAssignment>,
}

impl ResourceSet {
    /// Names of every cluster referenced by this set's clusters. Used by
    /// tests asserting snapshot consistency.
    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Packs a message into `Any` under the given type URL.
pub(crate) fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}
