//! SotW discovery services backed by the snapshot cache.
//!
//! ADS and the four per-type services share one stream loop: the first
//! request names the node, each `(type_url, resource_names)` subscription is
//! answered from the current snapshot, and an epoch watch re-sends whatever
//! changed on every push. ACKs advance per-type version bookkeeping; NACKs
//! and re-subscriptions re-send. Delta and fetch variants are not served.

use crate::cache::SnapshotCache;
use crate::resource::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use envoy_api_rs::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_api_rs::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_api_rs::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_api_rs::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_api_rs::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_api_rs::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use tonic::{transport::Server, Request, Response, Status, Streaming};
use futures::prelude::*;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

pub(crate) async fn serve(
    cache: Arc<SnapshotCache>,
    addr: SocketAddr,
    drain: drain::Watch,
) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(DiscoveryServer::aggregated(
                cache.clone(),
            )))
            .add_service(ListenerDiscoveryServiceServer::new(DiscoveryServer::typed(
                cache.clone(),
                LISTENER_TYPE_URL,
            )))
            .add_service(RouteDiscoveryServiceServer::new(DiscoveryServer::typed(
                cache.clone(),
                ROUTE_TYPE_URL,
            )))
            .add_service(ClusterDiscoveryServiceServer::new(DiscoveryServer::typed(
                cache.clone(),
                CLUSTER_TYPE_URL,
            )))
            .add_service(EndpointDiscoveryServiceServer::new(DiscoveryServer::typed(
                cache,
                ENDPOINT_TYPE_URL,
            )))
            .serve_with_shutdown(addr, close_rx.map(|_| ()));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?;
        }
    }
    Ok(())
}

#[derive(Clone)]
struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
    /// The type URL implied by a single-type service; `None` on ADS where
    /// every request carries its own.
    default_type_url: Option<&'static str>,
}

impl DiscoveryServer {
    fn aggregated(cache: Arc<SnapshotCache>) -> Self {
        Self {
            cache,
            default_type_url: None,
        }
    }

    fn typed(cache: Arc<SnapshotCache>, type_url: &'static str) -> Self {
        Self {
            cache,
            default_type_url: Some(type_url),
        }
    }

    fn open_stream(&self, method: &'static str, requests: Streaming<DiscoveryRequest>) -> ResponseStream {
        debug!(%method, "xDS stream opened");
        let (tx, rx) = mpsc::channel(16);
        let stream = StreamState {
            cache: self.cache.clone(),
            default_type_url: self.default_type_url,
            method,
            node_id: None,
            subscriptions: HashMap::new(),
            nonce: 0,
        };
        tokio::spawn(stream.run(requests, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

/// What we last sent to this stream for one type URL.
struct Subscription {
    version: String,
    nonce: String,
    resource_names: Vec<String>,
}

struct StreamState {
    cache: Arc<SnapshotCache>,
    default_type_url: Option<&'static str>,
    method: &'static str,
    node_id: Option<String>,
    subscriptions: HashMap<String, Subscription>,
    nonce: u64,
}

/// Awaits the next snapshot epoch, or forever while no node is known.
async fn epoch_changed(epoch: &mut Option<tokio::sync::watch::Receiver<u64>>) {
    match epoch.as_mut() {
        Some(epoch) => {
            let _ = epoch.changed().await;
        }
        None => futures::future::pending().await,
    }
}

impl StreamState {
    async fn run(
        mut self,
        mut requests: Streaming<DiscoveryRequest>,
        tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) {
        let mut epoch = None;
        loop {
            tokio::select! {
                request = requests.next() => match request {
                    Some(Ok(request)) => {
                        if !self.handle_request(request, &tx).await {
                            break;
                        }
                        if epoch.is_none() {
                            if let Some(node) = &self.node_id {
                                epoch = Some(self.cache.watch(node));
                                // Cover a push that raced the subscription.
                                if !self.resend_changed(&tx).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(error)) => {
                        debug!(method = %self.method, %error, "xDS stream errored");
                        break;
                    }
                    None => break,
                },
                _ = epoch_changed(&mut epoch) => {
                    if !self.resend_changed(&tx).await {
                        break;
                    }
                }
            }
        }
        debug!(method = %self.method, node = ?self.node_id, "xDS stream closed");
    }

    async fn handle_request(
        &mut self,
        request: DiscoveryRequest,
        tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) -> bool {
        if self.node_id.is_none() {
            let Some(node) = request.node.as_ref().filter(|n| !n.id.is_empty()) else {
                warn!(method = %self.method, "Discovery request without a node id");
                return true;
            };
            debug!(method = %self.method, node = %node.id, "xDS node identified");
            self.node_id = Some(node.id.clone());
        }

        let type_url = if request.type_url.is_empty() {
            match self.default_type_url {
                Some(type_url) => type_url.to_string(),
                None => {
                    warn!(method = %self.method, "ADS request without a type URL");
                    return true;
                }
            }
        } else {
            request.type_url.clone()
        };

        debug!(
            method = %self.method,
            %type_url,
            version = %request.version_info,
            nonce = %request.response_nonce,
            nack = request.error_detail.is_some(),
            "Discovery request"
        );

        if let Some(error) = &request.error_detail {
            warn!(method = %self.method, %type_url, message = %error.message, "xDS NACK");
        }

        let resource_names = request.resource_names.clone();
        match self.subscriptions.get_mut(&type_url) {
            Some(sub)
                if request.error_detail.is_none()
                    && request.response_nonce == sub.nonce
                    && request.version_info == sub.version
                    && resource_names == sub.resource_names =>
            {
                // Plain ACK; nothing to send until the snapshot moves.
                return true;
            }
            Some(sub) if request.response_nonce == sub.nonce => {
                // NACK, or the subscription's resource set changed.
                sub.resource_names = resource_names;
            }
            Some(_) => {
                // A stale nonce: the proxy is answering an older response.
                return true;
            }
            None => {
                self.subscriptions.insert(
                    type_url.clone(),
                    Subscription {
                        version: String::new(),
                        nonce: String::new(),
                        resource_names,
                    },
                );
            }
        }

        self.send_current(&type_url, tx).await
    }

    /// Re-sends every subscribed type whose snapshot version moved past what
    /// the stream last saw.
    async fn resend_changed(
        &mut self,
        tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) -> bool {
        let subscribed: Vec<String> = self.subscriptions.keys().cloned().collect();
        for type_url in subscribed {
            let node = self.node_id.clone().unwrap_or_default();
            let version = self
                .cache
                .get(&node)
                .map(|s| s.version().to_string())
                .unwrap_or_default();
            let already_sent = self
                .subscriptions
                .get(&type_url)
                .is_some_and(|sub| sub.version == version);
            if version.is_empty() || already_sent {
                continue;
            }
            if !self.send_current(&type_url, tx).await {
                return false;
            }
        }
        true
    }

    async fn send_current(
        &mut self,
        type_url: &str,
        tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) -> bool {
        let Some(node) = self.node_id.clone() else {
            return true;
        };
        let Some(snapshot) = self.cache.get(&node) else {
            // No snapshot yet; the epoch watch answers once one is pushed.
            return true;
        };

        let Some(sub) = self.subscriptions.get_mut(type_url) else {
            return true;
        };
        let resources = snapshot
            .resources(type_url)
            .iter()
            .filter(|r| sub.resource_names.is_empty() || sub.resource_names.contains(&r.name))
            .map(|r| r.resource.clone())
            .collect::<Vec<_>>();

        self.nonce += 1;
        let nonce = self.nonce.to_string();
        sub.version = snapshot.version().to_string();
        sub.nonce = nonce.clone();

        debug!(
            method = %self.method,
            node = %node,
            %type_url,
            version = %snapshot.version(),
            resources = resources.len(),
            "Discovery response"
        );
        let response = DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources,
            type_url: type_url.to_string(),
            nonce,
            ..Default::default()
        };
        tx.send(Ok(response)).await.is_ok()
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(Response::new(self.open_stream(
            "StreamAggregatedResources",
            request.into_inner(),
        )))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }
}

macro_rules! typed_discovery_service {
    ($trait:ident, $stream_method:ident, $stream_ty:ident, $delta_method:ident, $delta_ty:ident, $fetch_method:ident, $method_name:literal) => {
        #[tonic::async_trait]
        impl $trait for DiscoveryServer {
            type $stream_ty = ResponseStream;
            type $delta_ty = DeltaStream;

            async fn $stream_method(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                Ok(Response::new(
                    self.open_stream($method_name, request.into_inner()),
                ))
            }

            async fn $delta_method(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_ty>, Status> {
                Err(Status::unimplemented("delta xDS is not served"))
            }

            async fn $fetch_method(
                &self,
                _request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                Err(Status::unimplemented("fetch is not served"))
            }
        }
    };
}

typed_discovery_service!(
    ListenerDiscoveryService,
    stream_listeners,
    StreamListenersStream,
    delta_listeners,
    DeltaListenersStream,
    fetch_listeners,
    "StreamListeners"
);
typed_discovery_service!(
    RouteDiscoveryService,
    stream_routes,
    StreamRoutesStream,
    delta_routes,
    DeltaRoutesStream,
    fetch_routes,
    "StreamRoutes"
);
typed_discovery_service!(
    ClusterDiscoveryService,
    stream_clusters,
    StreamClustersStream,
    delta_clusters,
    DeltaClustersStream,
    fetch_clusters,
    "StreamClusters"
);
typed_discovery_service!(
    EndpointDiscoveryService,
    stream_endpoints,
    StreamEndpointsStream,
    delta_endpoints,
    DeltaEndpointsStream,
    fetch_endpoints,
    "StreamEndpoints"
);
