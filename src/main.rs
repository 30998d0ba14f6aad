#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ai_gateway_controller::{index::Index, k8s, status, Reconciler};
use ai_gateway_controller_xds::ControlPlane;
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[clap(name = "ai-gateway-controller", about = "Gateway API to Envoy xDS control plane")]
struct Args {
    #[clap(
        long,
        default_value = "ai_gateway=info,warn",
        env = "AI_GATEWAY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The Envoy proxy image run for each Gateway.
    #[clap(long)]
    envoy_image: String,

    /// Address the xDS gRPC server binds to.
    #[clap(long, default_value = "0.0.0.0:15001")]
    grpc_addr: SocketAddr,

    /// Interval at which all known Gateways are re-reconciled. `0` disables
    /// the tick.
    #[clap(long, default_value = "30s")]
    resync_period: Period,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        admin,
        client,
        log_level,
        log_format,
        envoy_image,
        grpc_addr,
        resync_period: Period(resync_period),
    } = Args::parse();

    if envoy_image.is_empty() {
        bail!("--envoy-image cannot be empty");
    }

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let index = Index::shared(keys_tx, status_tx.clone());

    // Resource watches feed the shared index, which dispatches Gateway keys
    // onto the work queue.
    let gateway_classes = runtime.watch_all::<k8s::gateway::GatewayClass>(watcher::Config::default());
    tokio::spawn(
        kubert::index::cluster(index.clone(), gateway_classes)
            .instrument(info_span!("gatewayclasses")),
    );

    let gateways = runtime.watch_all::<k8s::gateway::Gateway>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), gateways).instrument(info_span!("gateways")));

    let http_routes = runtime.watch_all::<k8s::gateway::HTTPRoute>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), http_routes).instrument(info_span!("httproutes")),
    );

    let backends = runtime.watch_all::<k8s::Backend>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), backends).instrument(info_span!("backends")));

    let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")));

    let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), secrets).instrument(info_span!("secrets")));

    let endpoint_slices = runtime.watch_all::<k8s::EndpointSlice>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), endpoint_slices)
            .instrument(info_span!("endpointslices")),
    );

    let config_maps = runtime.watch_all::<k8s::ConfigMap>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), config_maps).instrument(info_span!("configmaps")),
    );

    let service_accounts = runtime.watch_all::<k8s::ServiceAccount>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), service_accounts)
            .instrument(info_span!("serviceaccounts")),
    );

    let deployments = runtime.watch_all::<k8s::Deployment>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), deployments).instrument(info_span!("deployments")),
    );

    let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
    tokio::spawn(
        kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
    );

    // The xDS control plane serves connected proxies while the reconciler
    // writes snapshots into it.
    let control_plane = ControlPlane::new();
    {
        let control_plane = control_plane.clone();
        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if let Err(error) = control_plane.serve(grpc_addr, drain).await {
                    tracing::error!(%error, "xDS server failed");
                }
            }
            .instrument(info_span!("xds", port = grpc_addr.port())),
        );
    }

    let status_controller = status::Controller::new(runtime.client(), status_rx);
    tokio::spawn(status_controller.run().instrument(info_span!("status")));

    let reconciler = Reconciler::new(
        runtime.client(),
        index,
        control_plane,
        status_tx,
        envoy_image,
    );
    tokio::spawn(
        reconciler
            .run(keys_rx, resync_period, runtime.shutdown_handle())
            .instrument(info_span!("reconciler")),
    );

    // Block on the shutdown signal; a second signal aborts immediately.
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }

    Ok(())
}

/// A duration flag accepting `30s`, `5m`, a bare number of seconds, or `0`.
#[derive(Clone, Debug)]
struct Period(Duration);

impl std::str::FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(split) => s.split_at(split),
            None => (s, "s"),
        };
        let value: u64 = digits.parse()?;
        let duration = match unit {
            "" | "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "ms" => Duration::from_millis(value),
            unit => bail!("unsupported duration unit {unit:?}"),
        };
        Ok(Self(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_period_flags() {
        assert_eq!("30s".parse::<Period>().unwrap().0, Duration::from_secs(30));
        assert_eq!("5m".parse::<Period>().unwrap().0, Duration::from_secs(300));
        assert_eq!("250ms".parse::<Period>().unwrap().0, Duration::from_millis(250));
        assert_eq!("45".parse::<Period>().unwrap().0, Duration::from_secs(45));
        assert_eq!("0".parse::<Period>().unwrap().0, Duration::ZERO);
        assert!("10h".parse::<Period>().is_err());
        assert!("".parse::<Period>().is_err());
    }
}
