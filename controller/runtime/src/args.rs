use crate::{
    core::{RoutePrecedence, GATEWAY_CONTROLLER_NAME},
    grpc,
    index::{self, Store},
    k8s::{self, watcher},
    lease,
    reconcile::{Pipeline, Scheduler, SchedulerMetrics},
    status,
    xds::SnapshotCache,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of status patches to buffer. As a conservative estimate,
// we assume that sending a patch will take at least 1ms, so we set the buffer
// size to be the same as the reconciliation period in milliseconds.
const STATUS_UPDATE_QUEUE_SIZE: usize = RECONCILIATION_PERIOD.as_millis() as usize;

#[derive(Debug, Parser)]
#[clap(name = "gantry", about = "A Gateway API controller serving Envoy")]
pub struct Args {
    #[clap(
        long,
        default_value = "gantry=info,warn",
        env = "GANTRY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:18000")]
    grpc_addr: SocketAddr,

    /// The GatewayClass controller name this controller handles.
    #[clap(long, default_value = GATEWAY_CONTROLLER_NAME)]
    controller_name: String,

    /// The order in which routes are compared when their matches overlap.
    #[clap(long, default_value = "specificity,created,name")]
    route_precedence: RoutePrecedence,

    /// How long a proxy may take to accept a discovery response before it
    /// is disconnected.
    #[clap(long, default_value = "10000")]
    push_timeout_ms: u64,

    /// The number of discovery responses buffered for each proxy.
    #[clap(long, default_value = "16")]
    push_queue_capacity: usize,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    #[clap(long, default_value = "gantry-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "gantry-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "gantry-controller-status")]
    lease_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            controller_name,
            route_precedence,
            push_timeout_ms,
            push_queue_capacity,
            patch_timeout_ms,
            control_plane_namespace,
            controller_deployment_name,
            lease_name,
        } = self;

        // Group changes flow from the store to the scheduler; outcomes flow
        // from the scheduler and the discovery server to the status index.
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let store = Store::shared(controller_name.clone(), changes_tx);
        let cache = Arc::new(SnapshotCache::default());

        let mut prom = <Registry>::default();
        let store_metrics = prom.sub_registry_with_prefix("store");
        index::metrics::register_dependencies(store.clone(), store_metrics);
        let indexed = index::metrics::IndexMetrics::register(store.clone(), store_metrics).shared();
        let scheduler_metrics =
            SchedulerMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let grpc_metrics = grpc::metrics::GrpcServerMetricsFamily::register(
            prom.sub_registry_with_prefix("grpc_server"),
        );
        let resource_status = prom.sub_registry_with_prefix("resource_status");
        let status_metrics = status::ControllerMetrics::register(resource_status);
        let status_index_metrics = status::IndexMetrics::register(resource_status);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &control_plane_namespace,
            &controller_deployment_name,
            &lease_name,
            &hostname,
        )
        .await?;

        // Build the status index which will maintain information necessary for
        // updating the status field of gateway resources.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_index = status::Index::shared(
            hostname.clone(),
            controller_name,
            claims.clone(),
            updates_tx,
            status_index_metrics,
        );

        // Spawn resource watches.

        let classes = runtime.watch_all::<k8s::GatewayClass>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(indexed.clone(), classes)
                .instrument(info_span!("gatewayclasses")),
        );

        let status_classes = runtime.watch_all::<k8s::GatewayClass>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(status_index.clone(), status_classes)
                .instrument(info_span!("gatewayclasses.status")),
        );

        let gateways = runtime.watch_all::<k8s::Gateway>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), gateways)
                .instrument(info_span!("gateways")),
        );

        let http_routes = runtime.watch_all::<k8s::HttpRoute>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), http_routes)
                .instrument(info_span!("httproutes")),
        );

        let grants = runtime.watch_all::<k8s::ReferenceGrant>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), grants)
                .instrument(info_span!("referencegrants")),
        );

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), services)
                .instrument(info_span!("services")),
        );

        let slices = runtime.watch_all::<k8s::EndpointSlice>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), slices)
                .instrument(info_span!("endpointslices")),
        );

        let backends = runtime.watch_all::<k8s::Backend>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), backends)
                .instrument(info_span!("backends")),
        );

        // Only certificate secrets are of interest.
        let secrets = runtime.watch_all::<k8s::Secret>(
            watcher::Config::default().fields(&format!("type={}", k8s::TLS_SECRET_TYPE)),
        );
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), secrets).instrument(info_span!("secrets")),
        );

        let policies = runtime.watch_all::<k8s::TrafficPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed, policies).instrument(info_span!("trafficpolicies")),
        );

        // Reconcile groups as the store reports changes.
        let pipeline = Pipeline::new(store, cache.clone(), outcomes_tx.clone(), route_precedence);
        tokio::spawn(
            Scheduler::new(Arc::new(pipeline), changes_rx, scheduler_metrics)
                .run(runtime.shutdown_handle())
                .instrument(info_span!("scheduler")),
        );

        // Spawn the status index and controller. Patches the controller fails
        // to write are reported back so the index can queue them again.
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            status::Index::run(status_index, outcomes_rx, failures_rx, RECONCILIATION_PERIOD)
                .instrument(info_span!("status_index")),
        );
        let status_controller = status::Controller::new(
            hostname,
            claims,
            runtime.client(),
            updates_rx,
            failures_tx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Run the gRPC server, serving snapshots from the cache.
        let ads = grpc::AdsServer::new(
            cache,
            outcomes_tx,
            grpc::AdsConfig {
                queue_capacity: push_queue_capacity,
                push_timeout: Duration::from_millis(push_timeout_ms),
            },
            grpc_metrics,
            runtime.shutdown_handle(),
        );
        tokio::spawn(serve_grpc(grpc_addr, ads, runtime.shutdown_handle()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve_grpc(addr: SocketAddr, ads: grpc::AdsServer, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(ads.svc())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
