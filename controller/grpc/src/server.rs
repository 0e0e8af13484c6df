use crate::{
    ads::{Connection, Events, ProtocolError},
    metrics::{GrpcServerMetricsFamily, StreamObserver},
};
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use futures::prelude::*;
use gantry_controller_core::status::Outcome;
use gantry_controller_xds::{ResourceType, SnapshotCache, SnapshotRx};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info_span, Instrument};

const SERVICE: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";

/// Serves snapshots to proxies over aggregated discovery streams.
#[derive(Clone, Debug)]
pub struct AdsServer {
    cache: Arc<SnapshotCache>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    config: AdsConfig,
    metrics: GrpcServerMetricsFamily,
    drain: drain::Watch,
}

#[derive(Copy, Clone, Debug)]
pub struct AdsConfig {
    /// Bounds the responses buffered for each proxy.
    pub queue_capacity: usize,

    /// A proxy that does not accept a push within this time is disconnected.
    pub push_timeout: Duration,
}

type ResponseTx = mpsc::Sender<Result<DiscoveryResponse, tonic::Status>>;

/// Why a stream stopped.
enum Closed {
    Disconnected,
    Protocol(ProtocolError),
    Slow,
}

// === impl AdsServer ===

impl AdsServer {
    pub fn new(
        cache: Arc<SnapshotCache>,
        outcomes: mpsc::UnboundedSender<Outcome>,
        config: AdsConfig,
        metrics: GrpcServerMetricsFamily,
        drain: drain::Watch,
    ) -> Self {
        Self {
            cache,
            outcomes,
            config,
            metrics,
            drain,
        }
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    async fn serve_stream<S>(self, requests: S, tx: ResponseTx, mut observer: StreamObserver)
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + Unpin,
    {
        let mut conn = Connection::default();
        let closed = self.run(&mut conn, requests, &tx, &observer).await;
        if let (Some(group), Some(proxy)) = (conn.group(), conn.proxy()) {
            let _ = self.outcomes.send(Outcome::ProxyDisconnected {
                group: group.clone(),
                proxy: proxy.to_string(),
            });
        }
        match closed {
            Closed::Disconnected => tracing::debug!("Disconnected"),
            Closed::Protocol(error) => {
                tracing::info!(%error, "Closing stream");
                observer.end(tonic::Code::InvalidArgument);
                // The stream may already be backed up; the error is best-effort.
                let _ = tx.try_send(Err(tonic::Status::invalid_argument(error.to_string())));
            }
            Closed::Slow => {
                tracing::warn!(timeout = ?self.config.push_timeout, "Proxy is not reading pushes");
                observer.metrics().slow_proxy();
                observer.end(tonic::Code::DeadlineExceeded);
            }
        }
    }

    async fn run<S>(
        &self,
        conn: &mut Connection,
        mut requests: S,
        tx: &ResponseTx,
        observer: &StreamObserver,
    ) -> Closed
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + Unpin,
    {
        let mut snapshots: Option<SnapshotRx> = None;

        let shutdown = self.drain.clone().signaled();
        tokio::pin!(shutdown);

        loop {
            let events = tokio::select! {
                req = requests.next() => match req {
                    Some(Ok(req)) => {
                        observer.msg_received();
                        if snapshots.is_none() {
                            match Connection::requested_group(&req) {
                                Ok(group) => snapshots = Some(self.cache.watch(&group)),
                                Err(error) => return Closed::Protocol(error),
                            }
                        }
                        let snapshot = snapshots
                            .as_mut()
                            .and_then(|rx| rx.borrow_and_update().clone());
                        match conn.on_request(req, snapshot.as_deref()) {
                            Ok(events) => events,
                            Err(error) => return Closed::Protocol(error),
                        }
                    }
                    Some(Err(status)) => {
                        tracing::debug!(%status, "Request stream failed");
                        return Closed::Disconnected;
                    }
                    None => return Closed::Disconnected,
                },

                res = changed(&mut snapshots) => match res {
                    Some(snapshot) => conn.on_snapshot(&snapshot),
                    // The group's snapshot was removed; keep the stream open
                    // until it returns.
                    None => continue,
                },

                // If the server starts shutting down, close the stream so
                // that it doesn't hold the server open.
                _ = &mut shutdown => return Closed::Disconnected,
            };

            if let Err(closed) = self.send(events, tx, observer).await {
                return closed;
            }
        }
    }

    async fn send(
        &self,
        Events {
            responses,
            outcomes,
        }: Events,
        tx: &ResponseTx,
        observer: &StreamObserver,
    ) -> Result<(), Closed> {
        for outcome in outcomes {
            if let Some(ty) = ResourceType::from_type_url(&outcome.type_url) {
                self.metrics.answered(ty, outcome.result.is_ok());
            }
            let _ = self.outcomes.send(Outcome::Discovery(outcome));
        }

        for rsp in responses {
            let ty = ResourceType::from_type_url(&rsp.type_url);
            match time::timeout(self.config.push_timeout, tx.send(Ok(rsp))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Closed::Disconnected),
                Err(_) => return Err(Closed::Slow),
            }
            observer.msg_sent();
            if let Some(ty) = ty {
                self.metrics.pushed(ty);
            }
        }
        Ok(())
    }
}

/// Waits for the next snapshot once the stream is bound to a group.
async fn changed(
    snapshots: &mut Option<SnapshotRx>,
) -> Option<Arc<gantry_controller_xds::Snapshot>> {
    let Some(rx) = snapshots.as_mut() else {
        return future::pending().await;
    };
    if rx.changed().await.is_err() {
        // The cache never drops its senders while the process runs.
        return future::pending().await;
    }
    rx.borrow_and_update().clone()
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, tonic::Status>>;

    async fn stream_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<Self::StreamAggregatedResourcesStream>, tonic::Status> {
        let observer = self
            .metrics
            .bidi_stream_rpc(SERVICE, "StreamAggregatedResources");
        let span = match req.remote_addr() {
            Some(peer) => info_span!("ads", %peer),
            None => info_span!("ads"),
        };
        let requests = req.into_inner();

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        tokio::spawn(
            self.clone()
                .serve_stream(requests, tx, observer)
                .instrument(span),
        );
        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }

    type DeltaAggregatedResourcesStream =
        ReceiverStream<Result<DeltaDiscoveryResponse, tonic::Status>>;

    async fn delta_aggregated_resources(
        &self,
        _req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<Self::DeltaAggregatedResourcesStream>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "incremental discovery is not supported",
        ))
    }
}

// === impl AdsConfig ===

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            push_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests;
