use super::*;
use envoy_types::pb::envoy::config::core::v3::Node;
use gantry_controller_core::{
    http_route::{HttpRouteMatch, StatusCode},
    ir::{self, GatewayIr, Protocol, Route, RouteAction, RouteId},
    GroupId, ObjectId,
};
use gantry_controller_xds::translate;
use prometheus_client::registry::Registry;

struct Proxy {
    requests: mpsc::Sender<Result<DiscoveryRequest, tonic::Status>>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, tonic::Status>>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    cache: Arc<SnapshotCache>,
    task: tokio::task::JoinHandle<()>,
}

fn group() -> GroupId {
    GroupId::new("ns", "gw")
}

fn spawn(config: AdsConfig) -> (Proxy, drain::Signal) {
    let cache = Arc::new(SnapshotCache::default());
    let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
    let (signal, drain) = drain::channel();
    let server = AdsServer::new(
        cache.clone(),
        outcomes_tx,
        config,
        GrpcServerMetricsFamily::register(&mut Registry::default()),
        drain,
    );

    let (requests, requests_rx) = mpsc::channel(8);
    let (tx, responses) = mpsc::channel(config.queue_capacity);
    let observer = server
        .metrics
        .bidi_stream_rpc(SERVICE, "StreamAggregatedResources");
    let task = tokio::spawn(server.serve_stream(ReceiverStream::new(requests_rx), tx, observer));
    let proxy = Proxy {
        requests,
        responses,
        outcomes,
        cache,
        task,
    };
    (proxy, signal)
}

/// A gateway that fails every request, so it needs no backends.
fn publish(cache: &SnapshotCache, status: StatusCode) {
    let ir = GatewayIr {
        id: group(),
        listeners: vec![ir::Listener {
            name: "http".to_string(),
            bind: ([0, 0, 0, 0], 80).into(),
            hostname: None,
            protocol: Protocol::Http,
            routes: vec![Route {
                id: RouteId {
                    route: ObjectId::new("ns", "r"),
                    rule: 0,
                    match_index: 0,
                },
                creation_timestamp: None,
                hostnames: vec![],
                matches: HttpRouteMatch::default(),
                action: RouteAction::Fail { status },
                policies: vec![],
                priority: 0,
            }],
        }],
        backends: Default::default(),
    };
    cache.publish(&group(), translate(&ir).expect("translates"));
}

fn request(ty: ResourceType, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(Node {
            id: "envoy-0".to_string(),
            cluster: "ns/gw".to_string(),
            ..Default::default()
        }),
        type_url: ty.type_url().to_string(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}

impl Proxy {
    async fn send(&self, req: DiscoveryRequest) {
        self.requests.send(Ok(req)).await.expect("stream is open");
    }

    async fn recv(&mut self) -> DiscoveryResponse {
        self.responses
            .recv()
            .await
            .expect("stream is open")
            .expect("response")
    }
}

#[tokio::test]
async fn pushes_snapshots_and_reports_acks() {
    let (mut proxy, _signal) = spawn(AdsConfig::default());
    proxy.send(request(ResourceType::Listener, "")).await;

    // Nothing is sent until the group is published.
    tokio::task::yield_now().await;
    assert!(proxy.responses.try_recv().is_err());
    publish(&proxy.cache, StatusCode::SERVICE_UNAVAILABLE);
    let rsp = proxy.recv().await;
    assert_eq!(rsp.type_url, ResourceType::Listener.type_url());
    assert_eq!(rsp.version_info, "1");
    assert_eq!(rsp.resources.len(), 1);

    proxy
        .send(request(ResourceType::Listener, &rsp.nonce))
        .await;
    match proxy.outcomes.recv().await {
        Some(Outcome::Discovery(outcome)) => {
            assert_eq!(outcome.group, group());
            assert_eq!(outcome.proxy, "envoy-0");
            assert_eq!(outcome.version, 1);
            assert_eq!(outcome.result, Ok(()));
        }
        outcome => panic!("unexpected outcome: {outcome:?}"),
    }

    // Listener content did not change.
    publish(&proxy.cache, StatusCode::BAD_GATEWAY);
    proxy.send(request(ResourceType::RouteConfiguration, "")).await;
    let rsp = proxy.recv().await;
    assert_eq!(rsp.type_url, ResourceType::RouteConfiguration.type_url());
    assert_eq!(rsp.version_info, "2");
}

#[tokio::test]
async fn protocol_errors_close_the_stream() {
    let (mut proxy, _signal) = spawn(AdsConfig::default());
    let mut req = request(ResourceType::Cluster, "");
    req.node = None;
    proxy.send(req).await;

    let status = proxy
        .responses
        .recv()
        .await
        .expect("error is sent")
        .expect_err("stream fails");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(proxy.responses.recv().await.is_none());
    proxy.task.await.expect("task completes");
}

#[tokio::test]
async fn slow_proxies_are_disconnected() {
    let (mut proxy, _signal) = spawn(AdsConfig {
        queue_capacity: 1,
        push_timeout: Duration::from_millis(10),
    });
    publish(&proxy.cache, StatusCode::SERVICE_UNAVAILABLE);
    proxy.send(request(ResourceType::Cluster, "")).await;
    proxy.send(request(ResourceType::Listener, "")).await;

    // The second push cannot be queued while the first is unread.
    proxy.task.await.expect("task completes");
    assert!(proxy.responses.recv().await.is_some());
    assert!(proxy.responses.recv().await.is_none());
}

#[tokio::test]
async fn draining_closes_streams() {
    let (mut proxy, signal) = spawn(AdsConfig::default());
    proxy.send(request(ResourceType::Cluster, "")).await;
    signal.drain().await;
    assert!(proxy.responses.recv().await.is_none());
}

#[tokio::test]
async fn closed_streams_report_their_proxy() {
    let (mut proxy, _signal) = spawn(AdsConfig::default());
    publish(&proxy.cache, StatusCode::SERVICE_UNAVAILABLE);
    proxy.send(request(ResourceType::Listener, "")).await;
    proxy.recv().await;

    drop(proxy.requests);
    proxy.task.await.expect("task completes");
    match proxy.outcomes.recv().await {
        Some(Outcome::ProxyDisconnected { group: g, proxy: id }) => {
            assert_eq!(g, group());
            assert_eq!(id, "envoy-0");
        }
        outcome => panic!("unexpected outcome: {outcome:?}"),
    }
}
