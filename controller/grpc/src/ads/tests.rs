use super::*;
use envoy_types::pb::google::rpc::Status;
use gantry_controller_core::{
    http_route::{HttpRouteMatch, PathMatch},
    ir::{self, Backend, Endpoint, GatewayIr, Protocol, Route, RouteAction, RouteId, WeightedBackend},
    ObjectId,
};
use gantry_controller_xds::{translate, Publish, SnapshotCache};
use maplit::btreemap;
use std::sync::Arc;

const BACKEND: &str = "backend/ns/b";

fn group() -> GroupId {
    GroupId::new("ns", "gw")
}

fn node() -> Node {
    Node {
        id: "envoy-0".to_string(),
        cluster: "ns/gw".to_string(),
        ..Default::default()
    }
}

fn ir(path: &str, endpoints: &[&str]) -> GatewayIr {
    GatewayIr {
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
                matches: HttpRouteMatch {
                    path: PathMatch::Prefix(path.to_string()),
                    ..Default::default()
                },
                action: RouteAction::Forward(vec![WeightedBackend {
                    name: BACKEND.to_string(),
                    weight: 1,
                }]),
                policies: vec![],
                priority: 0,
            }],
        }],
        backends: btreemap! {
            BACKEND.to_string() => Backend {
                name: BACKEND.to_string(),
                endpoints: endpoints
                    .iter()
                    .map(|addr| Endpoint {
                        addr: addr.parse().expect("socket address"),
                        weight: 1,
                        healthy: true,
                    })
                    .collect(),
            },
        },
    }
}

struct Harness {
    cache: SnapshotCache,
    conn: Connection,
}

impl Harness {
    fn new() -> Self {
        Self {
            cache: SnapshotCache::default(),
            conn: Connection::default(),
        }
    }

    fn publish(&self, path: &str, endpoints: &[&str]) -> Arc<Snapshot> {
        self.publish_ir(&ir(path, endpoints))
    }

    fn publish_ir(&self, ir: &GatewayIr) -> Arc<Snapshot> {
        let resources = translate(ir).expect("translates");
        let publish = self.cache.publish(&group(), resources);
        assert!(matches!(publish, Publish::Updated { .. }), "{publish:?}");
        self.current().expect("published")
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.cache.get(&group())
    }

    fn request(&mut self, req: DiscoveryRequest) -> Events {
        let snapshot = self.current();
        self.conn
            .on_request(req, snapshot.as_deref())
            .expect("valid request")
    }

    fn subscribe(&mut self, ty: ResourceType) -> Events {
        self.request(request(ty, "", &[]))
    }

    fn ack(&mut self, rsp: &DiscoveryResponse) -> Events {
        self.request(answer(rsp, None))
    }

    fn nack(&mut self, rsp: &DiscoveryResponse) -> Events {
        self.request(answer(rsp, Some("rejected")))
    }

    fn snapshot(&mut self, snapshot: &Snapshot) -> Events {
        self.conn.on_snapshot(snapshot)
    }

    /// Subscribes to and acks every type.
    fn converge(&mut self) {
        for ty in ResourceType::ALL {
            let events = self.subscribe(ty);
            assert_eq!(events.responses.len(), 1, "{ty}");
            let events = self.ack(&events.responses[0]);
            assert!(events.responses.is_empty(), "{ty}");
        }
    }
}

fn request(ty: ResourceType, nonce: &str, names: &[&str]) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(node()),
        type_url: ty.type_url().to_string(),
        response_nonce: nonce.to_string(),
        resource_names: names.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    }
}

fn answer(rsp: &DiscoveryResponse, error: Option<&str>) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(node()),
        version_info: rsp.version_info.clone(),
        type_url: rsp.type_url.clone(),
        response_nonce: rsp.nonce.clone(),
        error_detail: error.map(|message| Status {
            code: 3,
            message: message.to_string(),
            details: vec![],
        }),
        ..Default::default()
    }
}

fn pushed(events: &Events) -> Vec<(ResourceType, &str)> {
    events
        .responses
        .iter()
        .map(|rsp| {
            let ty = ResourceType::from_type_url(&rsp.type_url).expect("known type");
            (ty, rsp.version_info.as_str())
        })
        .collect()
}

#[test]
fn first_request_must_name_a_group() {
    let mut conn = Connection::default();
    let mut req = request(ResourceType::Cluster, "", &[]);
    req.node = None;
    assert_eq!(
        conn.on_request(req, None).unwrap_err(),
        ProtocolError::MissingNode
    );

    let mut req = request(ResourceType::Cluster, "", &[]);
    req.node = Some(Node {
        cluster: "gw".to_string(),
        ..node()
    });
    assert_eq!(
        conn.on_request(req, None).unwrap_err(),
        ProtocolError::InvalidCluster("gw".to_string())
    );

    let events = conn
        .on_request(request(ResourceType::Cluster, "", &[]), None)
        .expect("valid request");
    assert!(events.responses.is_empty());
    assert_eq!(conn.group(), Some(&group()));
    assert_eq!(conn.proxy(), Some("envoy-0"));
}

#[test]
fn later_requests_cannot_change_the_node() {
    let mut h = Harness::new();
    h.subscribe(ResourceType::Cluster);

    let mut req = request(ResourceType::Listener, "", &[]);
    req.node = Some(Node {
        cluster: "ns/other".to_string(),
        ..node()
    });
    assert!(matches!(
        h.conn.on_request(req, None),
        Err(ProtocolError::NodeChanged { .. })
    ));

    // Requests may omit the node once bound.
    let mut req = request(ResourceType::Listener, "", &[]);
    req.node = None;
    assert!(h.conn.on_request(req, None).is_ok());
}

#[test]
fn unsupported_types_are_rejected() {
    let mut conn = Connection::default();
    let mut req = request(ResourceType::Cluster, "", &[]);
    req.type_url = "type.googleapis.com/envoy.service.runtime.v3.Runtime".to_string();
    assert!(matches!(
        conn.on_request(req, None),
        Err(ProtocolError::UnsupportedType(_))
    ));
}

#[test]
fn subscriptions_receive_the_current_snapshot() {
    let mut h = Harness::new();
    assert!(h.subscribe(ResourceType::Cluster).responses.is_empty());

    let snapshot = h.publish("/foo", &["10.0.0.1:8080"]);
    let events = h.snapshot(&snapshot);
    assert_eq!(pushed(&events), [(ResourceType::Cluster, "1")]);
    assert_eq!(events.responses[0].nonce, "1");
    assert_eq!(events.responses[0].resources.len(), 1);

    // Later subscriptions are answered immediately.
    let events = h.subscribe(ResourceType::Listener);
    assert_eq!(pushed(&events), [(ResourceType::Listener, "1")]);
    assert_eq!(events.responses[0].nonce, "2");
}

#[test]
fn updates_push_changed_types_in_dependency_order() {
    let mut h = Harness::new();
    h.publish("/foo", &["10.0.0.1:8080"]);
    h.converge();

    // Only endpoints changed.
    let snapshot = h.publish("/foo", &["10.0.0.2:8080"]);
    let events = h.snapshot(&snapshot);
    assert_eq!(pushed(&events), [(ResourceType::ClusterLoadAssignment, "2")]);
    h.ack(&events.responses[0]);

    let snapshot = h.publish("/bar", &[]);
    let events = h.snapshot(&snapshot);
    assert_eq!(
        pushed(&events),
        [
            (ResourceType::ClusterLoadAssignment, "3"),
            (ResourceType::RouteConfiguration, "3"),
        ]
    );

    // Re-delivering the same snapshot pushes nothing.
    for rsp in &events.responses {
        assert!(h.ack(rsp).responses.is_empty());
    }
    assert!(h.snapshot(&snapshot).responses.is_empty());
}

#[test]
fn unacked_types_wait_for_the_proxy() {
    let mut h = Harness::new();
    h.publish("/foo", &["10.0.0.1:8080"]);
    let first = h.subscribe(ResourceType::ClusterLoadAssignment);
    assert_eq!(pushed(&first), [(ResourceType::ClusterLoadAssignment, "1")]);

    let second = h.publish("/foo", &["10.0.0.2:8080"]);
    assert!(h.snapshot(&second).responses.is_empty());
    let third = h.publish("/foo", &["10.0.0.3:8080"]);
    assert!(h.snapshot(&third).responses.is_empty());

    // The ack releases the latest snapshot only.
    let events = h.ack(&first.responses[0]);
    assert_eq!(pushed(&events), [(ResourceType::ClusterLoadAssignment, "3")]);
    assert_eq!(events.outcomes.len(), 1);
    assert_eq!(events.outcomes[0].version, 1);
    assert_eq!(events.outcomes[0].result, Ok(()));
}

#[test]
fn routes_wait_for_the_clusters_they_reference() {
    let mut h = Harness::new();
    h.publish("/foo", &["10.0.0.1:8080"]);
    let clusters = h.subscribe(ResourceType::Cluster);
    assert_eq!(pushed(&clusters), [(ResourceType::Cluster, "1")]);
    let routes = h.subscribe(ResourceType::RouteConfiguration);
    assert_eq!(pushed(&routes), [(ResourceType::RouteConfiguration, "1")]);
    assert!(h.ack(&routes.responses[0]).responses.is_empty());

    // The route moves to a backend the proxy has not been sent yet.
    const NEW: &str = "backend/ns/new";
    let mut next = ir("/foo", &["10.0.0.1:8080"]);
    next.listeners[0].routes[0].action = RouteAction::Forward(vec![WeightedBackend {
        name: NEW.to_string(),
        weight: 1,
    }]);
    next.backends.insert(
        NEW.to_string(),
        Backend {
            name: NEW.to_string(),
            endpoints: vec![Endpoint {
                addr: "10.0.0.9:8080".parse().expect("socket address"),
                weight: 1,
                healthy: true,
            }],
        },
    );
    let v2 = h.publish_ir(&next);

    // Clusters are still awaiting an answer, so routes are held too.
    assert!(h.snapshot(&v2).responses.is_empty());

    let events = h.ack(&clusters.responses[0]);
    assert_eq!(
        pushed(&events),
        [
            (ResourceType::Cluster, "2"),
            (ResourceType::RouteConfiguration, "2"),
        ]
    );
}

#[test]
fn rejected_versions_are_not_resent() {
    let mut h = Harness::new();
    h.publish("/foo", &["10.0.0.1:8080"]);
    h.converge();
    h.publish("/foo", &["10.0.0.2:8080"]);
    let v3 = h.publish("/bar", &["10.0.0.2:8080"]);
    assert_eq!(v3.version(), 3);

    let events = h.snapshot(&v3);
    assert_eq!(
        pushed(&events),
        [
            (ResourceType::ClusterLoadAssignment, "3"),
            (ResourceType::RouteConfiguration, "3"),
        ]
    );
    h.ack(&events.responses[0]);

    let events = h.nack(&events.responses[1]);
    assert!(events.responses.is_empty());
    assert_eq!(events.outcomes.len(), 1);
    assert_eq!(events.outcomes[0].version, 3);
    assert_eq!(events.outcomes[0].result, Err("rejected".to_string()));
    assert_eq!(
        events.outcomes[0].type_url,
        ResourceType::RouteConfiguration.type_url()
    );
    assert!(h.snapshot(&v3).responses.is_empty());

    // An unrelated change resends routes at the new version.
    let v4 = h.publish("/bar", &["10.0.0.3:8080"]);
    let events = h.snapshot(&v4);
    assert_eq!(
        pushed(&events),
        [
            (ResourceType::ClusterLoadAssignment, "4"),
            (ResourceType::RouteConfiguration, "4"),
        ]
    );
    let routes = events.responses[1].clone();
    h.ack(&events.responses[0]);

    // Until the ack, the nack holds.
    let events = h.ack(&routes);
    assert!(events.responses.is_empty());
    assert_eq!(events.outcomes[0].version, 4);
    assert_eq!(events.outcomes[0].result, Ok(()));
    let v5 = h.publish("/bar", &["10.0.0.4:8080"]);
    assert_eq!(
        pushed(&h.snapshot(&v5)),
        [(ResourceType::ClusterLoadAssignment, "5")]
    );
}

#[test]
fn nonces_must_have_been_issued() {
    let mut h = Harness::new();
    h.publish("/foo", &["10.0.0.1:8080"]);
    let first = h.subscribe(ResourceType::Cluster);
    assert_eq!(first.responses[0].nonce, "1");

    let err = h
        .conn
        .on_request(request(ResourceType::Cluster, "7", &[]), None)
        .unwrap_err();
    assert_eq!(err, ProtocolError::UnknownNonce("7".to_string()));
    let err = h
        .conn
        .on_request(request(ResourceType::Cluster, "nonce", &[]), None)
        .unwrap_err();
    assert_eq!(err, ProtocolError::UnknownNonce("nonce".to_string()));

    // A superseded nonce is ignored.
    let second = h.subscribe(ResourceType::Cluster);
    assert_eq!(second.responses[0].nonce, "2");
    let events = h.ack(&first.responses[0]);
    assert!(events.responses.is_empty());
    assert!(events.outcomes.is_empty());
    let events = h.ack(&second.responses[0]);
    assert_eq!(events.outcomes.len(), 1);
}

#[test]
fn named_subscriptions_are_filtered() {
    let mut h = Harness::new();
    h.publish("/foo", &["10.0.0.1:8080"]);
    let events = h.request(request(
        ResourceType::ClusterLoadAssignment,
        "",
        &["backend/ns/other"],
    ));
    assert_eq!(events.responses.len(), 1);
    assert!(events.responses[0].resources.is_empty());
    let nonce = events.responses[0].nonce.clone();
    h.ack(&events.responses[0]);

    // Changing names with the last nonce is answered even though the
    // snapshot did not change.
    let events = h.request(request(
        ResourceType::ClusterLoadAssignment,
        &nonce,
        &[BACKEND],
    ));
    assert_eq!(pushed(&events), [(ResourceType::ClusterLoadAssignment, "1")]);
    assert_eq!(events.responses[0].resources.len(), 1);
}
