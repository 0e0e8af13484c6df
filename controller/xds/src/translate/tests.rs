use super::*;
use gantry_controller_core::{
    http_route::StatusCode,
    ir::{Backend, Endpoint, RetryPolicy, Route, RouteId, TlsCertificate, WeightedBackend},
    ObjectId,
};
use std::{num::NonZeroU16, time::Duration as StdDuration};

fn mk_ir(listeners: Vec<ir::Listener>, backends: Vec<Backend>) -> GatewayIr {
    GatewayIr {
        id: ObjectId::new("ns", "gw"),
        listeners,
        backends: backends.into_iter().map(|b| (b.name.clone(), b)).collect(),
    }
}

fn mk_listener(name: &str, port: u16, protocol: Protocol, routes: Vec<Route>) -> ir::Listener {
    ir::Listener {
        name: name.to_string(),
        bind: SocketAddr::from(([0, 0, 0, 0], port)),
        hostname: None,
        protocol,
        routes,
    }
}

fn mk_route(name: &str, path: &str, action: RouteAction) -> Route {
    Route {
        id: RouteId {
            route: ObjectId::new("ns", name),
            rule: 0,
            match_index: 0,
        },
        creation_timestamp: None,
        hostnames: vec![],
        matches: HttpRouteMatch {
            path: PathMatch::Prefix(path.to_string()),
            ..Default::default()
        },
        action,
        policies: vec![],
        priority: 0,
    }
}

fn forward_to(names: &[&str]) -> RouteAction {
    RouteAction::Forward(
        names
            .iter()
            .map(|name| WeightedBackend {
                name: name.to_string(),
                weight: 1,
            })
            .collect(),
    )
}

fn mk_backend(name: &str, addrs: &[(&str, bool)]) -> Backend {
    Backend {
        name: name.to_string(),
        endpoints: addrs
            .iter()
            .map(|(addr, healthy)| Endpoint {
                addr: addr.parse().expect("socket address"),
                weight: 1,
                healthy: *healthy,
            })
            .collect(),
    }
}

fn mk_tls(name: &str) -> Protocol {
    Protocol::Https(TlsCertificate {
        name: name.to_string(),
        cert_chain: "CERT".to_string(),
        private_key: "KEY".to_string(),
    })
}

fn decode<M: Message + Default>(resources: &Resources, ty: ResourceType, name: &str) -> M {
    let resource = resources
        .get(ty)
        .get(name)
        .unwrap_or_else(|| panic!("missing {ty} {name}"));
    assert_eq!(resource.any.type_url, ty.type_url());
    M::decode(&*resource.any.value).expect("resource must decode")
}

fn names(resources: &Resources, ty: ResourceType) -> Vec<&str> {
    resources.get(ty).names().into_iter().collect()
}

fn single_route(config: &RouteConfiguration) -> &route::Route {
    assert_eq!(config.virtual_hosts.len(), 1);
    assert_eq!(config.virtual_hosts[0].routes.len(), 1);
    &config.virtual_hosts[0].routes[0]
}

fn route_action(r: &route::Route) -> &route::RouteAction {
    match &r.action {
        Some(route::route::Action::Route(action)) => action,
        action => panic!("expected a route action: {action:?}"),
    }
}

#[test]
fn forwards_plain_http() {
    let ir = mk_ir(
        vec![mk_listener(
            "http",
            80,
            Protocol::Http,
            vec![mk_route("r", "/foo", forward_to(&["backend/ns/b"]))],
        )],
        vec![mk_backend("backend/ns/b", &[("10.0.0.1:8080", true)])],
    );
    let resources = translate(&ir).expect("translates");

    assert_eq!(names(&resources, ResourceType::Cluster), ["backend/ns/b"]);
    assert_eq!(
        names(&resources, ResourceType::ClusterLoadAssignment),
        ["backend/ns/b"]
    );
    assert!(resources.get(ResourceType::Secret).is_empty());
    assert_eq!(
        names(&resources, ResourceType::RouteConfiguration),
        ["route/0.0.0.0:80"]
    );
    assert_eq!(
        names(&resources, ResourceType::Listener),
        ["listener/0.0.0.0:80"]
    );

    let cluster: Cluster = decode(&resources, ResourceType::Cluster, "backend/ns/b");
    assert_eq!(
        cluster.cluster_discovery_type,
        Some(cluster::cluster::ClusterDiscoveryType::Type(
            cluster::cluster::DiscoveryType::Eds as i32
        ))
    );

    let cla: ClusterLoadAssignment = decode(
        &resources,
        ResourceType::ClusterLoadAssignment,
        "backend/ns/b",
    );
    assert_eq!(cla.endpoints.len(), 1);
    assert_eq!(cla.endpoints[0].lb_endpoints.len(), 1);
    assert_eq!(
        cla.endpoints[0].lb_endpoints[0].health_status,
        envoy_core::HealthStatus::Healthy as i32
    );

    let config: RouteConfiguration = decode(
        &resources,
        ResourceType::RouteConfiguration,
        "route/0.0.0.0:80",
    );
    assert_eq!(config.virtual_hosts[0].domains, ["*"]);
    let r = single_route(&config);
    assert_eq!(r.name, "ns/r/0/0");
    assert_eq!(
        r.r#match.as_ref().and_then(|m| m.path_specifier.clone()),
        Some(route::route_match::PathSpecifier::PathSeparatedPrefix(
            "/foo".to_string()
        ))
    );
    assert_eq!(
        route_action(r).cluster_specifier,
        Some(route::route_action::ClusterSpecifier::Cluster(
            "backend/ns/b".to_string()
        ))
    );

    let listener: Listener = decode(&resources, ResourceType::Listener, "listener/0.0.0.0:80");
    assert_eq!(listener.filter_chains.len(), 1);
    assert!(listener.listener_filters.is_empty());
    assert_eq!(listener.address, Some(socket_address(ir.listeners[0].bind)));
}

#[test]
fn identical_trees_translate_identically() {
    let ir = mk_ir(
        vec![mk_listener(
            "http",
            80,
            Protocol::Http,
            vec![mk_route("r", "/", forward_to(&["backend/ns/b"]))],
        )],
        vec![mk_backend(
            "backend/ns/b",
            &[("10.0.0.1:8080", true), ("10.0.0.2:8080", true)],
        )],
    );
    let first = translate(&ir).expect("translates");
    let second = translate(&ir.clone()).expect("translates");
    assert_eq!(first, second);

    // Losing an endpoint only changes the load assignments.
    let mut fewer = ir.clone();
    if let Some(b) = fewer.backends.get_mut("backend/ns/b") {
        b.endpoints.pop();
    }
    let third = translate(&fewer).expect("translates");
    for ty in ResourceType::ALL {
        let changed = first.get(ty).hash != third.get(ty).hash;
        assert_eq!(changed, ty == ResourceType::ClusterLoadAssignment, "{ty}");
    }
}

#[test]
fn backends_without_endpoints_have_empty_assignments() {
    let ir = mk_ir(
        vec![mk_listener(
            "http",
            80,
            Protocol::Http,
            vec![mk_route("r", "/", forward_to(&["backend/ns/b"]))],
        )],
        vec![mk_backend("backend/ns/b", &[])],
    );
    let resources = translate(&ir).expect("translates");
    let cla: ClusterLoadAssignment = decode(
        &resources,
        ResourceType::ClusterLoadAssignment,
        "backend/ns/b",
    );
    assert!(cla.endpoints.is_empty());
}

#[test]
fn https_listeners_select_chains_by_server_name() {
    let mut foo = mk_listener(
        "foo",
        443,
        mk_tls("secret/ns/foo-cert"),
        vec![mk_route("foo", "/", forward_to(&["backend/ns/b"]))],
    );
    foo.hostname = Some("foo.example.com".to_string());
    let mut bar = mk_listener(
        "bar",
        443,
        mk_tls("secret/ns/bar-cert"),
        vec![mk_route("bar", "/", forward_to(&["backend/ns/b"]))],
    );
    bar.hostname = Some("bar.example.com".to_string());
    let ir = mk_ir(
        vec![foo, bar],
        vec![mk_backend("backend/ns/b", &[("10.0.0.1:8080", true)])],
    );

    let resources = translate(&ir).expect("translates");
    assert_eq!(
        names(&resources, ResourceType::Secret),
        ["secret/ns/bar-cert", "secret/ns/foo-cert"]
    );
    assert_eq!(
        names(&resources, ResourceType::RouteConfiguration),
        ["route/0.0.0.0:443/bar", "route/0.0.0.0:443/foo"]
    );

    let secret: Secret = decode(&resources, ResourceType::Secret, "secret/ns/foo-cert");
    assert!(matches!(
        secret.r#type,
        Some(tls::secret::Type::TlsCertificate(_))
    ));

    let listener: Listener = decode(&resources, ResourceType::Listener, "listener/0.0.0.0:443");
    assert_eq!(listener.listener_filters.len(), 1);
    assert_eq!(
        listener.listener_filters[0].name,
        "envoy.filters.listener.tls_inspector"
    );
    let server_names = listener
        .filter_chains
        .iter()
        .map(|chain| {
            assert!(chain.transport_socket.is_some());
            chain
                .filter_chain_match
                .as_ref()
                .map(|m| m.server_names.clone())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>();
    assert_eq!(
        server_names,
        [vec!["foo.example.com".to_string()], vec!["bar.example.com".to_string()]]
    );
}

#[test]
fn virtual_hosts_group_routes_by_hostname() {
    let mut a = mk_route("a", "/a", forward_to(&["backend/ns/b"]));
    a.hostnames = vec!["a.example.com".to_string(), "c.example.com".to_string()];
    let mut c = mk_route("c", "/c", forward_to(&["backend/ns/b"]));
    c.hostnames = vec!["c.example.com".to_string()];
    let any = mk_route("any", "/", forward_to(&["backend/ns/b"]));
    let ir = mk_ir(
        vec![mk_listener("http", 80, Protocol::Http, vec![c, a, any])],
        vec![mk_backend("backend/ns/b", &[("10.0.0.1:8080", true)])],
    );

    let resources = translate(&ir).expect("translates");
    let config: RouteConfiguration = decode(
        &resources,
        ResourceType::RouteConfiguration,
        "route/0.0.0.0:80",
    );
    let hosts = config
        .virtual_hosts
        .iter()
        .map(|vh| {
            let routes = vh.routes.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
            (vh.domains[0].as_str(), routes)
        })
        .collect::<Vec<_>>();
    assert_eq!(
        hosts,
        [
            ("*", vec!["ns/any/0/0"]),
            ("a.example.com", vec!["ns/a/0/0"]),
            ("c.example.com", vec!["ns/c/0/0", "ns/a/0/0"]),
        ]
    );
}

#[test]
fn policies_configure_route_actions() {
    let mut r = mk_route("r", "/", forward_to(&["backend/ns/a", "backend/ns/b"]));
    r.policies = vec![
        RoutePolicy::Timeout(StdDuration::from_millis(1500)),
        RoutePolicy::Retry(RetryPolicy {
            attempts: 3,
            per_try_timeout: Some(StdDuration::from_secs(1)),
            retry_on: vec!["5xx".to_string(), "reset".to_string()],
        }),
    ];
    let ir = mk_ir(
        vec![mk_listener("http", 80, Protocol::Http, vec![r])],
        vec![
            mk_backend("backend/ns/a", &[("10.0.0.1:8080", true)]),
            mk_backend("backend/ns/b", &[("10.0.0.2:8080", true)]),
        ],
    );

    let resources = translate(&ir).expect("translates");
    let config: RouteConfiguration = decode(
        &resources,
        ResourceType::RouteConfiguration,
        "route/0.0.0.0:80",
    );
    let action = route_action(single_route(&config));
    assert_eq!(
        action.timeout,
        Some(Duration {
            seconds: 1,
            nanos: 500_000_000
        })
    );
    let retry = action.retry_policy.as_ref().expect("retry policy");
    assert_eq!(retry.retry_on, "5xx,reset");
    assert_eq!(retry.num_retries, Some(UInt32Value { value: 3 }));
    match &action.cluster_specifier {
        Some(route::route_action::ClusterSpecifier::WeightedClusters(weighted)) => {
            let clusters = weighted
                .clusters
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>();
            assert_eq!(clusters, ["backend/ns/a", "backend/ns/b"]);
        }
        specifier => panic!("expected weighted clusters: {specifier:?}"),
    }
}

#[test]
fn redirects_and_failures_skip_clusters() {
    let redirect = mk_route(
        "redirect",
        "/old",
        RouteAction::Redirect(RequestRedirectFilter {
            scheme: Some("https".parse().expect("scheme")),
            host: Some("new.example.com".to_string()),
            path: Some(PathModifier::Prefix("/new".to_string())),
            port: NonZeroU16::new(8443),
            status: Some(StatusCode::MOVED_PERMANENTLY),
        }),
    );
    let fail = mk_route(
        "fail",
        "/",
        RouteAction::Fail {
            status: StatusCode::INTERNAL_SERVER_ERROR,
        },
    );
    let ir = mk_ir(
        vec![mk_listener("http", 80, Protocol::Http, vec![redirect, fail])],
        vec![],
    );

    let resources = translate(&ir).expect("translates");
    assert!(resources.get(ResourceType::Cluster).is_empty());
    let config: RouteConfiguration = decode(
        &resources,
        ResourceType::RouteConfiguration,
        "route/0.0.0.0:80",
    );
    let routes = &config.virtual_hosts[0].routes;
    match &routes[0].action {
        Some(route::route::Action::Redirect(redirect)) => {
            assert_eq!(redirect.host_redirect, "new.example.com");
            assert_eq!(redirect.port_redirect, 8443);
            assert_eq!(
                redirect.response_code,
                route::redirect_action::RedirectResponseCode::MovedPermanently as i32
            );
        }
        action => panic!("expected a redirect: {action:?}"),
    }
    match &routes[1].action {
        Some(route::route::Action::DirectResponse(response)) => {
            assert_eq!(response.status, 500)
        }
        action => panic!("expected a direct response: {action:?}"),
    }
}

#[test]
fn unknown_clusters_are_rejected() {
    let ir = mk_ir(
        vec![mk_listener(
            "http",
            80,
            Protocol::Http,
            vec![mk_route("r", "/", forward_to(&["backend/ns/missing"]))],
        )],
        vec![],
    );
    assert_eq!(
        translate(&ir),
        Err(TranslationError::UnknownCluster {
            route_config: "route/0.0.0.0:80".to_string(),
            cluster: "backend/ns/missing".to_string(),
        })
    );
}

#[test]
fn mixed_protocols_on_a_bind_are_rejected() {
    let ir = mk_ir(
        vec![
            mk_listener("http", 80, Protocol::Http, vec![]),
            mk_listener("https", 80, mk_tls("secret/ns/cert"), vec![]),
        ],
        vec![],
    );
    assert_eq!(
        translate(&ir),
        Err(TranslationError::MixedProtocols(SocketAddr::from((
            [0, 0, 0, 0],
            80
        ))))
    );
}
