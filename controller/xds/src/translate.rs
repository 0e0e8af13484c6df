use envoy_types::pb::{
    envoy::{
        config::{
            cluster::v3::{self as cluster, Cluster},
            core::v3::{self as envoy_core, ConfigSource},
            endpoint::v3::{self as endpoint, ClusterLoadAssignment},
            listener::v3::{self as listener, FilterChain, Listener},
            route::v3::{self as route, RouteConfiguration},
        },
        extensions::{
            filters::{
                http::router::v3::Router,
                listener::tls_inspector::v3::TlsInspector,
                network::http_connection_manager::v3::{self as hcm, HttpConnectionManager},
            },
            transport_sockets::tls::v3::{self as tls, Secret},
        },
        r#type::matcher::v3::{string_matcher::MatchPattern, RegexMatcher, StringMatcher},
    },
    google::protobuf::{Any, Duration, UInt32Value},
};
use gantry_controller_core::{
    http_route::{HeaderMatch, HttpRouteMatch, PathMatch, PathModifier, RequestRedirectFilter},
    ir::{self, GatewayIr, Protocol, RouteAction, RoutePolicy},
};
use prost::Message;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::SocketAddr,
    sync::Arc,
};

/// The resource types served to proxies, in push order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Cluster,
    ClusterLoadAssignment,
    Secret,
    RouteConfiguration,
    Listener,
}

/// A named, encoded resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub name: String,
    pub any: Any,
}

/// All resources of one type, sorted by name.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceSet {
    pub resources: Arc<[Resource]>,

    /// Hex-encoded SHA-256 over each resource's name and bytes.
    pub hash: String,
}

/// The translated resources of a group, one set per [`ResourceType`].
#[derive(Clone, Debug, PartialEq)]
pub struct Resources {
    sets: [ResourceSet; 5],
}

/// Indicates that translation produced resources that do not reference each
/// other consistently. Such resources are never published.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    #[error("route configuration {route_config} references unknown cluster {cluster}")]
    UnknownCluster {
        route_config: String,
        cluster: String,
    },

    #[error("cluster {0} has no load assignment")]
    MissingLoadAssignment(String),

    #[error("listener {listener} references unknown route configuration {route_config}")]
    UnknownRouteConfiguration {
        listener: String,
        route_config: String,
    },

    #[error("listener {listener} references unknown secret {secret}")]
    UnknownSecret { listener: String, secret: String },

    #[error("listeners bound to {0} do not agree on a protocol")]
    MixedProtocols(SocketAddr),
}

const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
const CLUSTER_LOAD_ASSIGNMENT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
const SECRET_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
const ROUTE_CONFIGURATION_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

const CONNECT_TIMEOUT_SECS: i64 = 5;

/// Typed resources, before encoding.
#[derive(Default)]
struct Typed {
    clusters: BTreeMap<String, Cluster>,
    assignments: BTreeMap<String, ClusterLoadAssignment>,
    secrets: BTreeMap<String, Secret>,
    route_configs: BTreeMap<String, RouteConfiguration>,
    listeners: BTreeMap<String, Listener>,

    /// The RDS and SDS names each listener refers to.
    listener_refs: Vec<ListenerRefs>,
}

struct ListenerRefs {
    listener: String,
    route_configs: Vec<String>,
    secrets: Vec<String>,
}

/// Translates a group's IR into Envoy resources.
///
/// The output depends only on the IR: equal trees produce byte-identical
/// resources and hashes.
pub fn translate(ir: &GatewayIr) -> Result<Resources, TranslationError> {
    let mut typed = Typed::default();

    for backend in ir.backends.values() {
        typed
            .clusters
            .insert(backend.name.clone(), eds_cluster(&backend.name));
        typed
            .assignments
            .insert(backend.name.clone(), load_assignment(backend));
    }

    let mut binds = BTreeMap::<SocketAddr, Vec<&ir::Listener>>::new();
    for l in &ir.listeners {
        binds.entry(l.bind).or_default().push(l);
    }
    for (bind, listeners) in binds {
        let is_tls = matches!(listeners[0].protocol, Protocol::Https(_));
        if listeners
            .iter()
            .any(|l| matches!(l.protocol, Protocol::Https(_)) != is_tls)
        {
            return Err(TranslationError::MixedProtocols(bind));
        }
        if is_tls {
            https_listener(&mut typed, bind, &listeners);
        } else {
            http_listener(&mut typed, bind, listeners);
        }
    }

    typed.check()?;
    tracing::debug!(
        group = %ir.id,
        clusters = typed.clusters.len(),
        secrets = typed.secrets.len(),
        route_configs = typed.route_configs.len(),
        listeners = typed.listeners.len(),
        "Translated"
    );
    Ok(typed.encode())
}

/// All plain-text listeners on a port share one filter chain. Virtual hosts
/// from listeners with more specific hostnames take precedence.
fn http_listener(typed: &mut Typed, bind: SocketAddr, mut listeners: Vec<&ir::Listener>) {
    listeners.sort_by_key(|l| hostname_rank(l.hostname.as_deref()));
    let route_config_name = format!("route/{bind}");
    let routes = listeners.iter().flat_map(|l| l.routes.iter());
    typed.route_configs.insert(
        route_config_name.clone(),
        route_configuration(&route_config_name, routes),
    );

    let name = listener_name(bind);
    let chain = FilterChain {
        filters: vec![connection_manager(
            format!("http_{}", bind.port()),
            &route_config_name,
        )],
        ..Default::default()
    };
    typed.listeners.insert(
        name.clone(),
        Listener {
            name: name.clone(),
            address: Some(socket_address(bind)),
            filter_chains: vec![chain],
            ..Default::default()
        },
    );
    typed.listener_refs.push(ListenerRefs {
        listener: name,
        route_configs: vec![route_config_name],
        secrets: vec![],
    });
}

/// Each TLS listener on a port gets its own filter chain, selected by SNI.
fn https_listener(typed: &mut Typed, bind: SocketAddr, listeners: &[&ir::Listener]) {
    let name = listener_name(bind);
    let mut refs = ListenerRefs {
        listener: name.clone(),
        route_configs: vec![],
        secrets: vec![],
    };

    let mut chains = Vec::with_capacity(listeners.len());
    for l in listeners {
        let Protocol::Https(cert) = &l.protocol else {
            continue;
        };
        typed
            .secrets
            .insert(cert.name.clone(), tls_secret(cert));

        let route_config_name = format!("route/{bind}/{}", l.name);
        typed.route_configs.insert(
            route_config_name.clone(),
            route_configuration(&route_config_name, l.routes.iter()),
        );

        chains.push(FilterChain {
            name: l.name.clone(),
            filter_chain_match: l.hostname.as_ref().map(|hostname| listener::FilterChainMatch {
                server_names: vec![hostname.clone()],
                ..Default::default()
            }),
            filters: vec![connection_manager(
                format!("https_{}_{}", bind.port(), l.name),
                &route_config_name,
            )],
            transport_socket: Some(downstream_tls(&cert.name)),
            ..Default::default()
        });
        refs.route_configs.push(route_config_name);
        refs.secrets.push(cert.name.clone());
    }

    typed.listeners.insert(
        name.clone(),
        Listener {
            name,
            address: Some(socket_address(bind)),
            filter_chains: chains,
            listener_filters: vec![listener::ListenerFilter {
                name: "envoy.filters.listener.tls_inspector".to_string(),
                config_type: Some(listener::listener_filter::ConfigType::TypedConfig(to_any(
                    TLS_INSPECTOR_TYPE_URL,
                    &TlsInspector::default(),
                ))),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    typed.listener_refs.push(refs);
}

fn listener_name(bind: SocketAddr) -> String {
    format!("listener/{bind}")
}

/// Exact hostnames sort first, then wildcards by decreasing suffix length,
/// then listeners without a hostname.
fn hostname_rank(hostname: Option<&str>) -> (u8, std::cmp::Reverse<usize>) {
    match hostname {
        Some(h) if h.starts_with('*') => (1, std::cmp::Reverse(h.len())),
        Some(h) => (0, std::cmp::Reverse(h.len())),
        None => (2, std::cmp::Reverse(0)),
    }
}

// === Clusters ===

fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(envoy_core::config_source::ConfigSourceSpecifier::Ads(
            envoy_core::AggregatedConfigSource::default(),
        )),
        resource_api_version: envoy_core::ApiVersion::V3 as i32,
        ..Default::default()
    }
}

fn eds_cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        connect_timeout: Some(Duration {
            seconds: CONNECT_TIMEOUT_SECS,
            nanos: 0,
        }),
        cluster_discovery_type: Some(cluster::cluster::ClusterDiscoveryType::Type(
            cluster::cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(cluster::cluster::EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: name.to_string(),
        }),
        ..Default::default()
    }
}

fn load_assignment(backend: &ir::Backend) -> ClusterLoadAssignment {
    let lb_endpoints = backend
        .endpoints
        .iter()
        .map(|ep| endpoint::LbEndpoint {
            host_identifier: Some(endpoint::lb_endpoint::HostIdentifier::Endpoint(
                endpoint::Endpoint {
                    address: Some(socket_address(ep.addr)),
                    ..Default::default()
                },
            )),
            health_status: if ep.healthy {
                envoy_core::HealthStatus::Healthy as i32
            } else {
                envoy_core::HealthStatus::Unhealthy as i32
            },
            load_balancing_weight: Some(UInt32Value {
                value: ep.weight.max(1),
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    ClusterLoadAssignment {
        cluster_name: backend.name.clone(),
        endpoints: if lb_endpoints.is_empty() {
            vec![]
        } else {
            vec![endpoint::LocalityLbEndpoints {
                lb_endpoints,
                ..Default::default()
            }]
        },
        ..Default::default()
    }
}

fn socket_address(addr: SocketAddr) -> envoy_core::Address {
    envoy_core::Address {
        address: Some(envoy_core::address::Address::SocketAddress(
            envoy_core::SocketAddress {
                address: addr.ip().to_string(),
                port_specifier: Some(envoy_core::socket_address::PortSpecifier::PortValue(
                    addr.port() as u32,
                )),
                ..Default::default()
            },
        )),
    }
}

// === Secrets ===

fn tls_secret(cert: &ir::TlsCertificate) -> Secret {
    let inline = |s: &str| envoy_core::DataSource {
        specifier: Some(envoy_core::data_source::Specifier::InlineString(
            s.to_string(),
        )),
        ..Default::default()
    };
    Secret {
        name: cert.name.clone(),
        r#type: Some(tls::secret::Type::TlsCertificate(tls::TlsCertificate {
            certificate_chain: Some(inline(&cert.cert_chain)),
            private_key: Some(inline(&cert.private_key)),
            ..Default::default()
        })),
    }
}

fn downstream_tls(secret: &str) -> envoy_core::TransportSocket {
    let context = tls::DownstreamTlsContext {
        common_tls_context: Some(tls::CommonTlsContext {
            tls_certificate_sds_secret_configs: vec![tls::SdsSecretConfig {
                name: secret.to_string(),
                sds_config: Some(ads_config_source()),
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    envoy_core::TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(envoy_core::transport_socket::ConfigType::TypedConfig(
            to_any(DOWNSTREAM_TLS_TYPE_URL, &context),
        )),
    }
}

// === Listeners ===

fn connection_manager(stat_prefix: String, route_config_name: &str) -> listener::Filter {
    let manager = HttpConnectionManager {
        stat_prefix,
        route_specifier: Some(hcm::http_connection_manager::RouteSpecifier::Rds(hcm::Rds {
            config_source: Some(ads_config_source()),
            route_config_name: route_config_name.to_string(),
        })),
        http_filters: vec![hcm::HttpFilter {
            name: "envoy.filters.http.router".to_string(),
            config_type: Some(hcm::http_filter::ConfigType::TypedConfig(to_any(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        }],
        ..Default::default()
    };
    listener::Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(listener::filter::ConfigType::TypedConfig(to_any(
            HCM_TYPE_URL,
            &manager,
        ))),
    }
}

// === Routes ===

/// Groups routes into virtual hosts by hostname, preserving their order.
fn route_configuration<'r>(
    name: &str,
    routes: impl Iterator<Item = &'r ir::Route>,
) -> RouteConfiguration {
    let mut hosts = BTreeMap::<String, Vec<route::Route>>::new();
    for r in routes {
        let envoy_route = http_route(r);
        if r.hostnames.is_empty() {
            hosts.entry("*".to_string()).or_default().push(envoy_route);
        } else {
            for hostname in &r.hostnames {
                hosts
                    .entry(hostname.clone())
                    .or_default()
                    .push(envoy_route.clone());
            }
        }
    }

    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: hosts
            .into_iter()
            .map(|(domain, routes)| route::VirtualHost {
                name: domain.clone(),
                domains: vec![domain],
                routes,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn http_route(r: &ir::Route) -> route::Route {
    let action = match &r.action {
        RouteAction::Forward(backends) if !backends.is_empty() => {
            route::route::Action::Route(forward(backends, &r.policies))
        }
        RouteAction::Forward(_) => direct_response(500),
        RouteAction::Redirect(redirect) => route::route::Action::Redirect(redirect_action(redirect)),
        RouteAction::Fail { status } => direct_response(status.as_u16()),
    };
    route::Route {
        name: r.id.to_string(),
        r#match: Some(route_match(&r.matches)),
        action: Some(action),
        ..Default::default()
    }
}

fn route_match(m: &HttpRouteMatch) -> route::RouteMatch {
    use route::route_match::PathSpecifier;

    let path = match &m.path {
        PathMatch::Exact(path) => PathSpecifier::Path(path.clone()),
        PathMatch::Prefix(prefix) if prefix.ends_with('/') => PathSpecifier::Prefix(prefix.clone()),
        // Prefixes match whole path segments.
        PathMatch::Prefix(prefix) => PathSpecifier::PathSeparatedPrefix(prefix.clone()),
        PathMatch::Regex(re) => PathSpecifier::SafeRegex(regex_matcher(re.as_str())),
    };

    let mut headers = m
        .headers
        .iter()
        .map(|h| match h {
            HeaderMatch::Exact(name, value) => {
                header_matcher(name.as_str(), MatchPattern::Exact(value.clone()))
            }
            HeaderMatch::Regex(name, re) => header_matcher(
                name.as_str(),
                MatchPattern::SafeRegex(regex_matcher(re.as_str())),
            ),
        })
        .collect::<Vec<_>>();
    if let Some(method) = &m.method {
        headers.push(header_matcher(
            ":method",
            MatchPattern::Exact(method.as_str().to_string()),
        ));
    }

    route::RouteMatch {
        path_specifier: Some(path),
        headers,
        ..Default::default()
    }
}

fn header_matcher(name: &str, pattern: MatchPattern) -> route::HeaderMatcher {
    route::HeaderMatcher {
        name: name.to_string(),
        header_match_specifier: Some(route::header_matcher::HeaderMatchSpecifier::StringMatch(
            StringMatcher {
                match_pattern: Some(pattern),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn regex_matcher(regex: &str) -> RegexMatcher {
    RegexMatcher {
        regex: regex.to_string(),
        ..Default::default()
    }
}

fn forward(backends: &[ir::WeightedBackend], policies: &[RoutePolicy]) -> route::RouteAction {
    use route::route_action::ClusterSpecifier;

    let cluster_specifier = match backends {
        [backend] => ClusterSpecifier::Cluster(backend.name.clone()),
        backends => ClusterSpecifier::WeightedClusters(route::WeightedCluster {
            clusters: backends
                .iter()
                .map(|b| route::weighted_cluster::ClusterWeight {
                    name: b.name.clone(),
                    weight: Some(UInt32Value { value: b.weight }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
    };

    let mut action = route::RouteAction {
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };
    for policy in policies {
        match policy {
            RoutePolicy::Timeout(timeout) => action.timeout = Some(duration(*timeout)),
            RoutePolicy::Retry(retry) => {
                action.retry_policy = Some(route::RetryPolicy {
                    retry_on: retry.retry_on.join(","),
                    num_retries: Some(UInt32Value {
                        value: retry.attempts,
                    }),
                    per_try_timeout: retry.per_try_timeout.map(duration),
                    ..Default::default()
                })
            }
        }
    }
    action
}

fn redirect_action(redirect: &RequestRedirectFilter) -> route::RedirectAction {
    use route::redirect_action::{
        PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier,
    };

    let response_code = match redirect.status.map(|s| s.as_u16()) {
        Some(301) => RedirectResponseCode::MovedPermanently,
        Some(303) => RedirectResponseCode::SeeOther,
        Some(307) => RedirectResponseCode::TemporaryRedirect,
        Some(308) => RedirectResponseCode::PermanentRedirect,
        _ => RedirectResponseCode::Found,
    };
    route::RedirectAction {
        scheme_rewrite_specifier: redirect
            .scheme
            .as_ref()
            .map(|s| SchemeRewriteSpecifier::SchemeRedirect(s.as_str().to_string())),
        host_redirect: redirect.host.clone().unwrap_or_default(),
        port_redirect: redirect.port.map(|p| p.get() as u32).unwrap_or_default(),
        path_rewrite_specifier: redirect.path.as_ref().map(|path| match path {
            PathModifier::Full(path) => PathRewriteSpecifier::PathRedirect(path.clone()),
            PathModifier::Prefix(prefix) => PathRewriteSpecifier::PrefixRewrite(prefix.clone()),
        }),
        response_code: response_code as i32,
        ..Default::default()
    }
}

fn direct_response(status: u16) -> route::route::Action {
    route::route::Action::DirectResponse(route::DirectResponseAction {
        status: status as u32,
        ..Default::default()
    })
}

fn duration(d: std::time::Duration) -> Duration {
    Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn to_any(type_url: &str, msg: &impl Message) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

// === impl Typed ===

impl Typed {
    fn check(&self) -> Result<(), TranslationError> {
        for (name, config) in &self.route_configs {
            let clusters = config
                .virtual_hosts
                .iter()
                .flat_map(|vh| vh.routes.iter())
                .flat_map(route_clusters);
            for cluster in clusters {
                if !self.clusters.contains_key(&cluster) {
                    return Err(TranslationError::UnknownCluster {
                        route_config: name.clone(),
                        cluster,
                    });
                }
            }
        }

        if let Some(name) = self
            .clusters
            .keys()
            .find(|name| !self.assignments.contains_key(*name))
        {
            return Err(TranslationError::MissingLoadAssignment(name.clone()));
        }

        for refs in &self.listener_refs {
            if let Some(rc) = refs
                .route_configs
                .iter()
                .find(|rc| !self.route_configs.contains_key(*rc))
            {
                return Err(TranslationError::UnknownRouteConfiguration {
                    listener: refs.listener.clone(),
                    route_config: rc.clone(),
                });
            }
            if let Some(secret) = refs
                .secrets
                .iter()
                .find(|s| !self.secrets.contains_key(*s))
            {
                return Err(TranslationError::UnknownSecret {
                    listener: refs.listener.clone(),
                    secret: secret.clone(),
                });
            }
        }

        Ok(())
    }

    fn encode(self) -> Resources {
        fn set<M: Message>(type_url: &str, resources: BTreeMap<String, M>) -> ResourceSet {
            ResourceSet::new(
                resources
                    .into_iter()
                    .map(|(name, msg)| Resource {
                        name,
                        any: to_any(type_url, &msg),
                    })
                    .collect(),
            )
        }

        Resources {
            sets: [
                set(CLUSTER_TYPE_URL, self.clusters),
                set(CLUSTER_LOAD_ASSIGNMENT_TYPE_URL, self.assignments),
                set(SECRET_TYPE_URL, self.secrets),
                set(ROUTE_CONFIGURATION_TYPE_URL, self.route_configs),
                set(LISTENER_TYPE_URL, self.listeners),
            ],
        }
    }
}

fn route_clusters(r: &route::Route) -> Vec<String> {
    use route::route_action::ClusterSpecifier;

    let Some(route::route::Action::Route(action)) = &r.action else {
        return vec![];
    };
    match &action.cluster_specifier {
        Some(ClusterSpecifier::Cluster(name)) => vec![name.clone()],
        Some(ClusterSpecifier::WeightedClusters(weighted)) => {
            weighted.clusters.iter().map(|c| c.name.clone()).collect()
        }
        _ => vec![],
    }
}

// === impl ResourceType ===

impl ResourceType {
    /// Dependencies are pushed before the resources that refer to them.
    pub const ALL: [Self; 5] = [
        Self::Cluster,
        Self::ClusterLoadAssignment,
        Self::Secret,
        Self::RouteConfiguration,
        Self::Listener,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Cluster => CLUSTER_TYPE_URL,
            Self::ClusterLoadAssignment => CLUSTER_LOAD_ASSIGNMENT_TYPE_URL,
            Self::Secret => SECRET_TYPE_URL,
            Self::RouteConfiguration => ROUTE_CONFIGURATION_TYPE_URL,
            Self::Listener => LISTENER_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_url() == type_url)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::ClusterLoadAssignment => "cluster_load_assignment",
            Self::Secret => "secret",
            Self::RouteConfiguration => "route_configuration",
            Self::Listener => "listener",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceSet ===

impl ResourceSet {
    fn new(resources: Vec<Resource>) -> Self {
        let mut hasher = Sha256::new();
        for r in &resources {
            hasher.update((r.name.len() as u64).to_be_bytes());
            hasher.update(r.name.as_bytes());
            hasher.update((r.any.value.len() as u64).to_be_bytes());
            hasher.update(&r.any.value);
        }
        Self {
            resources: resources.into(),
            hash: hex::encode(hasher.finalize()),
        }
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

// === impl Resources ===

impl Resources {
    pub fn get(&self, ty: ResourceType) -> &ResourceSet {
        &self.sets[ty.index()]
    }

    pub fn into_sets(self) -> [ResourceSet; 5] {
        self.sets
    }
}

#[cfg(test)]
mod tests;
