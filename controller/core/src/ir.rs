//! A proxy-agnostic description of everything one gateway serves.
//!
//! The IR is produced from a single aggregated group and consumed by the xDS
//! translator. Every collection is kept in a deterministic order so that the
//! same set of inputs always produces an equal tree.

use crate::{
    http_route::{HttpRouteMatch, RequestRedirectFilter, StatusCode},
    GroupId, ObjectId,
};
use chrono::{offset::Utc, DateTime};
use std::{collections::BTreeMap, fmt, net::SocketAddr, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayIr {
    pub id: GroupId,
    pub listeners: Vec<Listener>,

    /// Backends keyed by their cluster name.
    pub backends: BTreeMap<String, Backend>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub bind: SocketAddr,
    pub hostname: Option<String>,
    pub protocol: Protocol,

    /// Ordered by precedence; the first matching route wins.
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https(TlsCertificate),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsCertificate {
    pub name: String,
    pub cert_chain: String,
    pub private_key: String,
}

/// Identifies a single match of a single rule of an HTTPRoute.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId {
    pub route: ObjectId,
    pub rule: usize,
    pub match_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub id: RouteId,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub hostnames: Vec<String>,
    pub matches: HttpRouteMatch,
    pub action: RouteAction,
    pub policies: Vec<RoutePolicy>,
    pub priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteAction {
    Forward(Vec<WeightedBackend>),
    Redirect(RequestRedirectFilter),

    /// Returned when a route has no usable backends.
    Fail { status: StatusCode },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedBackend {
    pub name: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub weight: u32,
    pub healthy: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutePolicy {
    Timeout(Duration),
    Retry(RetryPolicy),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub per_try_timeout: Option<Duration>,
    pub retry_on: Vec<String>,
}

// === impl RouteId ===

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.route, self.rule, self.match_index)
    }
}

// === impl RouteAction ===

impl RouteAction {
    pub fn backends(&self) -> impl Iterator<Item = &WeightedBackend> {
        let backends = match self {
            Self::Forward(backends) => &backends[..],
            Self::Redirect(_) | Self::Fail { .. } => &[],
        };
        backends.iter()
    }
}

// === impl Backend ===

impl Backend {
    pub fn has_healthy_endpoints(&self) -> bool {
        self.endpoints.iter().any(|ep| ep.healthy)
    }
}
