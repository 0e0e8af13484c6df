//! Validates an aggregated group and compiles it into the IR.
//!
//! Building never fails: every problem becomes a condition on the object
//! that caused it. A group only fails to produce an IR when none of its
//! listeners is usable, in which case the last published snapshot is kept.

use crate::{
    aggregate::{AggregatedGroup, AggregatedRoute, BackendTarget, Ref},
    hostname,
    store::{self, PolicyTarget},
};
use gantry_controller_core::{
    http_route::{
        HeaderMatch, HeaderName, HttpRouteMatch, Method, PathMatch, PathModifier,
        RequestRedirectFilter, Scheme, StatusCode,
    },
    ir::{self, GatewayIr, Protocol, RouteAction, RouteId, RoutePolicy, TlsCertificate, WeightedBackend},
    status::{
        BackendOutcome, Condition, ConditionType, GatewayOutcome, GroupOutcome, ListenerOutcome,
        ParentOutcome, ParentRef, PolicyOutcome, Reason, RouteOutcome, SnapshotOutcome,
    },
    GroupId, ObjectId, RoutePrecedence,
};
use gantry_controller_k8s_api::{
    self as k8s,
    chrono::{DateTime, Utc},
    gateway as api, ResourceExt,
};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU16,
    time::Duration,
};

/// The IR for a group along with the status of each of its objects.
#[derive(Clone, Debug)]
pub struct Built {
    pub group: GroupId,

    /// `None` when the gateway has no usable listener.
    pub ir: Option<GatewayIr>,

    pub gateway: GatewayOutcome,
    pub routes: Vec<RouteOutcome>,
    pub backends: Vec<BackendOutcome>,
    pub policies: Vec<PolicyOutcome>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("path {0:?} must start with '/'")]
    RelativePath(String),

    #[error("invalid regular expression {0:?}: {1}")]
    Regex(String, String),

    #[error("invalid header name {0:?}")]
    HeaderName(String),

    #[error("invalid method {0:?}")]
    Method(String),

    #[error("unsupported path match type {0:?}")]
    PathMatchType(String),

    #[error("unsupported header match type {0:?}")]
    HeaderMatchType(String),

    #[error("unsupported filter type {0:?}")]
    FilterType(String),

    #[error("invalid redirect: {0}")]
    Redirect(String),

    #[error("invalid duration {0:?}: {1}")]
    Duration(String, #[source] k8s::ParseDurationError),
}

const SERVER_ERROR: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

struct ListenerState {
    name: String,
    port: u16,
    hostname: Option<String>,
    protocol: Option<Protocol>,
    accepted: Condition,
    conflicted: Condition,
    resolved_refs: Condition,
    all_namespaces: bool,
    allows_routes: bool,
    routes: Vec<ir::Route>,
    attached: BTreeSet<ObjectId>,
}

struct Rule {
    matches: Vec<HttpRouteMatch>,
    redirect: Option<RequestRedirectFilter>,
    timeout: Option<Duration>,
}

struct ResolvedBackend {
    backend: ir::Backend,
    resource: Option<(ObjectId, Option<i64>)>,
}

#[derive(Clone)]
struct EffectivePolicy {
    id: ObjectId,
    timeout: Option<Duration>,
    retry: Option<ir::RetryPolicy>,
}

/// Builds the IR for a group.
pub fn build(group: &AggregatedGroup, precedence: &RoutePrecedence) -> Built {
    let gateway = &*group.gateway;
    let explicit = store::explicit_addresses(gateway).next();
    let address_error = explicit.is_none() && gateway.spec.addresses.iter().flatten().next().is_some();
    let bind_ip = explicit.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let mut listeners = gateway
        .spec
        .listeners
        .iter()
        .zip(&group.certificates)
        .map(|(listener, certs)| listener_state(listener, certs))
        .collect::<Vec<_>>();
    resolve_listener_conflicts(group, explicit, &mut listeners);

    let (policy_winners, policies) = evaluate_policies(group);

    let mut backends = BTreeMap::<String, ResolvedBackend>::new();
    let mut route_outcomes = Vec::with_capacity(group.routes.len());
    let mut routes = group.routes.iter().collect::<Vec<_>>();
    routes.sort_by(|a, b| age_key(&*a.route, &a.id).cmp(&age_key(&*b.route, &b.id)));
    for route in routes {
        let outcome = attach_route(
            group,
            route,
            &policy_winners,
            &mut listeners,
            &mut backends,
        );
        route_outcomes.push(outcome);
    }
    route_outcomes.sort_by(|a, b| a.id.cmp(&b.id));

    let any_valid = listeners.iter().any(ListenerState::is_valid);
    let accepted = if address_error {
        Condition::new(ConditionType::Accepted, false, Reason::UnsupportedAddress)
            .with_message("no usable IPAddress in spec.addresses")
    } else if !any_valid {
        Condition::new(ConditionType::Accepted, false, Reason::ListenersNotValid)
            .with_message("the gateway has no valid listeners")
    } else {
        Condition::accepted()
    };

    // Only backends of routes that made it onto a listener are published.
    let mut used = BTreeMap::new();
    for listener in listeners.iter().filter(|l| l.is_valid()) {
        for route in &listener.routes {
            for wb in route.action.backends() {
                if let Some(resolved) = backends.get(&wb.name) {
                    used.insert(wb.name.clone(), resolved);
                }
            }
        }
    }
    let backend_outcomes = used
        .values()
        .filter_map(|resolved| {
            let (id, generation) = resolved.resource.clone()?;
            let outcome = BackendOutcome {
                id: id.clone(),
                generation,
                healthy: resolved.backend.has_healthy_endpoints(),
            };
            Some((id, outcome))
        })
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect();

    let ir = if accepted.is_true() {
        Some(GatewayIr {
            id: group.id.clone(),
            backends: used
                .iter()
                .map(|(name, resolved)| (name.clone(), resolved.backend.clone()))
                .collect(),
            listeners: listeners
                .iter_mut()
                .filter(|l| l.is_valid())
                .filter_map(|l| {
                    let protocol = l.protocol.clone()?;
                    let mut routes = std::mem::take(&mut l.routes);
                    precedence.sort(&mut routes);
                    Some(ir::Listener {
                        name: l.name.clone(),
                        bind: SocketAddr::new(bind_ip, l.port),
                        hostname: l.hostname.clone(),
                        protocol,
                        routes,
                    })
                })
                .collect(),
        })
    } else {
        None
    };

    let listener_outcomes = listeners
        .iter()
        .map(|l| {
            let programmed = if l.is_valid() && accepted.is_true() {
                Condition::new(ConditionType::Programmed, true, Reason::Programmed)
            } else {
                Condition::new(ConditionType::Programmed, false, Reason::Invalid)
            };
            ListenerOutcome {
                name: l.name.clone(),
                attached_routes: l.attached.len() as u32,
                conditions: vec![
                    l.accepted.clone(),
                    l.conflicted.clone(),
                    l.resolved_refs.clone(),
                    programmed,
                ],
            }
        })
        .collect();

    Built {
        group: group.id.clone(),
        ir,
        gateway: GatewayOutcome {
            generation: gateway.metadata.generation,
            accepted,
            listeners: listener_outcomes,
        },
        routes: route_outcomes,
        backends: backend_outcomes,
        policies,
    }
}

// === impl Built ===

impl Built {
    pub fn into_outcome(self, snapshot: SnapshotOutcome) -> GroupOutcome {
        GroupOutcome {
            group: self.group,
            gateway: self.gateway,
            routes: self.routes,
            backends: self.backends,
            policies: self.policies,
            snapshot,
        }
    }
}

/// Names the cluster that serves a Service port.
pub fn service_cluster_name(id: &ObjectId, port: u16) -> String {
    format!("service/{}/{}/{port}", id.namespace, id.name)
}

/// Names the cluster that serves a `Backend`.
pub fn backend_cluster_name(id: &ObjectId) -> String {
    format!("backend/{}/{}", id.namespace, id.name)
}

pub fn secret_name(id: &ObjectId) -> String {
    format!("secret/{}/{}", id.namespace, id.name)
}

// === impl ListenerState ===

impl ListenerState {
    fn is_valid(&self) -> bool {
        self.protocol.is_some() && self.accepted.is_true() && !self.conflicted.is_true()
    }

    fn conflict(&mut self, reason: Reason, message: String) {
        if !self.conflicted.is_true() {
            self.conflicted =
                Condition::new(ConditionType::Conflicted, true, reason).with_message(message);
        }
    }
}

fn listener_state(listener: &api::Listener, certs: &[Ref<std::sync::Arc<k8s::Secret>>]) -> ListenerState {
    let mut accepted = Condition::accepted();
    let mut resolved_refs = Condition::new(ConditionType::ResolvedRefs, true, Reason::ResolvedRefs);

    let protocol = match listener.protocol.as_str() {
        "HTTP" => Some(Protocol::Http),
        "HTTPS" => {
            let mode = listener
                .tls
                .as_ref()
                .and_then(|tls| tls.mode.as_deref())
                .unwrap_or("Terminate");
            if mode != "Terminate" {
                accepted = Condition::new(ConditionType::Accepted, false, Reason::UnsupportedValue)
                    .with_message(format!("TLS mode {mode} is not supported"));
                None
            } else {
                match certificate(certs) {
                    Ok(cert) => Some(Protocol::Https(cert)),
                    Err(cond) => {
                        resolved_refs = cond;
                        None
                    }
                }
            }
        }
        other => {
            accepted = Condition::new(ConditionType::Accepted, false, Reason::UnsupportedProtocol)
                .with_message(format!("protocol {other} is not supported"));
            None
        }
    };

    let from = listener
        .allowed_routes
        .as_ref()
        .and_then(|ar| ar.namespaces.as_ref())
        .and_then(|ns| ns.from.as_deref())
        .unwrap_or("Same");
    let all_namespaces = match from {
        "All" => true,
        "Same" => false,
        other => {
            if accepted.is_true() {
                accepted = Condition::new(ConditionType::Accepted, false, Reason::UnsupportedValue)
                    .with_message(format!("allowedRoutes from {other} is not supported"));
            }
            false
        }
    };

    let allows_routes = match listener.allowed_routes.as_ref().and_then(|ar| ar.kinds.as_ref()) {
        None => true,
        Some(kinds) => {
            let (valid, invalid): (Vec<_>, Vec<_>) = kinds.iter().partition(|k| {
                k.group.as_deref().unwrap_or(api::GROUP) == api::GROUP && k.kind == "HTTPRoute"
            });
            if !invalid.is_empty() && resolved_refs.is_true() {
                let kinds = invalid.iter().map(|k| k.kind.as_str()).collect::<Vec<_>>();
                resolved_refs =
                    Condition::new(ConditionType::ResolvedRefs, false, Reason::InvalidRouteKinds)
                        .with_message(format!("unsupported route kinds: {}", kinds.join(", ")));
            }
            !valid.is_empty()
        }
    };

    ListenerState {
        name: listener.name.clone(),
        port: listener.port,
        hostname: listener.hostname.clone().filter(|h| !h.is_empty()),
        protocol,
        accepted,
        conflicted: Condition::new(ConditionType::Conflicted, false, Reason::NoConflicts),
        resolved_refs,
        all_namespaces,
        allows_routes,
        routes: Vec::new(),
        attached: BTreeSet::new(),
    }
}

/// Reads the first certificate reference of a listener.
fn certificate(certs: &[Ref<std::sync::Arc<k8s::Secret>>]) -> Result<TlsCertificate, Condition> {
    let invalid = |message: String| {
        Condition::new(ConditionType::ResolvedRefs, false, Reason::InvalidCertificateRef)
            .with_message(message)
    };

    let secret = match certs.first() {
        None => return Err(invalid("an HTTPS listener requires a certificate".to_string())),
        Some(Ref::Resolved(secret)) => secret,
        Some(Ref::NotPermitted(message)) => {
            return Err(
                Condition::new(ConditionType::ResolvedRefs, false, Reason::RefNotPermitted)
                    .with_message(message.clone()),
            )
        }
        Some(Ref::NotFound(message) | Ref::InvalidKind(message)) => {
            return Err(invalid(message.clone()))
        }
    };

    let id = ObjectId::new(secret.namespace().unwrap_or_default(), secret.name_unchecked());
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(|k8s::ByteString(bytes)| String::from_utf8(bytes.clone()).ok())
            .filter(|s| !s.trim().is_empty())
    };
    match (field("tls.crt"), field("tls.key")) {
        (Some(cert_chain), Some(private_key)) => Ok(TlsCertificate {
            name: secret_name(&id),
            cert_chain,
            private_key,
        }),
        _ => Err(invalid(format!(
            "secret {id} must contain PEM-encoded tls.crt and tls.key"
        ))),
    }
}

fn resolve_listener_conflicts(
    group: &AggregatedGroup,
    explicit: Option<IpAddr>,
    listeners: &mut [ListenerState],
) {
    // Another gateway binding the same explicit address wins if it is older.
    if let Some(ip) = explicit {
        let own_age = age_key(&*group.gateway, &group.id);
        for listener in listeners.iter_mut() {
            let winner = group.peers.iter().find(|peer| {
                let peer_id = ObjectId::new(peer.namespace().unwrap_or_default(), peer.name_unchecked());
                store::explicit_addresses(peer).next() == Some(ip)
                    && age_key(&***peer, &peer_id) < own_age
                    && peer.spec.listeners.iter().any(|l| l.port == listener.port)
            });
            if let Some(peer) = winner {
                listener.conflict(
                    Reason::PortUnavailable,
                    format!(
                        "{ip}:{} is claimed by gateway {}/{}",
                        listener.port,
                        peer.namespace().unwrap_or_default(),
                        peer.name_unchecked()
                    ),
                );
            }
        }
    }

    // Within a gateway, the first listener declared on a port decides the
    // protocol and the first listener for a hostname wins.
    let protocols = group
        .gateway
        .spec
        .listeners
        .iter()
        .map(|l| l.protocol.as_str())
        .collect::<Vec<_>>();
    let mut port_protocols = BTreeMap::<u16, &str>::new();
    let mut hostnames = BTreeSet::<(u16, Option<String>)>::new();
    for (listener, protocol) in listeners.iter_mut().zip(protocols) {
        let first = *port_protocols.entry(listener.port).or_insert(protocol);
        if first != protocol {
            listener.conflict(
                Reason::ProtocolConflict,
                format!("port {} is already used by a {first} listener", listener.port),
            );
        } else if !hostnames.insert((listener.port, listener.hostname.clone())) {
            listener.conflict(
                Reason::HostnameConflict,
                format!(
                    "another listener on port {} uses hostname {}",
                    listener.port,
                    listener.hostname.as_deref().unwrap_or("*")
                ),
            );
        }
    }
}

fn evaluate_policies(
    group: &AggregatedGroup,
) -> (BTreeMap<PolicyTarget, EffectivePolicy>, Vec<PolicyOutcome>) {
    let mut policies = group
        .policies
        .iter()
        .map(|p| (ObjectId::new(p.namespace().unwrap_or_default(), p.name_unchecked()), p))
        .collect::<Vec<_>>();
    policies.sort_by(|(a_id, a), (b_id, b)| age_key(&***a, a_id).cmp(&age_key(&***b, b_id)));

    let mut winners = BTreeMap::<PolicyTarget, EffectivePolicy>::new();
    let mut outcomes = Vec::with_capacity(policies.len());
    for (id, policy) in policies {
        let accepted = match (
            store::policy_target(&id.namespace, policy),
            parse_policy(&id, &policy.spec),
        ) {
            (None, _) => Condition::new(ConditionType::Accepted, false, Reason::Invalid)
                .with_message("the target kind is not supported"),
            (_, Err(error)) => Condition::new(ConditionType::Accepted, false, Reason::Invalid)
                .with_message(error.to_string()),
            (Some(target), Ok(effective)) => match winners.get(&target) {
                Some(winner) => Condition::new(ConditionType::Accepted, false, Reason::Conflicted)
                    .with_message(format!("superseded by the older policy {}", winner.id)),
                None => {
                    winners.insert(target, effective);
                    Condition::accepted()
                }
            },
        };
        outcomes.push(PolicyOutcome {
            id,
            generation: policy.metadata.generation,
            accepted,
        });
    }
    outcomes.sort_by(|a, b| a.id.cmp(&b.id));
    (winners, outcomes)
}

fn parse_policy(
    id: &ObjectId,
    spec: &k8s::TrafficPolicySpec,
) -> Result<EffectivePolicy, ValidationError> {
    let timeout = spec.timeout.as_deref().map(parse_duration).transpose()?;
    let retry = spec
        .retry
        .as_ref()
        .map(|retry| {
            let per_try_timeout = retry
                .per_try_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?;
            let retry_on = match &retry.retry_on {
                Some(on) if !on.is_empty() => on.clone(),
                _ => vec!["5xx".to_string()],
            };
            Ok::<_, ValidationError>(ir::RetryPolicy {
                attempts: retry.attempts,
                per_try_timeout,
                retry_on,
            })
        })
        .transpose()?;
    Ok(EffectivePolicy {
        id: id.clone(),
        timeout,
        retry,
    })
}

fn attach_route(
    group: &AggregatedGroup,
    agg: &AggregatedRoute,
    policy_winners: &BTreeMap<PolicyTarget, EffectivePolicy>,
    listeners: &mut [ListenerState],
    backends: &mut BTreeMap<String, ResolvedBackend>,
) -> RouteOutcome {
    let route = &*agg.route;
    let created = k8s::creation_timestamp(route);
    let route_hostnames = route.spec.hostnames.clone().unwrap_or_default();

    let parents = route
        .spec
        .parent_refs
        .iter()
        .flatten()
        .filter(|p| p.is_gateway())
        .filter(|p| {
            p.namespace.as_deref().unwrap_or(&agg.id.namespace) == group.id.namespace
                && p.name == group.id.name
        })
        .map(|p| {
            let parent = ParentRef {
                namespace: group.id.namespace.clone(),
                name: group.id.name.clone(),
                section_name: p.section_name.clone(),
                port: p.port,
            };
            let candidates =
                parent_listeners(listeners, &agg.id.namespace, &group.id.namespace, p, &route_hostnames);
            (parent, candidates)
        })
        .collect::<Vec<_>>();

    let (actions, resolved_refs, unhealthy) = rule_actions(agg, backends);
    let rules = route
        .spec
        .rules
        .iter()
        .flatten()
        .map(parse_rule)
        .collect::<Result<Vec<_>, _>>();

    let policy = policy_winners
        .get(&PolicyTarget::Route(agg.id.clone()))
        .or_else(|| policy_winners.get(&PolicyTarget::Gateway(group.id.clone())));

    // Listener index to the route that already owns a conflicting match.
    let mut placed = BTreeMap::<usize, Option<ObjectId>>::new();
    if let Ok(rules) = &rules {
        let candidates = parents
            .iter()
            .filter_map(|(_, c)| c.as_ref().ok())
            .flatten()
            .map(|(idx, hosts)| (*idx, hosts.clone()))
            .collect::<BTreeMap<_, _>>();
        for (idx, hostnames) in candidates {
            let ir_routes = ir_routes(&agg.id, created, &hostnames, rules, &actions, policy);
            let listener = &mut listeners[idx];
            let owner = listener.routes.iter().find_map(|existing| {
                let conflicts = existing.id.route != agg.id
                    && ir_routes.iter().any(|r| {
                        r.hostnames == existing.hostnames && r.matches.is_identical(&existing.matches)
                    });
                conflicts.then(|| existing.id.route.clone())
            });
            if owner.is_none() {
                listener.routes.extend(ir_routes);
                listener.attached.insert(agg.id.clone());
            }
            placed.insert(idx, owner);
        }
    }

    let parents = parents
        .into_iter()
        .map(|(parent, candidates)| {
            let accepted = match (&rules, candidates) {
                (_, Err(cond)) => cond,
                (Err(error), Ok(_)) => {
                    Condition::new(ConditionType::Accepted, false, Reason::UnsupportedValue)
                        .with_message(error.to_string())
                }
                (Ok(_), Ok(candidates)) => {
                    let owners = candidates
                        .keys()
                        .filter_map(|idx| placed.get(idx))
                        .collect::<Vec<_>>();
                    if owners.iter().any(|owner| owner.is_none()) {
                        Condition::accepted()
                    } else {
                        let owner = owners.into_iter().flatten().next();
                        Condition::new(ConditionType::Accepted, false, Reason::Conflicted)
                            .with_message(match owner {
                                Some(owner) => format!("a match conflicts with the older route {owner}"),
                                None => "a match conflicts with an older route".to_string(),
                            })
                    }
                }
            };
            let programmed = match (&unhealthy, accepted.is_true()) {
                (_, false) => Condition::new(ConditionType::Programmed, false, Reason::Invalid)
                    .with_message("the route is not accepted"),
                (Some(message), true) => {
                    Condition::new(ConditionType::Programmed, false, Reason::BackendUnhealthy)
                        .with_message(message.clone())
                }
                (None, true) => Condition::new(ConditionType::Programmed, true, Reason::Programmed),
            };
            ParentOutcome {
                parent,
                conditions: vec![accepted, resolved_refs.clone(), programmed],
            }
        })
        .collect();

    RouteOutcome {
        id: agg.id.clone(),
        generation: route.metadata.generation,
        parents,
    }
}

/// Finds the listeners a parent reference attaches to, along with the
/// route's effective hostnames on each.
fn parent_listeners(
    listeners: &[ListenerState],
    route_ns: &str,
    gateway_ns: &str,
    parent: &api::ParentReference,
    route_hostnames: &[String],
) -> Result<BTreeMap<usize, Vec<String>>, Condition> {
    let rejected = |reason, message: &str| {
        Condition::new(ConditionType::Accepted, false, reason).with_message(message)
    };

    let matched = listeners
        .iter()
        .enumerate()
        .filter(|(_, l)| parent.section_name.as_ref().map_or(true, |s| *s == l.name))
        .filter(|(_, l)| parent.port.map_or(true, |p| p == l.port))
        .collect::<Vec<_>>();
    if matched.is_empty() {
        return Err(rejected(
            Reason::NoMatchingParent,
            "no listener matches the parent reference",
        ));
    }

    let valid = matched
        .into_iter()
        .filter(|(_, l)| l.is_valid())
        .collect::<Vec<_>>();
    if valid.is_empty() {
        return Err(rejected(
            Reason::NoMatchingParent,
            "the matching listeners are not valid",
        ));
    }

    let allowed = valid
        .into_iter()
        .filter(|(_, l)| l.allows_routes && (l.all_namespaces || route_ns == gateway_ns))
        .collect::<Vec<_>>();
    if allowed.is_empty() {
        return Err(rejected(
            Reason::NotAllowedByListeners,
            "the listeners do not allow this route",
        ));
    }

    let hostnames = allowed
        .into_iter()
        .filter_map(|(idx, l)| {
            hostname::intersect(l.hostname.as_deref(), route_hostnames).map(|h| (idx, h))
        })
        .collect::<BTreeMap<_, _>>();
    if hostnames.is_empty() {
        return Err(rejected(
            Reason::NoMatchingListenerHostname,
            "no route hostname matches a listener hostname",
        ));
    }
    Ok(hostnames)
}

/// Resolves each rule's backends into an action.
///
/// Returns the actions, the route's `ResolvedRefs` condition, and a message
/// naming an unhealthy backend, if any.
fn rule_actions(
    agg: &AggregatedRoute,
    backends: &mut BTreeMap<String, ResolvedBackend>,
) -> (Vec<RouteAction>, Condition, Option<String>) {
    let mut resolved_refs = Condition::new(ConditionType::ResolvedRefs, true, Reason::ResolvedRefs);
    let mut unhealthy = None;
    let mut actions = Vec::new();

    let rules = agg.route.spec.rules.iter().flatten();
    for (rule, refs) in rules.zip(&agg.backends) {
        let mut forward = Vec::new();
        for (backend_ref, target) in rule.backend_refs.iter().flatten().zip(refs) {
            let failure = match target {
                Ref::Resolved(target) => {
                    let resolved = resolve_backend(target);
                    let name = resolved.backend.name.clone();
                    let weight = backend_ref.weight.unwrap_or(1);
                    if weight > 0 {
                        if unhealthy.is_none() && !resolved.backend.has_healthy_endpoints() {
                            unhealthy = Some(format!("backend {name} has no healthy endpoints"));
                        }
                        forward.push(WeightedBackend {
                            name: name.clone(),
                            weight,
                        });
                    }
                    backends.insert(name, resolved);
                    continue;
                }
                Ref::NotFound(message) => (Reason::BackendNotFound, message),
                Ref::NotPermitted(message) => (Reason::RefNotPermitted, message),
                Ref::InvalidKind(message) => (Reason::InvalidKind, message),
            };
            if resolved_refs.is_true() {
                let (reason, message) = failure;
                resolved_refs = Condition::new(ConditionType::ResolvedRefs, false, reason)
                    .with_message(message.clone());
            }
        }

        actions.push(if forward.is_empty() {
            RouteAction::Fail {
                status: SERVER_ERROR,
            }
        } else {
            RouteAction::Forward(forward)
        });
    }

    (actions, resolved_refs, unhealthy)
}

fn resolve_backend(target: &BackendTarget) -> ResolvedBackend {
    match target {
        BackendTarget::Service {
            id,
            service,
            port,
            slices,
        } => {
            let name = service_cluster_name(id, *port);
            let port_name = service
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .find(|p| p.port == i32::from(*port))
                .and_then(|p| p.name.clone())
                .unwrap_or_default();

            let mut endpoints = BTreeMap::<SocketAddr, bool>::new();
            for slice in slices {
                let target_port = slice
                    .ports
                    .iter()
                    .flatten()
                    .find(|p| p.name.clone().unwrap_or_default() == port_name)
                    .and_then(|p| p.port)
                    .and_then(|p| u16::try_from(p).ok());
                let Some(target_port) = target_port else {
                    continue;
                };
                for endpoint in &slice.endpoints {
                    let ready = endpoint
                        .conditions
                        .as_ref()
                        .and_then(|c| c.ready)
                        .unwrap_or(true);
                    for addr in &endpoint.addresses {
                        match addr.parse::<IpAddr>() {
                            Ok(ip) => {
                                *endpoints
                                    .entry(SocketAddr::new(ip, target_port))
                                    .or_default() |= ready;
                            }
                            Err(error) => {
                                tracing::debug!(%error, %addr, "Ignoring endpoint address")
                            }
                        }
                    }
                }
            }

            ResolvedBackend {
                backend: ir::Backend {
                    name,
                    endpoints: endpoints
                        .into_iter()
                        .map(|(addr, healthy)| ir::Endpoint {
                            addr,
                            weight: 1,
                            healthy,
                        })
                        .collect(),
                },
                resource: None,
            }
        }

        BackendTarget::Backend { id, backend } => {
            let mut endpoints = backend
                .spec
                .endpoints
                .iter()
                .filter_map(|ep| match ep.address.parse::<IpAddr>() {
                    Ok(ip) => Some(ir::Endpoint {
                        addr: SocketAddr::new(ip, ep.port),
                        weight: ep.weight.unwrap_or(1),
                        healthy: ep.healthy.unwrap_or(true),
                    }),
                    Err(error) => {
                        tracing::debug!(%error, backend = %id, address = %ep.address, "Ignoring endpoint");
                        None
                    }
                })
                .filter(|ep| ep.weight > 0)
                .collect::<Vec<_>>();
            endpoints.sort();
            endpoints.dedup_by(|a, b| a.addr == b.addr);

            ResolvedBackend {
                backend: ir::Backend {
                    name: backend_cluster_name(id),
                    endpoints,
                },
                resource: Some((id.clone(), backend.metadata.generation)),
            }
        }
    }
}

fn ir_routes(
    id: &ObjectId,
    created: Option<DateTime<Utc>>,
    hostnames: &[String],
    rules: &[Rule],
    actions: &[RouteAction],
    policy: Option<&EffectivePolicy>,
) -> Vec<ir::Route> {
    let mut routes = Vec::new();
    for (rule_idx, (rule, action)) in rules.iter().zip(actions).enumerate() {
        let action = match &rule.redirect {
            Some(redirect) => RouteAction::Redirect(redirect.clone()),
            None => action.clone(),
        };

        let mut policies = Vec::with_capacity(2);
        if let Some(timeout) = rule.timeout.or_else(|| policy.and_then(|p| p.timeout)) {
            policies.push(RoutePolicy::Timeout(timeout));
        }
        if let Some(retry) = policy.and_then(|p| p.retry.clone()) {
            policies.push(RoutePolicy::Retry(retry));
        }

        for (match_idx, matches) in rule.matches.iter().enumerate() {
            routes.push(ir::Route {
                id: RouteId {
                    route: id.clone(),
                    rule: rule_idx,
                    match_index: match_idx,
                },
                creation_timestamp: created,
                hostnames: hostnames.to_vec(),
                matches: matches.clone(),
                action: action.clone(),
                policies: policies.clone(),
                priority: 0,
            });
        }
    }
    routes
}

fn parse_rule(rule: &api::HttpRouteRule) -> Result<Rule, ValidationError> {
    let mut matches = rule
        .matches
        .iter()
        .flatten()
        .map(parse_match)
        .collect::<Result<Vec<_>, _>>()?;
    if matches.is_empty() {
        matches.push(HttpRouteMatch::default());
    }

    let mut redirect = None;
    for filter in rule.filters.iter().flatten() {
        match (filter.r#type.as_str(), &filter.request_redirect) {
            ("RequestRedirect", Some(r)) => redirect = Some(parse_redirect(r)?),
            ("RequestRedirect", None) => {
                return Err(ValidationError::Redirect(
                    "requestRedirect must be set".to_string(),
                ))
            }
            (other, _) => return Err(ValidationError::FilterType(other.to_string())),
        }
    }

    let timeout = rule
        .timeouts
        .as_ref()
        .and_then(|t| t.request.as_deref())
        .map(parse_duration)
        .transpose()?;

    Ok(Rule {
        matches,
        redirect,
        timeout,
    })
}

fn parse_match(m: &api::HttpRouteMatch) -> Result<HttpRouteMatch, ValidationError> {
    let path = match &m.path {
        None => PathMatch::Prefix("/".to_string()),
        Some(path) => {
            let value = path.value.clone().unwrap_or_else(|| "/".to_string());
            match path.r#type.as_deref().unwrap_or("PathPrefix") {
                "Exact" if value.starts_with('/') => PathMatch::Exact(value),
                "PathPrefix" if value.starts_with('/') => PathMatch::Prefix(value),
                "Exact" | "PathPrefix" => return Err(ValidationError::RelativePath(value)),
                "RegularExpression" => PathMatch::regex(&value)
                    .map_err(|e| ValidationError::Regex(value.clone(), e.to_string()))?,
                other => return Err(ValidationError::PathMatchType(other.to_string())),
            }
        }
    };

    let headers = m
        .headers
        .iter()
        .flatten()
        .map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| ValidationError::HeaderName(h.name.clone()))?;
            match h.r#type.as_deref().unwrap_or("Exact") {
                "Exact" => Ok(HeaderMatch::Exact(name, h.value.clone())),
                "RegularExpression" => Regex::new(&h.value)
                    .map(|re| HeaderMatch::Regex(name, re))
                    .map_err(|e| ValidationError::Regex(h.value.clone(), e.to_string())),
                other => Err(ValidationError::HeaderMatchType(other.to_string())),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let method = m
        .method
        .as_deref()
        .map(|m| Method::from_bytes(m.as_bytes()).map_err(|_| ValidationError::Method(m.to_string())))
        .transpose()?;

    Ok(HttpRouteMatch {
        path,
        headers,
        method,
    })
}

fn parse_redirect(
    filter: &api::HttpRequestRedirectFilter,
) -> Result<RequestRedirectFilter, ValidationError> {
    let invalid = |msg: String| ValidationError::Redirect(msg);

    let scheme = match filter.scheme.as_deref() {
        None => None,
        Some("http") => Some(Scheme::HTTP),
        Some("https") => Some(Scheme::HTTPS),
        Some(other) => return Err(invalid(format!("unsupported scheme {other:?}"))),
    };

    let path = match &filter.path {
        None => None,
        Some(modifier) => Some(match modifier.r#type.as_str() {
            "ReplaceFullPath" => PathModifier::Full(
                modifier
                    .replace_full_path
                    .clone()
                    .ok_or_else(|| invalid("replaceFullPath must be set".to_string()))?,
            ),
            "ReplacePrefixMatch" => PathModifier::Prefix(
                modifier
                    .replace_prefix_match
                    .clone()
                    .ok_or_else(|| invalid("replacePrefixMatch must be set".to_string()))?,
            ),
            other => return Err(invalid(format!("unsupported path modifier {other:?}"))),
        }),
    };

    let port = filter
        .port
        .map(|p| NonZeroU16::new(p).ok_or_else(|| invalid("port must not be zero".to_string())))
        .transpose()?;

    let status = filter
        .status_code
        .map(|code| match code {
            301 | 302 | 303 | 307 | 308 => StatusCode::from_u16(code)
                .map_err(|_| invalid(format!("invalid status code {code}"))),
            _ => Err(invalid(format!("status code {code} is not a redirect"))),
        })
        .transpose()?;

    Ok(RequestRedirectFilter {
        scheme,
        host: filter.hostname.clone(),
        path,
        port,
        status,
    })
}

fn parse_duration(s: &str) -> Result<Duration, ValidationError> {
    s.parse::<k8s::Duration>()
        .map(Into::into)
        .map_err(|e| ValidationError::Duration(s.to_string(), e))
}

/// Orders objects oldest first. Objects without a creation timestamp sort
/// last, and ties break on namespace and name.
fn age_key<T: ResourceExt>(obj: &T, id: &ObjectId) -> (bool, Option<DateTime<Utc>>, ObjectId) {
    let created = k8s::creation_timestamp(obj);
    (created.is_none(), created, id.clone())
}

