//! Collects a gateway and everything it references into one group.
//!
//! Aggregation follows the reference edges of a gateway:
//!
//! ```text
//! [ GatewayClass ] <- [ Gateway ] -> [ Secret ]
//!                         ^
//!                    [ HTTPRoute ] -> [ Service -> EndpointSlice ] | [ Backend ]
//!                         ^
//!                  [ TrafficPolicy ]
//! ```
//!
//! References that cross a namespace boundary are only followed when a
//! `ReferenceGrant` in the target namespace permits them. Every lookup is
//! recorded as a dependency of the group, so that the store can tell which
//! groups a later change affects.

use crate::store::{self, Key, NotReady, PolicyTarget, Store};
use gantry_controller_core::{GroupId, ObjectId};
use gantry_controller_k8s_api::{self as k8s, gateway::GROUP as GATEWAY_GROUP, ResourceExt};
use std::{collections::BTreeSet, net::IpAddr, sync::Arc};

#[derive(Clone, Debug)]
pub struct AggregatedGroup {
    pub id: GroupId,
    pub gateway: Arc<k8s::Gateway>,

    /// Other handled gateways that request one of this gateway's addresses.
    pub peers: Vec<Arc<k8s::Gateway>>,

    /// Certificate references, indexed by listener and then by reference.
    pub certificates: Vec<Vec<Ref<Arc<k8s::Secret>>>>,

    /// Attached routes, ordered by identity.
    pub routes: Vec<AggregatedRoute>,

    /// Policies targeting the gateway or one of its routes, ordered by
    /// identity.
    pub policies: Vec<Arc<k8s::TrafficPolicy>>,
}

#[derive(Clone, Debug)]
pub struct AggregatedRoute {
    pub id: ObjectId,
    pub route: Arc<k8s::HttpRoute>,

    /// Backend references, indexed by rule and then by reference.
    pub backends: Vec<Vec<Ref<BackendTarget>>>,
}

/// The result of following a reference.
#[derive(Clone, Debug, PartialEq)]
pub enum Ref<T> {
    Resolved(T),
    NotFound(String),
    NotPermitted(String),
    InvalidKind(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum BackendTarget {
    Service {
        id: ObjectId,
        service: Arc<k8s::Service>,
        port: u16,
        slices: Vec<Arc<k8s::EndpointSlice>>,
    },
    Backend {
        id: ObjectId,
        backend: Arc<k8s::Backend>,
    },
}

const ROUTE_KIND: &str = "HTTPRoute";
const GATEWAY_KIND: &str = "Gateway";
const BACKEND_GROUP: &str = "gantry.io";
const BACKEND_KIND: &str = "Backend";

// === impl Store ===

impl Store {
    /// Aggregates the group rooted at the given gateway.
    ///
    /// Returns `None` when the gateway no longer exists or is not handled by
    /// this controller.
    pub fn aggregate(&mut self, id: &GroupId) -> Result<Option<AggregatedGroup>, NotReady> {
        self.check_ready()?;
        let mut keys = BTreeSet::new();
        let group = self.collect(id, &mut keys);
        if group.is_some() {
            self.deps.record(id, keys);
        }
        Ok(group)
    }

    fn collect(&self, id: &GroupId, keys: &mut BTreeSet<Key>) -> Option<AggregatedGroup> {
        keys.insert(Key::Gateway(id.clone()));
        let gateway = self.gateways.get(id)?.clone();
        keys.insert(Key::Class(gateway.spec.gateway_class_name.clone()));
        if !self.is_handled_class(&gateway.spec.gateway_class_name) {
            return None;
        }

        let addresses = store::explicit_addresses(&gateway).collect::<BTreeSet<IpAddr>>();
        keys.extend(addresses.iter().copied().map(Key::Address));
        let mut peers = self
            .gateways
            .iter()
            .filter(|(peer_id, _)| *peer_id != id)
            .filter(|(_, peer)| self.is_handled_class(&peer.spec.gateway_class_name))
            .filter(|(_, peer)| store::explicit_addresses(peer).any(|a| addresses.contains(&a)))
            .map(|(peer_id, peer)| (peer_id.clone(), peer.clone()))
            .collect::<Vec<_>>();
        peers.sort_by(|(a, _), (b, _)| a.cmp(b));

        let certificates = gateway
            .spec
            .listeners
            .iter()
            .map(|listener| {
                listener
                    .tls
                    .iter()
                    .flat_map(|tls| tls.certificate_refs.iter().flatten())
                    .map(|cert| self.resolve_certificate(&id.namespace, cert, keys))
                    .collect()
            })
            .collect();

        let mut routes = self
            .attached_routes(id)
            .map(|route| {
                let route_id =
                    ObjectId::new(route.namespace().unwrap_or_default(), route.name_unchecked());
                keys.insert(Key::Route(route_id.clone()));
                self.aggregate_route(route_id, route.clone(), keys)
            })
            .collect::<Vec<_>>();
        routes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut policies = Vec::new();
        let targets = std::iter::once(PolicyTarget::Gateway(id.clone()))
            .chain(routes.iter().map(|r| PolicyTarget::Route(r.id.clone())));
        for target in targets {
            policies.extend(self.target_policies(&target).cloned());
            keys.insert(Key::Policies(target));
        }
        policies.sort_by_key(|p| (p.namespace(), p.name_unchecked()));

        Some(AggregatedGroup {
            id: id.clone(),
            gateway,
            peers: peers.into_iter().map(|(_, peer)| peer).collect(),
            certificates,
            routes,
            policies,
        })
    }

    fn aggregate_route(
        &self,
        id: ObjectId,
        route: Arc<k8s::HttpRoute>,
        keys: &mut BTreeSet<Key>,
    ) -> AggregatedRoute {
        let backends = route
            .spec
            .rules
            .iter()
            .flatten()
            .map(|rule| {
                rule.backend_refs
                    .iter()
                    .flatten()
                    .map(|backend| self.resolve_backend(&id.namespace, backend, keys))
                    .collect()
            })
            .collect();
        AggregatedRoute { id, route, backends }
    }

    fn resolve_backend(
        &self,
        route_ns: &str,
        backend: &k8s::gateway::HttpBackendRef,
        keys: &mut BTreeSet<Key>,
    ) -> Ref<BackendTarget> {
        let group = backend.group.as_deref().unwrap_or("");
        let kind = backend.kind.as_deref().unwrap_or("Service");
        let namespace = backend.namespace.as_deref().unwrap_or(route_ns);
        let id = ObjectId::new(namespace, &backend.name);

        let (target_group, target_kind) = if is_service(group, kind) {
            ("", "Service")
        } else if is_backend(group, kind) {
            (BACKEND_GROUP, BACKEND_KIND)
        } else {
            return Ref::InvalidKind(format!("unsupported backend kind {group}/{kind}"));
        };

        if namespace != route_ns
            && !self.permits(
                (GATEWAY_GROUP, ROUTE_KIND, route_ns),
                namespace,
                (target_group, target_kind, &backend.name),
                keys,
            )
        {
            return Ref::NotPermitted(format!(
                "no ReferenceGrant in {namespace} permits a reference to {target_kind} {}",
                backend.name
            ));
        }

        if target_kind == "Service" {
            keys.insert(Key::Service(id.clone()));
            let Some(service) = self.services.get(&id) else {
                return Ref::NotFound(format!("service {id} not found"));
            };
            let Some(port) = backend.port else {
                return Ref::NotFound(format!("a port is required to reference service {id}"));
            };
            let has_port = service
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .any(|p| p.port == i32::from(port));
            if !has_port {
                return Ref::NotFound(format!("service {id} has no port {port}"));
            }
            Ref::Resolved(BackendTarget::Service {
                service: service.clone(),
                slices: self.service_slices(&id).cloned().collect(),
                id,
                port,
            })
        } else {
            keys.insert(Key::Backend(id.clone()));
            match self.backends.get(&id) {
                Some(backend) => Ref::Resolved(BackendTarget::Backend {
                    id,
                    backend: backend.clone(),
                }),
                None => Ref::NotFound(format!("backend {id} not found")),
            }
        }
    }

    fn resolve_certificate(
        &self,
        gateway_ns: &str,
        cert: &k8s::gateway::SecretObjectReference,
        keys: &mut BTreeSet<Key>,
    ) -> Ref<Arc<k8s::Secret>> {
        let group = cert.group.as_deref().unwrap_or("");
        let kind = cert.kind.as_deref().unwrap_or("Secret");
        if !group.is_empty() || kind != "Secret" {
            return Ref::InvalidKind(format!("unsupported certificate kind {group}/{kind}"));
        }

        let namespace = cert.namespace.as_deref().unwrap_or(gateway_ns);
        if namespace != gateway_ns
            && !self.permits(
                (GATEWAY_GROUP, GATEWAY_KIND, gateway_ns),
                namespace,
                ("", "Secret", &cert.name),
                keys,
            )
        {
            return Ref::NotPermitted(format!(
                "no ReferenceGrant in {namespace} permits a reference to Secret {}",
                cert.name
            ));
        }

        let id = ObjectId::new(namespace, &cert.name);
        keys.insert(Key::Secret(id.clone()));
        match self.secrets.get(&id) {
            Some(secret) => Ref::Resolved(secret.clone()),
            None => Ref::NotFound(format!("secret {id} not found")),
        }
    }

    /// Checks whether a grant in the target's namespace permits a
    /// cross-namespace reference.
    fn permits(
        &self,
        from: (&str, &str, &str),
        target_ns: &str,
        to: (&str, &str, &str),
        keys: &mut BTreeSet<Key>,
    ) -> bool {
        keys.insert(Key::Grants(target_ns.to_string()));
        self.namespace_grants(target_ns)
            .any(|grant| grant.permits(from, to))
    }
}

fn is_service(group: &str, kind: &str) -> bool {
    (group.is_empty() || group == "core") && kind == "Service"
}

fn is_backend(group: &str, kind: &str) -> bool {
    group == BACKEND_GROUP && kind == BACKEND_KIND
}
