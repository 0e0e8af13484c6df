use ahash::AHashMap as HashMap;
use gantry_controller_core::{GroupId, ObjectId};
use gantry_controller_k8s_api::{self as k8s, ResourceExt};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};
use tokio::sync::mpsc;

pub type SharedStore = Arc<RwLock<Store>>;

/// Holds every watched object and the indices needed to find the snapshot
/// groups an object change affects.
///
/// Each change is published on an unbounded channel as one [`GroupEvent`]
/// per affected group. Nothing is published until every watched kind has
/// completed its initial listing; at that point every handled gateway is
/// announced.
#[derive(Debug)]
pub struct Store {
    controller_name: String,
    pending: BTreeSet<Kind>,
    changes: mpsc::UnboundedSender<GroupEvent>,

    pub(crate) classes: HashMap<String, Arc<k8s::GatewayClass>>,
    pub(crate) gateways: HashMap<ObjectId, Arc<k8s::Gateway>>,
    pub(crate) routes: HashMap<ObjectId, Arc<k8s::HttpRoute>>,
    routes_by_parent: HashMap<ObjectId, BTreeSet<ObjectId>>,
    pub(crate) services: HashMap<ObjectId, Arc<k8s::Service>>,
    slices: HashMap<ObjectId, BTreeMap<String, Arc<k8s::EndpointSlice>>>,
    slice_owners: HashMap<ObjectId, ObjectId>,
    pub(crate) backends: HashMap<ObjectId, Arc<k8s::Backend>>,
    pub(crate) secrets: HashMap<ObjectId, Arc<k8s::Secret>>,
    grants: HashMap<String, BTreeMap<String, Arc<k8s::ReferenceGrant>>>,
    pub(crate) policies: HashMap<ObjectId, Arc<k8s::TrafficPolicy>>,
    policies_by_target: HashMap<PolicyTarget, BTreeSet<ObjectId>>,
    pub(crate) deps: Dependencies,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    Changed(GroupId),
    Removed(GroupId),
}

#[derive(Copy, Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("the store has not completed its initial sync")]
pub struct NotReady;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    GatewayClass,
    Gateway,
    HttpRoute,
    ReferenceGrant,
    Service,
    EndpointSlice,
    Backend,
    Secret,
    TrafficPolicy,
}

/// Something an aggregation looked up, whether or not it was found.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Class(String),
    Gateway(ObjectId),
    Address(IpAddr),
    Route(ObjectId),
    Service(ObjectId),
    Backend(ObjectId),
    Secret(ObjectId),
    Grants(String),
    Policies(PolicyTarget),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyTarget {
    Gateway(ObjectId),
    Route(ObjectId),
}

/// Maps keys to the groups whose last aggregation consulted them.
#[derive(Debug, Default)]
pub(crate) struct Dependencies {
    groups_by_key: HashMap<Key, BTreeSet<GroupId>>,
    keys_by_group: HashMap<GroupId, BTreeSet<Key>>,
}

// === impl Store ===

impl Store {
    pub fn new(controller_name: impl ToString, changes: mpsc::UnboundedSender<GroupEvent>) -> Self {
        Self {
            controller_name: controller_name.to_string(),
            pending: Kind::ALL.iter().copied().collect(),
            changes,
            classes: HashMap::default(),
            gateways: HashMap::default(),
            routes: HashMap::default(),
            routes_by_parent: HashMap::default(),
            services: HashMap::default(),
            slices: HashMap::default(),
            slice_owners: HashMap::default(),
            backends: HashMap::default(),
            secrets: HashMap::default(),
            grants: HashMap::default(),
            policies: HashMap::default(),
            policies_by_target: HashMap::default(),
            deps: Dependencies::default(),
        }
    }

    pub fn shared(
        controller_name: impl ToString,
        changes: mpsc::UnboundedSender<GroupEvent>,
    ) -> SharedStore {
        Arc::new(RwLock::new(Self::new(controller_name, changes)))
    }

    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    /// Indicates whether every watched kind has completed its initial listing.
    pub fn is_ready(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn check_ready(&self) -> Result<(), NotReady> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(NotReady)
        }
    }

    /// Lists the gateways whose class is handled by this controller.
    pub fn gateways(&self) -> Result<Vec<GroupId>, NotReady> {
        self.check_ready()?;
        Ok(self.handled_gateways())
    }

    pub fn gateway(&self, id: &ObjectId) -> Result<Option<Arc<k8s::Gateway>>, NotReady> {
        self.check_ready()?;
        Ok(self.gateways.get(id).cloned())
    }

    pub fn routes_attached_to(
        &self,
        gateway: &ObjectId,
    ) -> Result<Vec<Arc<k8s::HttpRoute>>, NotReady> {
        self.check_ready()?;
        Ok(self.attached_routes(gateway).cloned().collect())
    }

    pub fn endpoint_slices_for(
        &self,
        service: &ObjectId,
    ) -> Result<Vec<Arc<k8s::EndpointSlice>>, NotReady> {
        self.check_ready()?;
        Ok(self.service_slices(service).cloned().collect())
    }

    pub fn grants_in(&self, namespace: &str) -> Result<Vec<Arc<k8s::ReferenceGrant>>, NotReady> {
        self.check_ready()?;
        Ok(self.namespace_grants(namespace).cloned().collect())
    }

    pub fn policies_targeting(
        &self,
        target: &PolicyTarget,
    ) -> Result<Vec<Arc<k8s::TrafficPolicy>>, NotReady> {
        self.check_ready()?;
        Ok(self.target_policies(target).cloned().collect())
    }

    /// Drops the dependencies recorded for a group that no longer exists.
    pub fn forget(&mut self, group: &GroupId) {
        self.deps.forget(group);
    }

    /// Returns the number of objects of the given kind.
    pub fn len(&self, kind: Kind) -> usize {
        match kind {
            Kind::GatewayClass => self.classes.len(),
            Kind::Gateway => self.gateways.len(),
            Kind::HttpRoute => self.routes.len(),
            Kind::ReferenceGrant => self.grants.values().map(BTreeMap::len).sum(),
            Kind::Service => self.services.len(),
            Kind::EndpointSlice => self.slice_owners.len(),
            Kind::Backend => self.backends.len(),
            Kind::Secret => self.secrets.len(),
            Kind::TrafficPolicy => self.policies.len(),
        }
    }

    pub(crate) fn dependency_count(&self) -> (usize, usize) {
        (
            self.deps.groups_by_key.len(),
            self.deps.keys_by_group.len(),
        )
    }

    pub(crate) fn is_handled(&self, id: &GroupId) -> bool {
        self.gateways
            .get(id)
            .map(|gw| self.is_handled_class(&gw.spec.gateway_class_name))
            .unwrap_or(false)
    }

    pub(crate) fn is_handled_class(&self, name: &str) -> bool {
        self.classes
            .get(name)
            .map(|class| class.spec.controller_name == self.controller_name)
            .unwrap_or(false)
    }

    fn handled_gateways(&self) -> Vec<GroupId> {
        let mut ids = self
            .gateways
            .keys()
            .filter(|id| self.is_handled(id))
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub(crate) fn attached_routes<'a>(
        &'a self,
        gateway: &ObjectId,
    ) -> impl Iterator<Item = &'a Arc<k8s::HttpRoute>> + 'a {
        self.routes_by_parent
            .get(gateway)
            .into_iter()
            .flatten()
            .filter_map(|id| self.routes.get(id))
    }

    pub(crate) fn service_slices<'a>(
        &'a self,
        service: &ObjectId,
    ) -> impl Iterator<Item = &'a Arc<k8s::EndpointSlice>> + 'a {
        self.slices.get(service).into_iter().flat_map(BTreeMap::values)
    }

    pub(crate) fn namespace_grants<'a>(
        &'a self,
        namespace: &str,
    ) -> impl Iterator<Item = &'a Arc<k8s::ReferenceGrant>> + 'a {
        self.grants.get(namespace).into_iter().flat_map(BTreeMap::values)
    }

    pub(crate) fn target_policies<'a>(
        &'a self,
        target: &PolicyTarget,
    ) -> impl Iterator<Item = &'a Arc<k8s::TrafficPolicy>> + 'a {
        self.policies_by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|id| self.policies.get(id))
    }

    /// Publishes an event for each group affected by a change.
    ///
    /// Groups that are still handled are rebuilt. Groups that were built
    /// before but are no longer handled are removed.
    fn notify(
        &self,
        keys: impl IntoIterator<Item = Key>,
        direct: impl IntoIterator<Item = GroupId>,
    ) {
        if !self.is_ready() {
            return;
        }

        let mut groups = direct.into_iter().collect::<BTreeSet<_>>();
        for key in keys {
            groups.extend(self.deps.groups(&key).cloned());
        }

        for group in groups {
            let event = if self.is_handled(&group) {
                GroupEvent::Changed(group)
            } else if self.deps.contains(&group) {
                GroupEvent::Removed(group)
            } else {
                continue;
            };
            tracing::trace!(?event);
            if self.changes.send(event).is_err() {
                tracing::debug!("Group event receiver dropped");
            }
        }
    }

    fn synced(&mut self, kind: Kind) {
        if !self.pending.remove(&kind) {
            return;
        }
        tracing::debug!(?kind, "Initial listing complete");
        if !self.pending.is_empty() {
            return;
        }

        let gateways = self.handled_gateways();
        tracing::info!(gateways = gateways.len(), "Store synced");
        for id in gateways {
            if self.changes.send(GroupEvent::Changed(id)).is_err() {
                tracing::debug!("Group event receiver dropped");
            }
        }
    }

    fn reset_namespaced<T>(&mut self, kind: Kind, resources: Vec<T>, removed: NamespacedRemoved)
    where
        Self: IndexNamespacedResource<T>,
    {
        for resource in resources {
            IndexNamespacedResource::<T>::apply(self, resource);
        }
        for (namespace, names) in removed {
            for name in names {
                IndexNamespacedResource::<T>::delete(self, namespace.clone(), name);
            }
        }
        self.synced(kind);
    }

    fn index_route(&mut self, id: &ObjectId, route: &k8s::HttpRoute) -> BTreeSet<ObjectId> {
        let parents = parent_gateways(&id.namespace, route);
        for parent in &parents {
            self.routes_by_parent
                .entry(parent.clone())
                .or_default()
                .insert(id.clone());
        }
        parents
    }

    fn unindex_route(&mut self, id: &ObjectId, route: &k8s::HttpRoute) -> BTreeSet<ObjectId> {
        let parents = parent_gateways(&id.namespace, route);
        for parent in &parents {
            if let Some(routes) = self.routes_by_parent.get_mut(parent) {
                routes.remove(id);
                if routes.is_empty() {
                    self.routes_by_parent.remove(parent);
                }
            }
        }
        parents
    }

    fn unindex_slice(&mut self, id: &ObjectId) -> Option<ObjectId> {
        let service = self.slice_owners.remove(id)?;
        if let Some(slices) = self.slices.get_mut(&service) {
            slices.remove(&id.name);
            if slices.is_empty() {
                self.slices.remove(&service);
            }
        }
        Some(service)
    }

    fn unindex_policy(&mut self, id: &ObjectId, policy: &k8s::TrafficPolicy) -> Option<PolicyTarget> {
        let target = policy_target(&id.namespace, policy)?;
        if let Some(policies) = self.policies_by_target.get_mut(&target) {
            policies.remove(id);
            if policies.is_empty() {
                self.policies_by_target.remove(&target);
            }
        }
        Some(target)
    }
}

impl IndexClusterResource<k8s::GatewayClass> for Store {
    fn apply(&mut self, class: k8s::GatewayClass) {
        let name = class.name_unchecked();
        self.classes.insert(name.clone(), Arc::new(class));
        self.class_changed(name);
    }

    fn delete(&mut self, name: String) {
        if self.classes.remove(&name).is_some() {
            self.class_changed(name);
        }
    }

    fn reset(&mut self, classes: Vec<k8s::GatewayClass>, removed: ClusterRemoved) {
        for class in classes {
            IndexClusterResource::apply(self, class);
        }
        for name in removed {
            IndexClusterResource::<k8s::GatewayClass>::delete(self, name);
        }
        self.synced(Kind::GatewayClass);
    }
}

impl Store {
    fn class_changed(&self, name: String) {
        // Every gateway of the class is re-evaluated, along with the gateways
        // sharing addresses with them.
        let mut keys = Vec::new();
        let mut direct = Vec::new();
        for (id, gw) in &self.gateways {
            if gw.spec.gateway_class_name == name {
                direct.push(id.clone());
                keys.extend(explicit_addresses(gw).map(Key::Address));
            }
        }
        keys.push(Key::Class(name));
        self.notify(keys, direct);
    }
}

impl IndexNamespacedResource<k8s::Gateway> for Store {
    fn apply(&mut self, gateway: k8s::Gateway) {
        let Some(id) = object_id(&gateway) else {
            return;
        };
        let mut keys = vec![Key::Gateway(id.clone())];
        keys.extend(explicit_addresses(&gateway).map(Key::Address));
        if let Some(old) = self.gateways.insert(id.clone(), Arc::new(gateway)) {
            keys.extend(explicit_addresses(&old).map(Key::Address));
        }
        self.notify(keys, [id]);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if let Some(old) = self.gateways.remove(&id) {
            let mut keys = vec![Key::Gateway(id.clone())];
            keys.extend(explicit_addresses(&old).map(Key::Address));
            self.notify(keys, [id]);
        }
    }

    fn reset(&mut self, gateways: Vec<k8s::Gateway>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::Gateway, gateways, removed)
    }
}

impl IndexNamespacedResource<k8s::HttpRoute> for Store {
    fn apply(&mut self, route: k8s::HttpRoute) {
        let Some(id) = object_id(&route) else {
            return;
        };
        let mut parents = BTreeSet::new();
        if let Some(old) = self.routes.remove(&id) {
            parents.extend(self.unindex_route(&id, &old));
        }
        parents.extend(self.index_route(&id, &route));
        self.routes.insert(id.clone(), Arc::new(route));
        self.notify([Key::Route(id)], parents);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if let Some(old) = self.routes.remove(&id) {
            let parents = self.unindex_route(&id, &old);
            self.notify([Key::Route(id)], parents);
        }
    }

    fn reset(&mut self, routes: Vec<k8s::HttpRoute>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::HttpRoute, routes, removed)
    }
}

impl IndexNamespacedResource<k8s::ReferenceGrant> for Store {
    fn apply(&mut self, grant: k8s::ReferenceGrant) {
        let Some(id) = object_id(&grant) else {
            return;
        };
        self.grants
            .entry(id.namespace.clone())
            .or_default()
            .insert(id.name, Arc::new(grant));
        self.notify([Key::Grants(id.namespace)], []);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(grants) = self.grants.get_mut(&namespace) {
            if grants.remove(&name).is_some() {
                if grants.is_empty() {
                    self.grants.remove(&namespace);
                }
                self.notify([Key::Grants(namespace)], []);
            }
        }
    }

    fn reset(&mut self, grants: Vec<k8s::ReferenceGrant>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::ReferenceGrant, grants, removed)
    }
}

impl IndexNamespacedResource<k8s::Service> for Store {
    fn apply(&mut self, service: k8s::Service) {
        let Some(id) = object_id(&service) else {
            return;
        };
        self.services.insert(id.clone(), Arc::new(service));
        self.notify([Key::Service(id)], []);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if self.services.remove(&id).is_some() {
            self.notify([Key::Service(id)], []);
        }
    }

    fn reset(&mut self, services: Vec<k8s::Service>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::Service, services, removed)
    }
}

impl IndexNamespacedResource<k8s::EndpointSlice> for Store {
    fn apply(&mut self, slice: k8s::EndpointSlice) {
        let Some(id) = object_id(&slice) else {
            return;
        };
        let mut keys = Vec::with_capacity(2);
        if let Some(old) = self.unindex_slice(&id) {
            keys.push(Key::Service(old));
        }

        match slice.labels().get(k8s::SERVICE_NAME_LABEL) {
            Some(service) => {
                let service = ObjectId::new(&id.namespace, service);
                self.slices
                    .entry(service.clone())
                    .or_default()
                    .insert(id.name.clone(), Arc::new(slice));
                self.slice_owners.insert(id, service.clone());
                keys.push(Key::Service(service));
            }
            None => tracing::debug!(slice = %id, "EndpointSlice has no service label"),
        }
        self.notify(keys, []);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if let Some(service) = self.unindex_slice(&id) {
            self.notify([Key::Service(service)], []);
        }
    }

    fn reset(&mut self, slices: Vec<k8s::EndpointSlice>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::EndpointSlice, slices, removed)
    }
}

impl IndexNamespacedResource<k8s::Backend> for Store {
    fn apply(&mut self, backend: k8s::Backend) {
        let Some(id) = object_id(&backend) else {
            return;
        };
        self.backends.insert(id.clone(), Arc::new(backend));
        self.notify([Key::Backend(id)], []);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if self.backends.remove(&id).is_some() {
            self.notify([Key::Backend(id)], []);
        }
    }

    fn reset(&mut self, backends: Vec<k8s::Backend>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::Backend, backends, removed)
    }
}

impl IndexNamespacedResource<k8s::Secret> for Store {
    fn apply(&mut self, secret: k8s::Secret) {
        let Some(id) = object_id(&secret) else {
            return;
        };
        self.secrets.insert(id.clone(), Arc::new(secret));
        self.notify([Key::Secret(id)], []);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if self.secrets.remove(&id).is_some() {
            self.notify([Key::Secret(id)], []);
        }
    }

    fn reset(&mut self, secrets: Vec<k8s::Secret>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::Secret, secrets, removed)
    }
}

impl IndexNamespacedResource<k8s::TrafficPolicy> for Store {
    fn apply(&mut self, policy: k8s::TrafficPolicy) {
        let Some(id) = object_id(&policy) else {
            return;
        };
        let mut keys = Vec::with_capacity(2);
        if let Some(old) = self.policies.remove(&id) {
            keys.extend(self.unindex_policy(&id, &old).map(Key::Policies));
        }
        if let Some(target) = policy_target(&id.namespace, &policy) {
            self.policies_by_target
                .entry(target.clone())
                .or_default()
                .insert(id.clone());
            keys.push(Key::Policies(target));
        }
        self.policies.insert(id, Arc::new(policy));
        self.notify(keys, []);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ObjectId { namespace, name };
        if let Some(old) = self.policies.remove(&id) {
            let target = self.unindex_policy(&id, &old);
            self.notify(target.map(Key::Policies), []);
        }
    }

    fn reset(&mut self, policies: Vec<k8s::TrafficPolicy>, removed: NamespacedRemoved) {
        self.reset_namespaced(Kind::TrafficPolicy, policies, removed)
    }
}

// === impl Kind ===

impl Kind {
    pub const ALL: [Kind; 9] = [
        Kind::GatewayClass,
        Kind::Gateway,
        Kind::HttpRoute,
        Kind::ReferenceGrant,
        Kind::Service,
        Kind::EndpointSlice,
        Kind::Backend,
        Kind::Secret,
        Kind::TrafficPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::GatewayClass => "gatewayclass",
            Kind::Gateway => "gateway",
            Kind::HttpRoute => "httproute",
            Kind::ReferenceGrant => "referencegrant",
            Kind::Service => "service",
            Kind::EndpointSlice => "endpointslice",
            Kind::Backend => "backend",
            Kind::Secret => "secret",
            Kind::TrafficPolicy => "trafficpolicy",
        }
    }
}

// === impl Dependencies ===

impl Dependencies {
    pub(crate) fn record(&mut self, group: &GroupId, keys: BTreeSet<Key>) {
        self.forget(group);
        for key in &keys {
            self.groups_by_key
                .entry(key.clone())
                .or_default()
                .insert(group.clone());
        }
        self.keys_by_group.insert(group.clone(), keys);
    }

    fn forget(&mut self, group: &GroupId) {
        let Some(keys) = self.keys_by_group.remove(group) else {
            return;
        };
        for key in keys {
            if let Some(groups) = self.groups_by_key.get_mut(&key) {
                groups.remove(group);
                if groups.is_empty() {
                    self.groups_by_key.remove(&key);
                }
            }
        }
    }

    fn groups<'a>(&'a self, key: &Key) -> impl Iterator<Item = &'a GroupId> + 'a {
        self.groups_by_key.get(key).into_iter().flatten()
    }

    fn contains(&self, group: &GroupId) -> bool {
        self.keys_by_group.contains_key(group)
    }
}

fn object_id<T: ResourceExt>(obj: &T) -> Option<ObjectId> {
    let Some(namespace) = obj.namespace() else {
        tracing::warn!(name = %obj.name_any(), "Ignoring object without a namespace");
        return None;
    };
    Some(ObjectId::new(namespace, obj.name_unchecked()))
}

/// The gateways a route names as parents.
pub(crate) fn parent_gateways(namespace: &str, route: &k8s::HttpRoute) -> BTreeSet<ObjectId> {
    route
        .spec
        .parent_refs
        .iter()
        .flatten()
        .filter(|parent| parent.is_gateway())
        .map(|parent| {
            let ns = parent.namespace.as_deref().unwrap_or(namespace);
            ObjectId::new(ns, &parent.name)
        })
        .collect()
}

/// The IP addresses a gateway requests explicitly.
pub(crate) fn explicit_addresses(gateway: &k8s::Gateway) -> impl Iterator<Item = IpAddr> + '_ {
    gateway
        .spec
        .addresses
        .iter()
        .flatten()
        .filter(|addr| addr.r#type.as_deref().unwrap_or("IPAddress") == "IPAddress")
        .filter_map(|addr| addr.value.parse().ok())
}

pub(crate) fn policy_target(namespace: &str, policy: &k8s::TrafficPolicy) -> Option<PolicyTarget> {
    let target = &policy.spec.target_ref;
    let id = ObjectId::new(namespace, &target.name);
    if target.targets_kind::<k8s::HttpRoute>() {
        Some(PolicyTarget::Route(id))
    } else if target.targets_kind::<k8s::Gateway>() {
        Some(PolicyTarget::Gateway(id))
    } else {
        None
    }
}
