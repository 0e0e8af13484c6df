use crate::resource_id::{ResourceId, StatusKind};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use gantry_controller_core::{
    status::{
        Condition, ConditionType, DiscoveryOutcome, GatewayOutcome, GroupOutcome,
        ListenerOutcome, Outcome, ParentOutcome, Reason, RouteOutcome, SnapshotOutcome,
    },
    GroupId, ObjectId,
};
use gantry_controller_k8s_api::{self as k8s, gateway, ResourceExt};
use kubert::lease::Claim;
use parking_lot::RwLock;
use prometheus_client::{
    metrics::{counter::Counter, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the status of every object this controller reports on, and queues
/// a patch whenever a record differs from the one last written.
pub struct Index {
    /// The lease claimant name of this replica.
    name: String,
    controller_name: String,
    claims: watch::Receiver<Arc<Claim>>,
    updates: mpsc::Sender<Update>,
    metrics: IndexMetrics,

    records: HashMap<ResourceId, Record>,

    /// The records last queued for writing, while this replica holds the
    /// lease.
    sent: HashMap<ResourceId, Record>,

    groups: HashMap<GroupId, GroupState>,
    routes: HashMap<ObjectId, RouteParents>,
}

pub struct Controller {
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    updates: mpsc::Receiver<Update>,
    failures: mpsc::UnboundedSender<ResourceId>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    patches_enqueued: Counter,
    patch_channel_full: Counter,
    stale_outcomes: Counter,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_dropped: Counter,
    patch_duration: Histogram,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq)]
struct Record {
    generation: Option<i64>,
    status: Status,
}

#[derive(Clone, Debug, PartialEq)]
enum Status {
    Conditions(Vec<Condition>),
    Gateway {
        conditions: Vec<Condition>,
        listeners: Vec<ListenerOutcome>,
    },
    Route(Vec<ParentOutcome>),
}

/// What is known about a group's configuration and the proxies serving it.
#[derive(Debug, Default)]
struct GroupState {
    gateway: Option<GatewayOutcome>,
    snapshot: Option<SnapshotOutcome>,

    /// What each proxy last answered, keyed by proxy and type URL.
    answers: BTreeMap<(String, String), Answers>,

    /// The routes the group last reported on.
    routes: HashSet<ObjectId>,
}

#[derive(Debug, Default)]
struct Answers {
    acked: u64,

    /// Cleared only when the same proxy accepts a newer version of the type.
    nacked: Option<(u64, String)>,
}

/// A route's parent statuses, contributed by each group it attaches to.
#[derive(Debug, Default)]
struct RouteParents {
    generation: Option<i64>,
    by_group: BTreeMap<GroupId, Vec<ParentOutcome>>,
}

// === impl Index ===

impl Index {
    pub fn shared(
        name: impl ToString,
        controller_name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            controller_name: controller_name.to_string(),
            claims,
            updates,
            metrics,
            records: HashMap::new(),
            sent: HashMap::new(),
            groups: HashMap::new(),
            routes: HashMap::new(),
        }))
    }

    /// Applies outcomes and lease changes until the outcome channel closes.
    /// Records are periodically re-queued so that patches dropped on a full
    /// channel, or reported as failed by the controller, are eventually
    /// written.
    pub async fn run(
        index: SharedIndex,
        mut outcomes: mpsc::UnboundedReceiver<Outcome>,
        mut failures: mpsc::UnboundedReceiver<ResourceId>,
        reconciliation_period: Duration,
    ) {
        let mut claims = index.read().claims.clone();
        let mut interval = time::interval(reconciliation_period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = claims.changed() => {
                    if res.is_err() {
                        tracing::debug!("Lease claims closed");
                        return;
                    }
                    index.write().claims_changed();
                }

                _ = interval.tick() => index.write().reconcile(),

                Some(id) = failures.recv() => index.write().patch_failed(&id),

                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => index.write().apply_outcome(outcome),
                    None => return,
                },
            }
        }
    }

    pub fn apply_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Group(outcome) => self.apply_group(*outcome),
            Outcome::GroupRemoved(group) => self.remove_group(&group),
            Outcome::Discovery(outcome) => self.apply_discovery(outcome),
            Outcome::ProxyDisconnected { group, proxy } => self.remove_proxy(&group, &proxy),
        }
    }

    /// Queues every record that differs from what was last sent.
    pub fn reconcile(&mut self) {
        if !self.is_leader() {
            return;
        }
        let ids = self
            .records
            .iter()
            .filter(|(id, record)| self.sent.get(*id) != Some(*record))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in ids {
            self.flush(&id);
        }
    }

    pub(crate) fn claims_changed(&mut self) {
        if self.is_leader() {
            tracing::debug!("Holding the status lease");
            self.reconcile();
        } else {
            // Another replica may write while this one does not hold the
            // lease, so nothing previously sent can be assumed current.
            self.sent.clear();
        }
    }

    /// Forgets that a record was sent, so that the next reconciliation
    /// queues it again.
    pub(crate) fn patch_failed(&mut self, id: &ResourceId) {
        if self.sent.remove(id).is_some() {
            tracing::debug!(%id, "Retrying status patch");
        }
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    fn apply_group(&mut self, outcome: GroupOutcome) {
        let GroupOutcome {
            group,
            gateway,
            routes,
            backends,
            policies,
            snapshot,
        } = outcome;

        let state = self.groups.entry(group.clone()).or_default();
        if is_stale(
            state.gateway.as_ref().and_then(|gw| gw.generation),
            gateway.generation,
        ) {
            tracing::debug!(%group, generation = ?gateway.generation, "Ignoring stale outcome");
            self.metrics.stale_outcomes.inc();
            return;
        }
        state.gateway = Some(gateway);
        state.snapshot = Some(snapshot);
        let reported = routes.iter().map(|r| r.id.clone()).collect::<HashSet<_>>();
        let detached = state
            .routes
            .difference(&reported)
            .cloned()
            .collect::<Vec<_>>();
        state.routes = reported;

        self.update_gateway(&group);
        for route in routes {
            self.update_route(&group, route);
        }
        for id in detached {
            self.detach_route(&group, &id);
        }

        for backend in backends {
            let programmed = if backend.healthy {
                Condition::new(ConditionType::Programmed, true, Reason::Programmed)
            } else {
                Condition::new(ConditionType::Programmed, false, Reason::NoHealthyEndpoints)
                    .with_message("backend has no healthy endpoints")
            };
            self.set(
                ResourceId::namespaced(StatusKind::Backend, &backend.id),
                Record {
                    generation: backend.generation,
                    status: Status::Conditions(vec![Condition::accepted(), programmed]),
                },
            );
        }

        for policy in policies {
            self.set(
                ResourceId::namespaced(StatusKind::TrafficPolicy, &policy.id),
                Record {
                    generation: policy.generation,
                    status: Status::Conditions(vec![policy.accepted]),
                },
            );
        }
    }

    fn remove_group(&mut self, group: &GroupId) {
        let Some(state) = self.groups.remove(group) else {
            return;
        };
        tracing::debug!(%group, "Forgetting group");
        let id = ResourceId::namespaced(StatusKind::Gateway, group);
        self.records.remove(&id);
        self.sent.remove(&id);
        for route in state.routes {
            self.detach_route(group, &route);
        }
    }

    fn apply_discovery(&mut self, outcome: DiscoveryOutcome) {
        let DiscoveryOutcome {
            group,
            proxy,
            type_url,
            version,
            result,
        } = outcome;
        let Some(state) = self.groups.get_mut(&group) else {
            tracing::debug!(%group, %proxy, "Discovery outcome for an unknown group");
            return;
        };
        if let Err(message) = &result {
            tracing::info!(%group, %proxy, %type_url, version, %message, "Proxy rejected configuration");
        }
        let answers = state.answers.entry((proxy, type_url)).or_default();
        match result {
            Ok(()) => {
                answers.acked = answers.acked.max(version);
                if matches!(&answers.nacked, Some((nacked, _)) if *nacked < version) {
                    answers.nacked = None;
                }
            }
            Err(message) => {
                if answers.nacked.as_ref().map_or(true, |(v, _)| *v <= version) {
                    answers.nacked = Some((version, message));
                }
            }
        }
        self.update_gateway(&group);
    }

    fn remove_proxy(&mut self, group: &GroupId, proxy: &str) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        let before = state.answers.len();
        state.answers.retain(|(p, _), _| p != proxy);
        if state.answers.len() != before {
            tracing::debug!(%group, %proxy, "Forgetting proxy answers");
            self.update_gateway(group);
        }
    }

    fn update_gateway(&mut self, group: &GroupId) {
        let Some(state) = self.groups.get(group) else {
            return;
        };
        let Some(gateway) = state.gateway.as_ref() else {
            return;
        };
        let record = Record {
            generation: gateway.generation,
            status: Status::Gateway {
                conditions: vec![gateway.accepted.clone(), state.programmed()],
                listeners: gateway.listeners.clone(),
            },
        };
        self.set(ResourceId::namespaced(StatusKind::Gateway, group), record);
    }

    fn update_route(&mut self, group: &GroupId, route: RouteOutcome) {
        let RouteOutcome {
            id,
            generation,
            parents,
        } = route;
        let entry = self.routes.entry(id.clone()).or_default();
        if is_stale(entry.generation, generation) {
            tracing::debug!(route = %id, ?generation, "Ignoring stale route outcome");
            self.metrics.stale_outcomes.inc();
            return;
        }
        if generation.is_some() {
            entry.generation = generation;
        }
        entry.by_group.insert(group.clone(), parents);
        self.refresh_route(&id);
    }

    fn detach_route(&mut self, group: &GroupId, id: &ObjectId) {
        if let Some(entry) = self.routes.get_mut(id) {
            entry.by_group.remove(group);
        }
        self.refresh_route(id);
    }

    fn refresh_route(&mut self, id: &ObjectId) {
        let rid = ResourceId::namespaced(StatusKind::HttpRoute, id);
        let Some(entry) = self.routes.get(id) else {
            return;
        };
        if entry.by_group.is_empty() {
            // The route no longer names any group; there is nothing to write.
            self.routes.remove(id);
            self.records.remove(&rid);
            self.sent.remove(&rid);
            return;
        }
        let mut parents = entry
            .by_group
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        parents.sort_by(|a, b| a.parent.cmp(&b.parent));
        let record = Record {
            generation: entry.generation,
            status: Status::Route(parents),
        };
        self.set(rid, record);
    }

    fn set(&mut self, id: ResourceId, record: Record) {
        if let Some(prior) = self.records.get(&id) {
            if is_stale(prior.generation, record.generation) {
                tracing::debug!(%id, generation = ?record.generation, "Ignoring stale status");
                self.metrics.stale_outcomes.inc();
                return;
            }
            if *prior == record {
                return;
            }
        }
        self.records.insert(id.clone(), record);
        self.flush(&id);
    }

    fn forget(&mut self, id: &ResourceId) {
        self.records.remove(id);
        self.sent.remove(id);
    }

    /// Queues a patch for the record if this replica holds the lease and the
    /// record was not already sent.
    fn flush(&mut self, id: &ResourceId) {
        if !self.is_leader() {
            return;
        }
        let Some(record) = self.records.get(id) else {
            return;
        };
        if self.sent.get(id) == Some(record) {
            return;
        }
        let update = Update {
            id: id.clone(),
            patch: self.make_patch(id, record),
        };
        match self.updates.try_send(update) {
            Ok(()) => {
                self.metrics.patches_enqueued.inc();
                self.sent.insert(id.clone(), record.clone());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%id, "Status patch queue is full");
                self.metrics.patch_channel_full.inc();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(%id, "Status controller is not running");
            }
        }
    }

    fn make_patch(&self, id: &ResourceId, record: &Record) -> k8s::Patch<serde_json::Value> {
        #[cfg(not(test))]
        let timestamp = Utc::now();
        #[cfg(test)]
        let timestamp = DateTime::<Utc>::MIN_UTC;

        let conditions = |conditions: &[Condition]| {
            conditions
                .iter()
                .map(|c| to_k8s_condition(c, record.generation, timestamp))
                .collect::<Vec<_>>()
        };

        let status = match &record.status {
            Status::Conditions(cs) => serde_json::json!({ "conditions": conditions(cs) }),
            Status::Gateway {
                conditions: cs,
                listeners,
            } => {
                let status = gateway::GatewayStatus {
                    conditions: conditions(cs),
                    listeners: listeners
                        .iter()
                        .map(|l| gateway::ListenerStatus {
                            name: l.name.clone(),
                            supported_kinds: vec![gateway::RouteGroupKind {
                                group: Some(gateway::GROUP.to_string()),
                                kind: "HTTPRoute".to_string(),
                            }],
                            attached_routes: i32::try_from(l.attached_routes)
                                .unwrap_or(i32::MAX),
                            conditions: conditions(&l.conditions),
                        })
                        .collect(),
                };
                serde_json::json!(status)
            }
            Status::Route(parents) => {
                let status = gateway::RouteStatus {
                    parents: parents
                        .iter()
                        .map(|p| gateway::RouteParentStatus {
                            parent_ref: k8s::ParentReference {
                                group: Some(gateway::GROUP.to_string()),
                                kind: Some("Gateway".to_string()),
                                namespace: Some(p.parent.namespace.clone()),
                                name: p.parent.name.clone(),
                                section_name: p.parent.section_name.clone(),
                                port: p.parent.port,
                            },
                            controller_name: self.controller_name.clone(),
                            conditions: conditions(&p.conditions),
                        })
                        .collect(),
                };
                serde_json::json!(status)
            }
        };

        k8s::Patch::Merge(serde_json::json!({
            "apiVersion": api_version(id.kind),
            "kind": id.kind.as_str(),
            "name": id.name,
            "status": status,
        }))
    }
}

impl kubert::index::IndexClusterResource<k8s::GatewayClass> for Index {
    fn apply(&mut self, class: k8s::GatewayClass) {
        let id = ResourceId::cluster(StatusKind::GatewayClass, class.name_unchecked());
        if class.spec.controller_name != self.controller_name {
            self.forget(&id);
            return;
        }
        let record = Record {
            generation: class.metadata.generation,
            status: Status::Conditions(vec![Condition::accepted()]),
        };
        self.set(id, record);
    }

    fn delete(&mut self, name: String) {
        self.forget(&ResourceId::cluster(StatusKind::GatewayClass, name));
    }
}

// === impl GroupState ===

impl GroupState {
    fn programmed(&self) -> Condition {
        match &self.snapshot {
            Some(SnapshotOutcome::Invalid { message } | SnapshotOutcome::Frozen { message }) => {
                Condition::new(ConditionType::Programmed, false, Reason::Invalid)
                    .with_message(message.clone())
            }
            Some(SnapshotOutcome::Published { version }) => {
                let rejected = self
                    .answers
                    .values()
                    .filter_map(|a| a.nacked.as_ref())
                    .max_by_key(|(v, _)| *v);
                if let Some((_, message)) = rejected {
                    Condition::new(ConditionType::Programmed, false, Reason::Invalid)
                        .with_message(message.clone())
                } else if self.answers.values().any(|a| a.acked >= *version) {
                    Condition::new(ConditionType::Programmed, true, Reason::Programmed)
                } else {
                    Condition::new(ConditionType::Programmed, false, Reason::Pending)
                        .with_message("waiting for a proxy to accept the configuration")
                }
            }
            None => Condition::new(ConditionType::Programmed, false, Reason::Pending),
        }
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        updates: mpsc::Receiver<Update>,
        failures: mpsc::UnboundedSender<ResourceId>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            name: name.to_string(),
            claims,
            client,
            updates,
            failures,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(self) {
        let Self {
            name,
            claims,
            client,
            mut updates,
            failures,
            patch_timeout,
            metrics,
        } = self;
        let patch = Patcher {
            params: k8s::PatchParams::default(),
            timeout: patch_timeout,
            metrics,
        };

        while let Some(Update { id, patch: body }) = updates.recv().await {
            // The lease may have been lost after the update was queued.
            if !claims.borrow().is_current_for(&name) {
                tracing::debug!(%id, "Not the lease holder; dropping status patch");
                patch.metrics.patch_dropped.inc();
                continue;
            }

            let client = client.clone();
            let ns = id.namespace.as_deref().unwrap_or_default();
            let patched = match id.kind {
                StatusKind::GatewayClass => {
                    patch
                        .apply(k8s::Api::<k8s::GatewayClass>::all(client), &id, &body)
                        .await
                }
                StatusKind::Gateway => {
                    patch
                        .apply(k8s::Api::<k8s::Gateway>::namespaced(client, ns), &id, &body)
                        .await
                }
                StatusKind::HttpRoute => {
                    patch
                        .apply(k8s::Api::<k8s::HttpRoute>::namespaced(client, ns), &id, &body)
                        .await
                }
                StatusKind::Backend => {
                    patch
                        .apply(k8s::Api::<k8s::Backend>::namespaced(client, ns), &id, &body)
                        .await
                }
                StatusKind::TrafficPolicy => {
                    patch
                        .apply(
                            k8s::Api::<k8s::TrafficPolicy>::namespaced(client, ns),
                            &id,
                            &body,
                        )
                        .await
                }
            };
            if !patched {
                // The index queues the record again at its next reconciliation.
                let _ = failures.send(id);
            }
        }
    }
}

/// Applies status patches with a timeout.
struct Patcher {
    params: k8s::PatchParams,
    timeout: Duration,
    metrics: ControllerMetrics,
}

// === impl Patcher ===

impl Patcher {
    /// Returns true if the patch was written.
    async fn apply<K>(
        &self,
        api: k8s::Api<K>,
        id: &ResourceId,
        patch: &k8s::Patch<serde_json::Value>,
    ) -> bool
    where
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let start = time::Instant::now();
        let res = time::timeout(self.timeout, api.patch_status(&id.name, &self.params, patch)).await;
        let patched = match res {
            Ok(Ok(_)) => {
                tracing::debug!(%id, "Patched status");
                self.metrics.patch_succeeded.inc();
                true
            }
            Ok(Err(error)) => {
                tracing::error!(%id, %error, "Failed to patch status");
                self.metrics.patch_failed.inc();
                false
            }
            Err(_) => {
                tracing::error!(%id, timeout = ?self.timeout, "Patching status timed out");
                self.metrics.patch_timeout.inc();
                false
            }
        };
        self.metrics
            .patch_duration
            .observe(start.elapsed().as_secs_f64());
        patched
    }
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patches_enqueued = Counter::default();
        prom.register(
            "patches_enqueued",
            "Number of status patches queued for the controller",
            patches_enqueued.clone(),
        );

        let patch_channel_full = Counter::default();
        prom.register(
            "patch_channel_full",
            "Number of status patches that could not be queued because the channel was full",
            patch_channel_full.clone(),
        );

        let stale_outcomes = Counter::default();
        prom.register(
            "stale_outcomes",
            "Number of outcomes ignored because they described an older generation",
            stale_outcomes.clone(),
        );

        Self {
            patches_enqueued,
            patch_channel_full,
            stale_outcomes,
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Number of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Number of failed status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Number of status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_dropped = Counter::default();
        prom.register(
            "patch_dropped",
            "Number of status patches dropped because the lease was not held",
            patch_dropped.clone(),
        );

        let patch_duration = Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter());
        prom.register_with_unit(
            "patch_duration",
            "Histogram of status patch latencies",
            Unit::Seconds,
            patch_duration.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_dropped,
            patch_duration,
        }
    }
}

/// Returns true if `next` describes an older generation than `prior`.
fn is_stale(prior: Option<i64>, next: Option<i64>) -> bool {
    matches!((prior, next), (Some(prior), Some(next)) if next < prior)
}

fn api_version(kind: StatusKind) -> &'static str {
    match kind {
        StatusKind::GatewayClass | StatusKind::Gateway | StatusKind::HttpRoute => {
            "gateway.networking.k8s.io/v1"
        }
        StatusKind::Backend | StatusKind::TrafficPolicy => "gantry.io/v1alpha1",
    }
}

fn to_k8s_condition(
    condition: &Condition,
    observed_generation: Option<i64>,
    timestamp: DateTime<Utc>,
) -> k8s::Condition {
    k8s::Condition {
        type_: condition.type_.as_str().to_string(),
        status: condition.status.as_str().to_string(),
        reason: condition.reason.as_str().to_string(),
        message: condition.message.clone(),
        observed_generation,
        last_transition_time: k8s::Time(timestamp),
    }
}
