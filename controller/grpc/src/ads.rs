//! The per-connection state of an aggregated discovery stream.
//!
//! A [`Connection`] starts unbound. The first request names the group, via
//! its node's cluster, and each requested type then cycles between
//! subscribed and awaiting an ack. The connection performs no I/O: each event
//! yields the responses to send and the outcomes to report.

use envoy_types::pb::envoy::{
    config::core::v3::Node,
    service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
};
use gantry_controller_core::{status::DiscoveryOutcome, GroupId};
use gantry_controller_xds::{ResourceType, Snapshot};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct Connection {
    node: Option<BoundNode>,
    last_nonce: u64,
    subscriptions: BTreeMap<ResourceType, Subscription>,
}

/// What the driver must do after an event.
#[derive(Debug, Default)]
pub struct Events {
    /// In push order.
    pub responses: Vec<DiscoveryResponse>,
    pub outcomes: Vec<DiscoveryOutcome>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("the first request must identify its node")]
    MissingNode,

    #[error("node cluster must be <namespace>/<gateway>: {0:?}")]
    InvalidCluster(String),

    #[error("node changed from {bound} to {requested}")]
    NodeChanged { bound: String, requested: String },

    #[error("unsupported resource type {0:?}")]
    UnsupportedType(String),

    #[error("nonce {0:?} was never issued")]
    UnknownNonce(String),
}

#[derive(Debug)]
struct BoundNode {
    id: String,
    cluster: String,
    group: GroupId,
}

#[derive(Debug, Default)]
struct Subscription {
    /// Empty for wildcard subscriptions.
    names: BTreeSet<String>,
    pending: Option<Sent>,
    acked: Option<Sent>,
    nacked: Option<u64>,
}

#[derive(Debug)]
struct Sent {
    nonce: u64,
    version: u64,
    hash: String,
}

// === impl Connection ===

impl Connection {
    /// Returns the group a stream's first request asks for.
    pub fn requested_group(req: &DiscoveryRequest) -> Result<GroupId, ProtocolError> {
        let node = req.node.as_ref().ok_or(ProtocolError::MissingNode)?;
        node.cluster
            .parse()
            .map_err(|_| ProtocolError::InvalidCluster(node.cluster.clone()))
    }

    pub fn group(&self) -> Option<&GroupId> {
        self.node.as_ref().map(|n| &n.group)
    }

    pub fn proxy(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.id.as_str())
    }

    /// Handles a request from the proxy, given the group's current snapshot.
    pub fn on_request(
        &mut self,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Result<Events, ProtocolError> {
        self.bind(&req)?;
        let ty = ResourceType::from_type_url(&req.type_url)
            .ok_or_else(|| ProtocolError::UnsupportedType(req.type_url.clone()))?;
        let names = req
            .resource_names
            .into_iter()
            .filter(|n| n != "*")
            .collect::<BTreeSet<_>>();
        let mut events = Events::default();

        if req.response_nonce.is_empty() {
            tracing::debug!(r#type = %ty, names = names.len(), "Subscribed");
            self.subscriptions.insert(
                ty,
                Subscription {
                    names,
                    ..Default::default()
                },
            );
            if let Some(snapshot) = snapshot {
                self.push_ready(snapshot, None, &mut events);
            }
            return Ok(events);
        }

        let nonce = req
            .response_nonce
            .parse::<u64>()
            .ok()
            .filter(|n| (1..=self.last_nonce).contains(n))
            .ok_or_else(|| ProtocolError::UnknownNonce(req.response_nonce.clone()))?;

        let Some(sub) = self.subscriptions.get_mut(&ty) else {
            tracing::debug!(r#type = %ty, nonce, "Ignoring nonce for an unsubscribed type");
            return Ok(events);
        };
        let names_changed = sub.names != names;
        sub.names = names;

        let answered = match sub.pending.take() {
            Some(sent) if sent.nonce == nonce => sent,
            pending => {
                // Superseded, or already answered. A proxy changes its
                // subscription by re-sending its last nonce with new names.
                let idle = pending.is_none();
                sub.pending = pending;
                if idle && names_changed {
                    if let Some(snapshot) = snapshot {
                        self.push_ready(snapshot, Some(ty), &mut events);
                    }
                } else {
                    tracing::trace!(r#type = %ty, nonce, "Ignoring stale nonce");
                }
                return Ok(events);
            }
        };

        let result = match req.error_detail {
            Some(status) => {
                tracing::warn!(
                    r#type = %ty,
                    version = answered.version,
                    error = %status.message,
                    "Proxy rejected configuration"
                );
                sub.nacked = Some(answered.version);
                Err(status.message)
            }
            None => {
                tracing::debug!(r#type = %ty, version = answered.version, "Acked");
                sub.nacked = None;
                Ok(())
            }
        };
        let version = answered.version;
        if result.is_ok() {
            sub.acked = Some(answered);
        }

        if let Some(outcome) = self.outcome(ty, version, result) {
            events.outcomes.push(outcome);
        }
        if let Some(snapshot) = snapshot {
            self.push_ready(snapshot, names_changed.then_some(ty), &mut events);
        }
        Ok(events)
    }

    /// Handles a new snapshot for the bound group, pushing every type whose
    /// content the proxy has not yet seen.
    pub fn on_snapshot(&mut self, snapshot: &Snapshot) -> Events {
        let mut events = Events::default();
        if self.group() != Some(snapshot.group()) {
            return events;
        }
        self.push_ready(snapshot, None, &mut events);
        events
    }

    /// Pushes subscribed types in dependency order. A type whose current
    /// content has not yet been sent holds back every type after it, so that
    /// routes never reach the proxy before the clusters they name.
    fn push_ready(
        &mut self,
        snapshot: &Snapshot,
        forced: Option<ResourceType>,
        events: &mut Events,
    ) {
        for ty in ResourceType::ALL {
            let (wants, current) = match self.subscriptions.get(&ty) {
                Some(sub) => (
                    sub.wants(ty, snapshot, forced == Some(ty)),
                    sub.is_current(ty, snapshot),
                ),
                None => continue,
            };
            if wants {
                self.push(ty, snapshot, events);
            } else if !current {
                tracing::trace!(
                    r#type = %ty,
                    version = snapshot.version(),
                    "Holding later types"
                );
                return;
            }
        }
    }

    fn bind(&mut self, req: &DiscoveryRequest) -> Result<(), ProtocolError> {
        match (&self.node, &req.node) {
            (None, _) => {
                let group = Self::requested_group(req)?;
                let node = req.node.as_ref().ok_or(ProtocolError::MissingNode)?;
                tracing::debug!(proxy = %node.id, %group, "Bound");
                self.node = Some(BoundNode {
                    id: node.id.clone(),
                    cluster: node.cluster.clone(),
                    group,
                });
                Ok(())
            }
            (Some(bound), Some(node)) if bound.id != node.id || bound.cluster != node.cluster => {
                Err(ProtocolError::NodeChanged {
                    bound: bound.describe(),
                    requested: describe(node),
                })
            }
            (Some(_), _) => Ok(()),
        }
    }

    fn push(&mut self, ty: ResourceType, snapshot: &Snapshot, events: &mut Events) {
        let Some(sub) = self.subscriptions.get_mut(&ty) else {
            return;
        };
        let slice = snapshot.get(ty);
        self.last_nonce += 1;
        let resources = slice
            .set
            .resources
            .iter()
            .filter(|r| sub.names.is_empty() || sub.names.contains(&r.name))
            .map(|r| r.any.clone())
            .collect::<Vec<_>>();
        tracing::debug!(
            r#type = %ty,
            version = snapshot.version(),
            nonce = self.last_nonce,
            resources = resources.len(),
            "Pushing"
        );
        events.responses.push(DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources,
            type_url: ty.type_url().to_string(),
            nonce: self.last_nonce.to_string(),
            ..Default::default()
        });
        sub.pending = Some(Sent {
            nonce: self.last_nonce,
            version: snapshot.version(),
            hash: slice.set.hash.clone(),
        });
    }

    fn outcome(
        &self,
        ty: ResourceType,
        version: u64,
        result: Result<(), String>,
    ) -> Option<DiscoveryOutcome> {
        let node = self.node.as_ref()?;
        Some(DiscoveryOutcome {
            group: node.group.clone(),
            proxy: node.id.clone(),
            type_url: ty.type_url().to_string(),
            version,
            result,
        })
    }
}

// === impl Subscription ===

impl Subscription {
    /// Decides whether the snapshot should be sent. A rejected version is
    /// never sent again; only a newer snapshot clears the way.
    fn wants(&self, ty: ResourceType, snapshot: &Snapshot, force: bool) -> bool {
        if self.pending.is_some() {
            return false;
        }
        if let Some(nacked) = self.nacked {
            return snapshot.version() > nacked;
        }
        force
            || match &self.acked {
                Some(acked) => acked.hash != snapshot.get(ty).set.hash,
                None => true,
            }
    }

    /// Returns true once the snapshot's content for this type has been sent,
    /// whether or not the proxy has answered.
    fn is_current(&self, ty: ResourceType, snapshot: &Snapshot) -> bool {
        let hash = &snapshot.get(ty).set.hash;
        match (&self.pending, &self.acked) {
            (Some(sent), _) | (None, Some(sent)) => sent.hash == *hash,
            (None, None) => false,
        }
    }
}

// === impl BoundNode ===

impl BoundNode {
    fn describe(&self) -> String {
        format!("{} in {}", self.id, self.cluster)
    }
}

fn describe(node: &Node) -> String {
    format!("{} in {}", node.id, node.cluster)
}

#[cfg(test)]
mod tests;
