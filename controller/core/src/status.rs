//! Outcomes reported by the reconciliation pipeline and the discovery server.
//!
//! These are plain values; the status reporter turns them into Kubernetes
//! status patches.

use crate::{GroupId, ObjectId};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Group(Box<GroupOutcome>),
    GroupRemoved(GroupId),
    Discovery(DiscoveryOutcome),

    /// A proxy's discovery stream closed; what it answered no longer holds.
    ProxyDisconnected { group: GroupId, proxy: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupOutcome {
    pub group: GroupId,
    pub gateway: GatewayOutcome,
    pub routes: Vec<RouteOutcome>,
    pub backends: Vec<BackendOutcome>,
    pub policies: Vec<PolicyOutcome>,
    pub snapshot: SnapshotOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayOutcome {
    pub generation: Option<i64>,
    pub accepted: Condition,
    pub listeners: Vec<ListenerOutcome>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerOutcome {
    pub name: String,
    pub attached_routes: u32,
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteOutcome {
    pub id: ObjectId,
    pub generation: Option<i64>,
    pub parents: Vec<ParentOutcome>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentOutcome {
    pub parent: ParentRef,
    pub conditions: Vec<Condition>,
}

/// A route's reference to a gateway, as written on the route.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentRef {
    pub namespace: String,
    pub name: String,
    pub section_name: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendOutcome {
    pub id: ObjectId,
    pub generation: Option<i64>,
    pub healthy: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub id: ObjectId,
    pub generation: Option<i64>,
    pub accepted: Condition,
}

/// What happened to the group's snapshot during a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Published { version: u64 },
    /// The group has no usable listeners; the last good snapshot is kept.
    Invalid { message: String },
    /// Translation failed an internal consistency check; the last good
    /// snapshot is kept.
    Frozen { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub group: GroupId,
    pub proxy: String,
    pub type_url: String,
    pub version: u64,
    pub result: Result<(), String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: Reason,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionType {
    Accepted,
    Conflicted,
    Programmed,
    ResolvedRefs,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    Accepted,
    Programmed,
    Pending,
    Invalid,
    ListenersNotValid,
    ResolvedRefs,
    NoConflicts,
    HostnameConflict,
    ProtocolConflict,
    PortUnavailable,
    UnsupportedProtocol,
    UnsupportedAddress,
    InvalidCertificateRef,
    RefNotPermitted,
    InvalidRouteKinds,
    NotAllowedByListeners,
    NoMatchingParent,
    NoMatchingListenerHostname,
    Conflicted,
    UnsupportedValue,
    BackendNotFound,
    InvalidKind,
    BackendUnhealthy,
    NoHealthyEndpoints,
}

// === impl Condition ===

impl Condition {
    pub fn new(type_: ConditionType, status: bool, reason: Reason) -> Self {
        Self {
            type_,
            status: if status {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            reason,
            message: String::new(),
        }
    }

    pub fn accepted() -> Self {
        Self::new(ConditionType::Accepted, true, Reason::Accepted)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

// === impl ConditionType ===

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Conflicted => "Conflicted",
            Self::Programmed => "Programmed",
            Self::ResolvedRefs => "ResolvedRefs",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ConditionStatus ===

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

// === impl Reason ===

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Programmed => "Programmed",
            Self::Pending => "Pending",
            Self::Invalid => "Invalid",
            Self::ListenersNotValid => "ListenersNotValid",
            Self::ResolvedRefs => "ResolvedRefs",
            Self::NoConflicts => "NoConflicts",
            Self::HostnameConflict => "HostnameConflict",
            Self::ProtocolConflict => "ProtocolConflict",
            Self::PortUnavailable => "PortUnavailable",
            Self::UnsupportedProtocol => "UnsupportedProtocol",
            Self::UnsupportedAddress => "UnsupportedAddress",
            Self::InvalidCertificateRef => "InvalidCertificateRef",
            Self::RefNotPermitted => "RefNotPermitted",
            Self::InvalidRouteKinds => "InvalidRouteKinds",
            Self::NotAllowedByListeners => "NotAllowedByListeners",
            Self::NoMatchingParent => "NoMatchingParent",
            Self::NoMatchingListenerHostname => "NoMatchingListenerHostname",
            Self::Conflicted => "Conflicted",
            Self::UnsupportedValue => "UnsupportedValue",
            Self::BackendNotFound => "BackendNotFound",
            Self::InvalidKind => "InvalidKind",
            Self::BackendUnhealthy => "BackendUnhealthy",
            Self::NoHealthyEndpoints => "NoHealthyEndpoints",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
