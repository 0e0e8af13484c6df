use gantry_controller_core::ObjectId;
use std::fmt;

/// The kinds whose status this controller writes.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum StatusKind {
    GatewayClass,
    Gateway,
    HttpRoute,
    Backend,
    TrafficPolicy,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: StatusKind,

    /// Unset for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn cluster(kind: StatusKind, name: impl ToString) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn namespaced(kind: StatusKind, id: &ObjectId) -> Self {
        Self {
            kind,
            namespace: Some(id.namespace.clone()),
            name: id.name.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayClass => "GatewayClass",
            Self::Gateway => "Gateway",
            Self::HttpRoute => "HTTPRoute",
            Self::Backend => "Backend",
            Self::TrafficPolicy => "TrafficPolicy",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
