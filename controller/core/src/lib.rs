#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod http_route;
pub mod ir;
mod precedence;
pub mod status;

pub use self::precedence::{ParsePrecedenceError, PrecedenceKey, RoutePrecedence};
use std::{fmt, str::FromStr};

pub const GATEWAY_CONTROLLER_NAME: &str = "gantry.io/gateway-controller";

/// Identifies a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

/// Snapshot groups are named by the Gateway at their root.
pub type GroupId = ObjectId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("expected <namespace>/<name>: {0:?}")]
pub struct InvalidObjectId(String);

// === impl ObjectId ===

impl ObjectId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectId {
    type Err = InvalidObjectId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name))
                if !ns.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidObjectId(s.to_string())),
        }
    }
}
