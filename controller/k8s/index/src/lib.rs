//! Gantry gateway index
//!
//! Holds every Kubernetes resource that configures a gateway and answers
//! two questions for the reconciler:
//!
//! - Which snapshot groups does a change affect? Each group is rooted at a
//!   `Gateway` whose `GatewayClass` names this controller. The store records
//!   every object an aggregation looks up, so a change to any of them (or the
//!   appearance of a missing one) is published as a [`GroupEvent`].
//! - What should a group look like? [`Store::aggregate`] collects a gateway
//!   with everything it references and [`build()`] validates that collection
//!   and compiles it into the IR, producing a status outcome for each object.
//!
//! Nothing is published until every watched kind has completed its initial
//! listing, so groups are never built from a partial view of the cluster.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregate;
mod build;
mod hostname;
pub mod metrics;
mod store;


pub use self::{
    aggregate::{AggregatedGroup, AggregatedRoute, BackendTarget, Ref},
    build::{
        backend_cluster_name, build, secret_name, service_cluster_name, Built, ValidationError,
    },
    store::{GroupEvent, Key, Kind, NotReady, PolicyTarget, SharedStore, Store},
};
