#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Wires the gantry controller together: resource watches feed the store,
//! the scheduler reconciles changed groups into the snapshot cache, the
//! discovery server serves the cache, and the status index writes outcomes
//! back to the cluster.

pub use gantry_controller_core as core;
pub use gantry_controller_grpc as grpc;
pub use gantry_controller_k8s_api as k8s;
pub use gantry_controller_k8s_index as index;
pub use gantry_controller_k8s_status as status;
pub use gantry_controller_xds as xds;

mod args;
mod lease;
pub mod reconcile;


pub use self::{
    args::Args,
    reconcile::{Pipeline, Reconcile, Scheduler},
};
