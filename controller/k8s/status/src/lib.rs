#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Writes the acceptance status of gateway objects back to the cluster.

mod index;
mod resource_id;


pub use self::{
    index::{Controller, ControllerMetrics, Index, IndexMetrics, SharedIndex, Update},
    resource_id::{ResourceId, StatusKind},
};
