#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Envoy configuration for gateway groups.
//!
//! [`translate`] turns a [`GatewayIr`](gantry_controller_core::ir::GatewayIr)
//! into typed xDS resources. The [`SnapshotCache`] holds the latest
//! [`Snapshot`] of each group for the discovery server.

mod cache;
mod translate;

pub use self::{
    cache::{Publish, Snapshot, SnapshotCache, SnapshotRx, TypeSnapshot},
    translate::{translate, Resource, ResourceSet, ResourceType, Resources, TranslationError},
};
