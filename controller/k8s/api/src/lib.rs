#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod duration;
pub mod gateway;
pub mod policy;

pub use self::{
    backend::{Backend, BackendEndpoint, BackendSpec},
    duration::{Duration, ParseDurationError},
    gateway::{
        Gateway, GatewayClass, GatewayClassSpec, GatewaySpec, HttpRoute, HttpRouteSpec,
        ParentReference, ReferenceGrant, ReferenceGrantSpec,
    },
    policy::{LocalTargetRef, RetrySpec, TrafficPolicy, TrafficPolicySpec},
};
pub use k8s_openapi::{
    api::{
        core::v1::{Secret, Service, ServicePort, ServiceSpec},
        discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    chrono::{self, DateTime, Utc},
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    runtime::watcher,
    Client, Error,
};

/// The label EndpointSlices use to name the Service they belong to.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// The Secret type that carries listener certificates.
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Returns the creation timestamp of an object, if it has one.
pub fn creation_timestamp<T: Resource>(obj: &T) -> Option<DateTime<Utc>> {
    obj.meta().creation_timestamp.as_ref().map(|Time(t)| *t)
}
