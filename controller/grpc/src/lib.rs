#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ads;
pub mod metrics;
mod server;

pub use self::server::{AdsConfig, AdsServer};
