#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Dynamic name binding and service factory caching for RPC clients.
//!
//! Clients address a logical [`Path`](wily_core::Path) rather than a fixed
//! endpoint. The path is resolved through the ambient delegation tables
//! into a bound name, the bound name into an endpoint factory, and both
//! steps are cached reactively: bindings update as resolvers push new
//! states, requests queue while a binding is still pending, and every
//! table pair that resolves to the same name shares one downstream
//! factory.

pub mod bind;
pub mod cache;
pub mod dyn_name;
pub mod metrics;
pub mod trace;

pub use wily_core as core;

pub use self::bind::{BindingFactory, NewEndpointFactory};
pub use self::cache::ServiceFactoryCache;
pub use self::dyn_name::{DynNameFactory, NewBoundService};
pub use self::metrics::CacheMetrics;
pub use self::trace::{NameTracer, TraceSink};
