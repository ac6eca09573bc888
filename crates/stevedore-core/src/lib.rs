//! # Stevedore Core
//!
//! The core engine of the stevedore deployment controller.
//!
//! This crate provides the fundamental building blocks shared by the
//! controller engine, the HTTP edge and the container backends:
//!
//! - **Data model**: deployments, services, versions and instances, with the
//!   hold/resume state machine ([`Deployment`], [`Service`], [`ServiceState`])
//! - **Canonicalizer**: normalization of user service definitions into a
//!   comparable canonical form ([`Definition`], [`canonicalize`])
//! - **Persistence**: an embedded transactional snapshot store with
//!   compare-and-swap commits and forward-only schema migration ([`Store`])
//! - **Progress context**: the per-operation streaming event channel
//!   ([`Context`], [`Event`])
//! - **Backend interface**: the abstraction over container runtimes
//!   ([`Backend`], [`RunConfig`])
//! - **Service discovery**: the lookup/registration seam ([`Discovery`])
//!
//! Higher layers live in `stevedore-engine` (controller interface, plugin
//! pipeline) and `stevedore-runtime` (process-wide root, configuration).

pub mod backend;
pub mod canonical;
pub mod discovery;
pub mod error;
pub mod event;
pub mod model;
pub mod store;
pub mod token;

pub use backend::{Backend, InstanceHandle, InstanceStatus, RunConfig};
pub use canonical::{Definition, HostBinding, PortSpec, canonicalize};
pub use discovery::{Discovery, StaticDiscovery};
pub use error::{Error, Result};
pub use event::{Context, Event};
pub use model::{
    DeployState, Deployment, Service, ServiceInstance, ServiceState, ServiceVersion,
};
pub use store::{SCHEMA_VERSION, Store, StoreConn};
