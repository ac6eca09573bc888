//! # Stevedore
//!
//! A container-orchestration controller for a single host: declarative
//! multi-service deployment templates in, running containers out.
//!
//! This crate is the facade over the layered workspace:
//!
//! - [`core`](stevedore_core): data model, canonicalizer, store, progress
//!   context, backend and discovery seams
//! - [`engine`](stevedore_engine): the controller interface, runcfg
//!   synthesis and the plugin pipeline
//! - [`runtime`](stevedore_runtime): process-wide wiring (configuration,
//!   logging, the controller root)
//! - [`api`](stevedore_api): the streaming HTTP edge
//!
//! ## Quick tour
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore::{Config, Controller, default_plugins};
//!
//! let config = Config::load(None)?;
//! let host_ip = stevedore::resolve_host_ip(&config)?;
//! let controller = Arc::new(Controller::new(
//!     config, host_ip, backend, discovery, default_plugins(),
//! )?);
//! stevedore::serve(controller).await?;
//! ```

pub use stevedore_api as api;
pub use stevedore_core as core;
pub use stevedore_engine as engine;
pub use stevedore_runtime as runtime;

pub use stevedore_api::{ServiceFile, serve};
pub use stevedore_core::{
    Backend, Context, Definition, Deployment, Discovery, Error, Event, InstanceHandle, Result,
    RunConfig, Service, ServiceState, ServiceVersion, Store, canonicalize,
};
pub use stevedore_engine::{
    ControllerInterface, EngineSettings, Outcome, Plugin, PluginList, default_plugins,
};
pub use stevedore_runtime::{Config, Controller, SdutilDiscovery, resolve_host_ip};
