//! The container backend abstraction.
//!
//! The backend is the lowest-level seam: the controller resolves a service
//! version into a flat [`RunConfig`] and the backend turns that into an
//! actual container. The backend owns the choice of how "stay running"
//! semantics are persisted (restart policies, init-system units); the
//! core's only contract is that [`Backend::start`] leaves an instance
//! running until [`Backend::terminate`] is called.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::canonical::HostBinding;
use crate::error::Result;

/// The opaque token a backend hands out for a created instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Backend-assigned id (e.g. the container id).
    pub id: String,
    /// The container name, usable for teardown when the id went stale.
    pub name: String,
}

/// Whether an instance is up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
}

/// The fully resolved container configuration delivered to the backend.
///
/// Every templated variable has been substituted and every port decision
/// made by the time a `RunConfig` exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub image: String,
    /// Container name; empty for unnamed one-shot jobs.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host path to container path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    /// Container port to the host addresses it is published on.
    #[serde(default)]
    pub ports: BTreeMap<u16, Vec<HostBinding>>,
    #[serde(default)]
    pub privileged: bool,
    /// Container links, for backends that support them.
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    /// File streamed to the container's stdin; only honored by
    /// [`Backend::once`] (e.g. feeding a source tarball to a builder).
    #[serde(default)]
    pub stdin: Option<PathBuf>,
}

/// Abstract container operations, as consumed by the core.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates (but does not start) the container: primes its name, mounts
    /// and port bindings and returns a handle. Called before any existing
    /// instance is torn down, so that a doomed deploy fails early.
    ///
    /// Idempotent on name collision: an existing container by the same name
    /// is removed first.
    async fn prepare(&self, runcfg: &RunConfig, service: &str) -> Result<InstanceHandle>;

    /// Brings the instance up. Returns the (possibly updated) handle.
    async fn start(
        &self,
        runcfg: &RunConfig,
        service: &str,
        handle: InstanceHandle,
    ) -> Result<InstanceHandle>;

    /// Tears the instance down. Tolerant of an already-gone instance: that
    /// is a no-op, not an error.
    async fn terminate(&self, handle: &InstanceHandle) -> Result<()>;

    /// Runs a one-shot job to completion and returns its exit status.
    async fn once(&self, runcfg: &RunConfig) -> Result<i64>;

    async fn status(&self, handle: &InstanceHandle) -> Result<InstanceStatus>;
}
