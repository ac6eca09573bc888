//! The persistent object model.
//!
//! A [`DeployState`] is the root of the store: deployments own services,
//! services own versions and instances. All types are plain values with
//! serde round-tripping; the store persists the whole graph as one snapshot
//! (see [`crate::store`]).
//!
//! The hold/resume state machine is encoded in [`ServiceState`]: a service
//! is either `Active` with an append-only version list, or `Held` with the
//! pending version and a human-readable reason. Both cannot be true at once
//! and the transitions are enforced by [`Service::hold`] and
//! [`Service::append_version`].

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::Definition;
use crate::error::{Error, Result};

// ─── Root ─────────────────────────────────────────────────────────────────────

/// The store root object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployState {
    /// All deployments, keyed by id. The distinguished `system` deployment
    /// holds infrastructure services.
    #[serde(default)]
    pub deployments: BTreeMap<String, Deployment>,
    /// The process-wide API bearer token. `None` until first boot.
    #[serde(default)]
    pub auth_key: Option<String>,
    /// Schema version of this snapshot; bumped by migrations only.
    #[serde(default)]
    pub schema_version: u32,
    /// Host ports handed out to instances, so repeat assignment can avoid
    /// collisions. Freed when the owning instance is terminated.
    #[serde(default)]
    pub allocated_ports: BTreeSet<u16>,
    /// Process-wide plugin storage, keyed by plugin name.
    #[serde(default)]
    pub plugin_data: BTreeMap<String, Value>,
}

impl DeployState {
    pub fn deployment(&self, id: &str) -> Result<&Deployment> {
        self.deployments
            .get(id)
            .ok_or_else(|| Error::invalid_input(format!("no such deployment: {id}")))
    }

    pub fn deployment_mut(&mut self, id: &str) -> Result<&mut Deployment> {
        self.deployments
            .get_mut(id)
            .ok_or_else(|| Error::invalid_input(format!("no such deployment: {id}")))
    }
}

// ─── Deployment ───────────────────────────────────────────────────────────────

/// A named group of services managed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    /// Deployment-wide settings: an opaque tree of global sections and
    /// plugin directives. The core itself reads only the `Env` key.
    #[serde(default = "empty_object")]
    pub globals: Value,
    /// Services in the order they were first installed.
    #[serde(default)]
    pub services: IndexMap<String, Service>,
    /// Plugin-created facts about this deployment, e.g. "database foo has
    /// been provisioned". Gate held services.
    #[serde(default)]
    pub resources: BTreeMap<String, Value>,
    /// Per-deployment plugin scratch storage, keyed by plugin name.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Deployment {
    pub fn new(id: impl Into<String>) -> Self {
        Deployment {
            id: id.into(),
            globals: empty_object(),
            services: IndexMap::new(),
            resources: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services.get(name).ok_or_else(|| {
            Error::invalid_input(format!("no such service: {}/{}", self.id, name))
        })
    }

    pub fn service_mut(&mut self, name: &str) -> Result<&mut Service> {
        let id = self.id.clone();
        self.services
            .get_mut(name)
            .ok_or_else(|| Error::invalid_input(format!("no such service: {id}/{name}")))
    }

    /// Returns the service record for `name`, creating an empty slot first
    /// if this is a new service.
    pub fn ensure_service(&mut self, name: &str) -> &mut Service {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| Service::new(name))
    }

    /// Whether a service of that name exists; held services only count when
    /// `allow_held` is set.
    pub fn has_service(&self, name: &str, allow_held: bool) -> bool {
        match self.services.get(name) {
            Some(service) => allow_held || !service.is_held(),
            None => false,
        }
    }

    /// Stores a resource fact. Returns whether the value is new or changed.
    pub fn set_resource(&mut self, name: &str, value: Value) -> bool {
        self.resources.insert(name.to_string(), value.clone()) != Some(value)
    }

    pub fn resource(&self, name: &str) -> Option<&Value> {
        self.resources.get(name)
    }
}

// ─── Service ──────────────────────────────────────────────────────────────────

/// A named container-role within a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub state: ServiceState,
    /// Running (or last-started) instances of the latest version.
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
}

/// The hold/resume state machine.
///
/// Held services are known but not yet materialized as containers; they are
/// started once the missing part (a dependency, uploaded code, a provisioned
/// resource) becomes available.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceState {
    Active { versions: Vec<ServiceVersion> },
    Held { version: Box<ServiceVersion>, reason: String },
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            state: ServiceState::Active {
                versions: Vec::new(),
            },
            instances: Vec::new(),
        }
    }

    /// The appended versions, oldest first. Empty while held.
    pub fn versions(&self) -> &[ServiceVersion] {
        match &self.state {
            ServiceState::Active { versions } => versions,
            ServiceState::Held { .. } => &[],
        }
    }

    /// The most recently appended version, if any.
    pub fn latest(&self) -> Option<&ServiceVersion> {
        self.versions().last()
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state, ServiceState::Held { .. })
    }

    pub fn hold_reason(&self) -> Option<&str> {
        match &self.state {
            ServiceState::Held { reason, .. } => Some(reason),
            ServiceState::Active { .. } => None,
        }
    }

    /// The version deferred by a hold, if the service is held.
    pub fn held_version(&self) -> Option<&ServiceVersion> {
        match &self.state {
            ServiceState::Held { version, .. } => Some(version),
            ServiceState::Active { .. } => None,
        }
    }

    /// Puts the service on hold, remembering `version` so it can be
    /// appended once the missing part becomes available.
    ///
    /// Only services without any appended versions can be held; holding a
    /// versioned service fails with [`Error::InvalidState`].
    pub fn hold(&mut self, reason: impl Into<String>, version: ServiceVersion) -> Result<()> {
        if !self.versions().is_empty() {
            return Err(Error::InvalidState(format!(
                "cannot hold service {} that already has versions",
                self.name
            )));
        }
        self.state = ServiceState::Held {
            version: Box::new(version),
            reason: reason.into(),
        };
        Ok(())
    }

    /// Derives the next version from the current state: frozen globals
    /// snapshot, inherited data map, and the given definition.
    pub fn derive(&self, definition: Definition, globals: Value) -> ServiceVersion {
        ServiceVersion {
            definition,
            globals,
            data: self.current_version().map(|v| v.data.clone()).unwrap_or_default(),
            instance_count: self.latest().map(|v| v.instance_count).unwrap_or(1),
        }
    }

    /// Derives a new version carrying over the current definition, e.g. to
    /// attach new application code without a definition change.
    pub fn derive_current(&self, globals: Value) -> Option<ServiceVersion> {
        self.current_version()
            .map(|v| self.derive(v.definition.clone(), globals))
    }

    fn current_version(&self) -> Option<&ServiceVersion> {
        self.held_version().or_else(|| self.latest())
    }

    /// Appends a version, releasing any hold. Returns the version number
    /// (1-based).
    pub fn append_version(&mut self, version: ServiceVersion) -> usize {
        if self.is_held() {
            self.state = ServiceState::Active {
                versions: Vec::new(),
            };
        }
        let ServiceState::Active { versions } = &mut self.state else {
            unreachable!("hold cleared above");
        };
        versions.push(version);
        versions.len()
    }

    /// Records a started instance of the latest version.
    pub fn append_instance(&mut self, instance: ServiceInstance) {
        self.instances.push(instance);
    }
}

// ─── Versions and instances ───────────────────────────────────────────────────

/// An immutable snapshot of a service's configuration at a point in time.
///
/// After being appended to a service, only `data` and `instance_count` may
/// still change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceVersion {
    pub definition: Definition,
    /// The deployment globals frozen at derivation time.
    #[serde(default = "empty_object")]
    pub globals: Value,
    /// Per-version data, e.g. the id of the application build to run.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default = "one")]
    pub instance_count: u32,
}

fn one() -> u32 {
    1
}

impl ServiceVersion {
    /// The `Env` section of the frozen globals for the given service name.
    pub fn globals_env(&self, service_name: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(section) = self
            .globals
            .get("Env")
            .and_then(|envs| envs.get(service_name))
            .and_then(Value::as_object)
        {
            for (key, value) in section {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.insert(key.clone(), value);
            }
        }
        env
    }
}

/// A running (or previously running) container fulfilling a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Core-assigned instance id.
    pub id: String,
    /// The opaque token the backend needs to address this instance.
    pub handle: crate::backend::InstanceHandle,
    /// Index of the owning version in the service's version list.
    pub version: usize,
    /// Host ports reserved for this instance; released on termination.
    #[serde(default)]
    pub ports: Vec<u16>,
}
