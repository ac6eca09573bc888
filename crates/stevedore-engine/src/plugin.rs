//! The plugin hook protocol.
//!
//! A plugin is an optional capability module layered on top of the core
//! deploy pipeline. Each plugin implements the subset of the hooks below it
//! cares about; every hook defaults to [`Outcome::Pass`].
//!
//! Hooks run in registration order with short-circuit semantics: the first
//! plugin returning [`Outcome::Claimed`] wins and no further plugins see the
//! hook (see the dispatch methods on
//! [`ControllerInterface`](crate::ControllerInterface)). What "claiming"
//! means is hook-specific: for `setup` it means "I am responsible for this
//! version, skip container creation"; for mutating hooks like
//! `rewrite_service` plugins usually mutate and pass so that later plugins
//! get their turn.
//!
//! Hooks receive the per-operation [`ControllerInterface`] explicitly, so a
//! plugin can call back into the controller (re-enter `setup_version`, set
//! resources, emit progress events) without any task-local state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use stevedore_core::{Definition, Result, RunConfig, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::runcfg::PortAssignments;

/// Result of a single hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The plugin took responsibility; stop the chain.
    Claimed,
    /// Not handled; continue with the next plugin.
    Pass,
}

impl Outcome {
    pub fn claimed(self) -> bool {
        self == Outcome::Claimed
    }
}

/// Files accepted by an upload, keyed by field name, stored on disk by the
/// edge for the duration of the operation.
pub type UploadedFiles = BTreeMap<String, PathBuf>;

/// A request routed to a plugin's API function (`/<plugin>/<func>`).
#[derive(Debug, Default)]
pub struct PluginApiRequest {
    /// JSON body merged with query parameters.
    pub params: Value,
    pub files: UploadedFiles,
}

/// The ordered plugin list shared by all controller interfaces.
pub type PluginList = Arc<Vec<Arc<dyn Plugin>>>;

/// The complete interface a plugin may implement.
#[allow(unused_variables)]
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name, also the prefix of the plugin's API routes and its key
    /// into plugin storage.
    fn name(&self) -> &'static str;

    /// A deployment was just instantiated.
    async fn on_create_deployment(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// The deployment's globals differ from the previous value.
    async fn on_globals_changed(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// A resource fact was declared via `set_resource`.
    async fn on_resource_changed(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        name: &str,
        value: &Value,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Runs before a container is created for a new or changed version.
    /// Claim to take over the setup entirely, typically after putting the
    /// service on hold.
    async fn setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &mut ServiceVersion,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Mutates the working definition during runcfg synthesis, before the
    /// environment is built (e.g. switch the image to a runner base image).
    async fn rewrite_service(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
        definition: &mut Definition,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Contributes template variables for `{NAME}` substitution.
    async fn provide_vars(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
        definition: &Definition,
        vars: &mut BTreeMap<String, String>,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Contributes environment entries (e.g. injected database credentials).
    async fn provide_environment(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        definition: &Definition,
        env: &mut BTreeMap<String, String>,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Final runcfg tweaks after synthesis, before `prepare`.
    async fn before_start(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        definition: &Definition,
        runcfg: &mut RunConfig,
        ports: &PortAssignments,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Like `before_start`, for one-shot exec jobs.
    async fn before_once(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        definition: &Definition,
        runcfg: &mut RunConfig,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Runs after the `setup` chain and, if a container was created, after
    /// the backend start.
    async fn post_setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// The edge accepted an artifact upload for the service.
    async fn on_data_provided(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        files: &UploadedFiles,
        info: &Value,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// An exec/resource directive is being considered; claim to defer it.
    async fn setup_resource(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        name: &str,
        options: &Value,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// A setup plugin decided application code is missing; claim if this
    /// plugin will arrange for the code by other means (e.g. git push).
    async fn needs_app_code(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// First start of the process; bootstrap the `system` deployment.
    async fn on_system_init(&self, cintf: &mut ControllerInterface) -> Result<Outcome> {
        Ok(Outcome::Pass)
    }

    /// Backs the `/<plugin>/<func>` edge routes. `Ok(None)` means the
    /// function does not exist; `Some(Value::Null)` means handled with
    /// events only.
    async fn api_request(
        &self,
        cintf: &mut ControllerInterface,
        func: &str,
        request: &PluginApiRequest,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Whether the given API function may be called without the auth token.
    fn api_is_public(&self, func: &str) -> bool {
        false
    }
}
