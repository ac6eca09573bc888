//! The per-operation controller interface.
//!
//! A [`ControllerInterface`] is the facade one operation (one HTTP request,
//! one bootstrap step) works through: it owns a private store connection and
//! the operation's progress [`Context`], plus shared handles to the backend,
//! the plugin list and service discovery. Stores do not support sharing a
//! connection across tasks, so every operation gets its own interface.
//!
//! Nothing is persisted until [`ControllerInterface::commit`]; an operation
//! that fails mid-way simply never commits, leaving no partial state from
//! the failing service. Earlier services committed by the same request stay
//! applied; multi-service deploys are not atomic by design.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use stevedore_core::{
    Backend, Context, Deployment, Discovery, Error, Result, RunConfig, ServiceInstance,
    ServiceVersion, StoreConn, canonicalize, token,
};

use crate::plugin::{Outcome, PluginApiRequest, PluginList, UploadedFiles};
use crate::runcfg::PortAssignments;
use crate::settings::EngineSettings;

/// Bounds for assigned host ports.
const PORT_RANGE: std::ops::Range<u16> = 10000..65000;

/// The per-connection controller facade. See the module docs.
pub struct ControllerInterface {
    pub(crate) conn: StoreConn,
    ctx: Context,
    backend: Arc<dyn Backend>,
    discovery: Arc<dyn Discovery>,
    plugins: PluginList,
    settings: Arc<EngineSettings>,
    /// Services whose setup is on the current call stack; re-entering one
    /// of them means the dependency graph has a cycle.
    in_progress: Vec<(String, String)>,
}

impl ControllerInterface {
    pub fn new(
        conn: StoreConn,
        ctx: Context,
        backend: Arc<dyn Backend>,
        discovery: Arc<dyn Discovery>,
        plugins: PluginList,
        settings: Arc<EngineSettings>,
    ) -> Self {
        ControllerInterface {
            conn,
            ctx,
            backend,
            discovery,
            plugins,
            settings,
            in_progress: Vec::new(),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    /// The working snapshot of the store.
    pub fn state(&self) -> &stevedore_core::DeployState {
        &self.conn.state
    }

    pub fn state_mut(&mut self) -> &mut stevedore_core::DeployState {
        &mut self.conn.state
    }

    /// The progress channel of this operation.
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    pub fn discovery(&self) -> Arc<dyn Discovery> {
        Arc::clone(&self.discovery)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn auth_key(&self) -> Option<&str> {
        self.conn.state.auth_key.as_deref()
    }

    /// Persists the working snapshot. Fails with [`Error::Conflict`] on a
    /// concurrent commit.
    pub fn commit(&mut self) -> Result<()> {
        self.conn.commit()
    }

    /// Discards the working snapshot.
    pub fn abort(self) {
        self.conn.abort();
    }

    /// A cache directory shared between deploys, keyed by the given parts.
    pub fn cache_dir(&self, parts: &[&str]) -> Result<PathBuf> {
        let mut dir = self.settings.volume_base.join("_cache");
        for part in parts {
            dir = dir.join(part);
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Creates a deployment. With `fail`, an existing id is an error;
    /// otherwise the call is a no-op returning `false`.
    pub async fn create_deployment(&mut self, deploy_id: &str, fail: bool) -> Result<bool> {
        if self.conn.state.deployments.contains_key(deploy_id) {
            if fail {
                return Err(Error::invalid_input(format!(
                    "deployment {deploy_id} already exists"
                )));
            }
            return Ok(false);
        }
        self.conn
            .state
            .deployments
            .insert(deploy_id.to_string(), Deployment::new(deploy_id));
        self.run_on_create_deployment(deploy_id).await?;
        Ok(true)
    }

    /// Replaces the deployment's globals. Returns whether they changed;
    /// the caller uses that to force-rebuild services.
    pub async fn set_globals(&mut self, deploy_id: &str, globals: Value) -> Result<bool> {
        let deployment = self.conn.state.deployment_mut(deploy_id)?;
        let changed = deployment.globals != globals;
        deployment.globals = globals;
        if changed {
            self.run_on_globals_changed(deploy_id).await?;
        }
        Ok(changed)
    }

    /// Adds a service to the deployment, or replaces the existing service
    /// with a changed definition. An unchanged definition is skipped unless
    /// `force` is set.
    pub async fn set_service(
        &mut self,
        deploy_id: &str,
        name: &str,
        raw: &Value,
        force: bool,
    ) -> Result<()> {
        let ctx = self.ctx.clone();
        ctx.job(format!("{name} - installing")).await;

        let (name, definition) = canonicalize(name, raw)?;

        let deployment = self.conn.state.deployment(deploy_id)?;
        if !force
            && let Some(service) = deployment.services.get(&name)
            && let Some(latest) = service.latest()
            && latest.definition == definition
        {
            ctx.log("service has not changed, skipping").await;
            return Ok(());
        }
        let globals = deployment.globals.clone();

        let version = self
            .conn
            .state
            .deployment_mut(deploy_id)?
            .ensure_service(&name)
            .derive(definition, globals);

        self.setup_version(deploy_id, &name, version).await
    }

    /// Drives the setup process for a derived (not yet appended) version.
    ///
    /// The `setup` plugin chain runs first; if a plugin claims the version,
    /// container creation is skipped and the plugin is responsible for
    /// eventually releasing the hold (or being a no-op). `post_setup` always
    /// runs afterwards. Re-entrant: plugins call this again for services
    /// whose hold just resolved.
    pub fn setup_version<'a>(
        &'a mut self,
        deploy_id: &'a str,
        service_name: &'a str,
        version: ServiceVersion,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = (deploy_id.to_string(), service_name.to_string());
            if let Some(pos) = self.in_progress.iter().position(|k| *k == key) {
                // A service may re-enter from its own post_setup chain once
                // (its missing part became available mid-setup). Anything
                // else is a dependency cycle.
                let occurrences = self.in_progress.iter().filter(|k| **k == key).count();
                let is_self_retry = pos + 1 == self.in_progress.len() && occurrences == 1;
                if !is_self_retry {
                    let mut names: Vec<&str> = self.in_progress[pos..]
                        .iter()
                        .map(|(_, name)| name.as_str())
                        .collect();
                    names.push(service_name);
                    return Err(Error::deploy(format!(
                        "dependency cycle: {}",
                        names.join(" → ")
                    )));
                }
            }

            self.in_progress.push(key);
            let result = self.setup_version_inner(deploy_id, service_name, version).await;
            self.in_progress.pop();
            result
        })
    }

    async fn setup_version_inner(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        mut version: ServiceVersion,
    ) -> Result<()> {
        let claimed = self
            .run_setup(deploy_id, service_name, &mut version)
            .await?
            .claimed();

        if !claimed {
            // No plugin took over: deploy as a regular container.
            self.create_container(deploy_id, service_name, &version)
                .await?;
        } else if let Some(reason) = self
            .conn
            .state
            .deployment(deploy_id)?
            .service(service_name)?
            .hold_reason()
            .map(str::to_string)
        {
            self.ctx.clone().log(format!("service was held: {reason}")).await;
        }

        self.run_post_setup(deploy_id, service_name, &version).await?;
        Ok(())
    }

    /// Puts a service on hold with the deferred version. Plugins call this
    /// from their `setup` hook before claiming.
    pub fn hold_service(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        reason: impl Into<String>,
        version: ServiceVersion,
    ) -> Result<()> {
        self.conn
            .state
            .deployment_mut(deploy_id)?
            .service_mut(service_name)?
            .hold(reason, version)
    }

    /// Creates the container a service version defines: synthesize the
    /// runcfg, prepare the new container first (fail early), tear down any
    /// previous instance (avoid port collisions), then start.
    pub(crate) async fn create_container(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<()> {
        let ctx = self.ctx.clone();
        let (mut runcfg, definition, port_assignments) = self
            .generate_runcfg(deploy_id, service_name, version)
            .await?;

        // Informative for now; version number is where this instance will
        // land once appended.
        {
            let service = self.conn.state.deployment(deploy_id)?.service(service_name)?;
            let version_number = service.versions().len() + 1;
            let instance_number = service.latest().map(|v| v.instance_count).unwrap_or(1);
            runcfg.name =
                format!("{deploy_id}-{service_name}-{version_number}-{instance_number}");
        }

        self.run_before_start(
            deploy_id,
            service_name,
            &definition,
            &mut runcfg,
            &port_assignments,
        )
        .await?;

        let handle = self.backend.prepare(&runcfg, service_name).await?;

        // All services may only run once for now. Replace any previous
        // instance before starting the new one.
        let previous = {
            let service = self
                .conn
                .state
                .deployment_mut(deploy_id)?
                .service_mut(service_name)?;
            std::mem::take(&mut service.instances)
        };
        for instance in previous {
            ctx.log(format!("Killing existing container {}", instance.handle.name))
                .await;
            self.backend.terminate(&instance.handle).await?;
            for port in instance.ports {
                self.conn.state.allocated_ports.remove(&port);
            }
        }

        let handle = self.backend.start(&runcfg, service_name, handle).await?;

        let instance_id = token::random_hex(6);
        let ports: Vec<u16> = port_assignments
            .values()
            .filter_map(|a| a.host.port)
            .collect();
        {
            let service = self
                .conn
                .state
                .deployment_mut(deploy_id)?
                .service_mut(service_name)?;
            let number = service.append_version(version.clone());
            service.append_instance(ServiceInstance {
                id: instance_id.clone(),
                handle,
                version: number - 1,
                ports,
            });
        }
        ctx.log(format!("New instance id is {instance_id}")).await;
        Ok(())
    }

    /// Accepts an artifact upload for a service (e.g. application code that
    /// cannot be part of the definition itself).
    pub async fn provide_data(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        files: &UploadedFiles,
        info: &Value,
    ) -> Result<()> {
        self.conn.state.deployment(deploy_id)?.service(service_name)?;
        self.run_on_data_provided(deploy_id, service_name, files, info)
            .await?;
        Ok(())
    }

    /// Declares the given resource to be available. Every call fires the
    /// `on_resource_changed` chain, changed value or not.
    pub async fn set_resource(
        &mut self,
        deploy_id: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.conn
            .state
            .deployment_mut(deploy_id)?
            .set_resource(name, value.clone());
        self.run_on_resource_changed(deploy_id, name, &value).await?;
        Ok(())
    }

    /// Routes `/<plugin>/<func>` to the named plugin.
    pub async fn run_api(
        &mut self,
        plugin_name: &str,
        func: &str,
        request: &PluginApiRequest,
    ) -> Result<Option<Value>> {
        let plugins = Arc::clone(&self.plugins);
        let plugin = plugins
            .iter()
            .find(|p| p.name() == plugin_name)
            .ok_or_else(|| Error::invalid_input(format!("no such plugin: {plugin_name}")))?;
        plugin.api_request(self, func, request).await
    }

    /// Whether `/<plugin>/<func>` opted out of auth.
    pub fn plugin_api_is_public(&self, plugin_name: &str, func: &str) -> bool {
        self.plugins
            .iter()
            .find(|p| p.name() == plugin_name)
            .is_some_and(|p| p.api_is_public(func))
    }

    // ─── Port registry ───────────────────────────────────────────────────────

    /// Reserves a random free host port in the persisted registry, so two
    /// services cannot be handed the same port.
    pub(crate) fn allocate_port(&mut self) -> Result<u16> {
        let allocated = &mut self.conn.state.allocated_ports;
        let mut rng = rand::thread_rng();
        for _ in 0..128 {
            let port = rng.gen_range(PORT_RANGE);
            if allocated.insert(port) {
                return Ok(port);
            }
        }
        Err(Error::deploy("no free host port available"))
    }

    /// Returns one-shot port reservations (exec jobs) to the pool.
    pub fn release_ports(&mut self, assignments: &PortAssignments) {
        for assignment in assignments.values() {
            if let Some(port) = assignment.host.port {
                self.conn.state.allocated_ports.remove(&port);
            }
        }
    }
}

// ─── Plugin dispatch ──────────────────────────────────────────────────────────
//
// Each hook gets a dispatch method iterating plugins in registration order
// and stopping at the first claim.

macro_rules! dispatch {
    ($self:ident, $hook:ident, $($arg:expr),*) => {{
        let plugins = Arc::clone(&$self.plugins);
        for plugin in plugins.iter() {
            if plugin.$hook($self, $($arg),*).await?.claimed() {
                debug!(plugin = plugin.name(), hook = stringify!($hook), "hook claimed");
                return Ok(Outcome::Claimed);
            }
        }
        Ok(Outcome::Pass)
    }};
}

impl ControllerInterface {
    pub async fn run_on_create_deployment(&mut self, deploy_id: &str) -> Result<Outcome> {
        dispatch!(self, on_create_deployment, deploy_id)
    }

    pub async fn run_on_globals_changed(&mut self, deploy_id: &str) -> Result<Outcome> {
        dispatch!(self, on_globals_changed, deploy_id)
    }

    pub async fn run_on_resource_changed(
        &mut self,
        deploy_id: &str,
        name: &str,
        value: &Value,
    ) -> Result<Outcome> {
        dispatch!(self, on_resource_changed, deploy_id, name, value)
    }

    pub async fn run_setup(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &mut ServiceVersion,
    ) -> Result<Outcome> {
        dispatch!(self, setup, deploy_id, service_name, version)
    }

    pub async fn run_rewrite_service(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
        definition: &mut stevedore_core::Definition,
    ) -> Result<Outcome> {
        dispatch!(self, rewrite_service, deploy_id, service_name, version, definition)
    }

    pub async fn run_provide_vars(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
        definition: &stevedore_core::Definition,
        vars: &mut BTreeMap<String, String>,
    ) -> Result<Outcome> {
        dispatch!(self, provide_vars, deploy_id, service_name, version, definition, vars)
    }

    pub async fn run_provide_environment(
        &mut self,
        deploy_id: &str,
        definition: &stevedore_core::Definition,
        env: &mut BTreeMap<String, String>,
    ) -> Result<Outcome> {
        dispatch!(self, provide_environment, deploy_id, definition, env)
    }

    pub async fn run_before_start(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        definition: &stevedore_core::Definition,
        runcfg: &mut RunConfig,
        ports: &PortAssignments,
    ) -> Result<Outcome> {
        dispatch!(self, before_start, deploy_id, service_name, definition, runcfg, ports)
    }

    pub async fn run_before_once(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        definition: &stevedore_core::Definition,
        runcfg: &mut RunConfig,
    ) -> Result<Outcome> {
        dispatch!(self, before_once, deploy_id, service_name, definition, runcfg)
    }

    pub async fn run_post_setup(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<Outcome> {
        dispatch!(self, post_setup, deploy_id, service_name, version)
    }

    pub async fn run_on_data_provided(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        files: &UploadedFiles,
        info: &Value,
    ) -> Result<Outcome> {
        dispatch!(self, on_data_provided, deploy_id, service_name, files, info)
    }

    pub async fn run_setup_resource(
        &mut self,
        deploy_id: &str,
        name: &str,
        options: &Value,
    ) -> Result<Outcome> {
        dispatch!(self, setup_resource, deploy_id, name, options)
    }

    pub async fn run_needs_app_code(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<Outcome> {
        dispatch!(self, needs_app_code, deploy_id, service_name, version)
    }

    pub async fn run_on_system_init(&mut self) -> Result<Outcome> {
        dispatch!(self, on_system_init,)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Plugin;
    use crate::testing::{BackendCall, TestController};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn create_deployment_honors_fail_flag() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();

        assert!(cintf.create_deployment("foo", true).await.unwrap());
        let err = cintf.create_deployment("foo", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!cintf.create_deployment("foo", false).await.unwrap());
    }

    #[tokio::test]
    async fn unchanged_definition_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        let def = json!({"image": "bar", "cmd": ["serve"]});
        cintf.set_service("foo", "bar", &def, false).await.unwrap();
        assert_eq!(tc.backend.starts(), 1);

        // Same definition again: no backend call, no new version.
        cintf.set_service("foo", "bar", &def, false).await.unwrap();
        assert_eq!(tc.backend.starts(), 1);
        let service = cintf.state().deployment("foo").unwrap().service("bar").unwrap();
        assert_eq!(service.versions().len(), 1);
    }

    #[tokio::test]
    async fn changed_definition_replaces_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "env": {"A": "1"}}), false)
            .await
            .unwrap();
        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "env": {"A": "2"}}), false)
            .await
            .unwrap();

        let service = cintf.state().deployment("foo").unwrap().service("bar").unwrap();
        assert_eq!(service.versions().len(), 2);
        assert_eq!(service.instances.len(), 1);
        assert_eq!(tc.backend.starts(), 2);
        // Exactly one terminate, for the first instance, before the second
        // start.
        assert_eq!(tc.backend.terminations(), 1);
        let calls = tc.backend.calls();
        let terminate_at = calls
            .iter()
            .position(|c| matches!(c, BackendCall::Terminate(_)))
            .unwrap();
        let second_start = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, BackendCall::Start(_)))
            .map(|(i, _)| i)
            .nth(1)
            .unwrap();
        assert!(terminate_at < second_start);
    }

    #[tokio::test]
    async fn globals_change_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        let def = json!({"image": "x"});
        cintf.set_service("foo", "x", &def, false).await.unwrap();

        let changed = cintf
            .set_globals("foo", json!({"Env": {"x": {"A": "1"}}}))
            .await
            .unwrap();
        assert!(changed);

        cintf.set_service("foo", "x", &def, changed).await.unwrap();
        let service = cintf.state().deployment("foo").unwrap().service("x").unwrap();
        assert_eq!(service.versions().len(), 2);
    }

    #[tokio::test]
    async fn set_globals_is_idempotent() {
        struct CountingPlugin(AtomicUsize);
        #[async_trait]
        impl Plugin for CountingPlugin {
            fn name(&self) -> &'static str {
                "counting"
            }
            async fn on_globals_changed(
                &self,
                _cintf: &mut ControllerInterface,
                _deploy_id: &str,
            ) -> Result<Outcome> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Pass)
            }
        }

        let plugin = Arc::new(CountingPlugin(AtomicUsize::new(0)));
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![plugin.clone()], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        assert!(cintf.set_globals("foo", json!({"A": 1})).await.unwrap());
        assert!(!cintf.set_globals("foo", json!({"A": 1})).await.unwrap());
        assert_eq!(plugin.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_stops_at_first_claim() {
        struct Claiming {
            calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Plugin for Claiming {
            fn name(&self) -> &'static str {
                "claiming"
            }
            async fn on_create_deployment(
                &self,
                _cintf: &mut ControllerInterface,
                _deploy_id: &str,
            ) -> Result<Outcome> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Claimed)
            }
        }
        struct Tail {
            calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Plugin for Tail {
            fn name(&self) -> &'static str {
                "tail"
            }
            async fn on_create_deployment(
                &self,
                _cintf: &mut ControllerInterface,
                _deploy_id: &str,
            ) -> Result<Outcome> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Pass)
            }
        }

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(
            vec![
                Arc::new(Claiming {
                    calls: first.clone(),
                }),
                Arc::new(Tail {
                    calls: second.clone(),
                }),
            ],
            dir.path(),
        )
        .unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn commit_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        {
            let mut cintf = tc.interface().unwrap();
            cintf.create_deployment("foo", true).await.unwrap();
            cintf
                .set_service("foo", "bar", &json!({"image": "bar"}), false)
                .await
                .unwrap();
            cintf.commit().unwrap();
        }

        let cintf = tc.interface().unwrap();
        let service = cintf.state().deployment("foo").unwrap().service("bar").unwrap();
        assert_eq!(service.versions().len(), 1);
        assert_eq!(service.instances.len(), 1);
    }

    #[tokio::test]
    async fn ports_are_unique_and_released_on_replace() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        cintf
            .set_service("foo", "a", &json!({"image": "a"}), false)
            .await
            .unwrap();
        cintf
            .set_service("foo", "b", &json!({"image": "b"}), false)
            .await
            .unwrap();

        let allocated = cintf.state().allocated_ports.clone();
        // One default port per service.
        assert_eq!(allocated.len(), 2);

        cintf
            .set_service("foo", "a", &json!({"image": "a", "env": {"X": "1"}}), false)
            .await
            .unwrap();
        // The replaced instance's port went back to the pool.
        assert_eq!(cintf.state().allocated_ports.len(), 2);
    }
}
