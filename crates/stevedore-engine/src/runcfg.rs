//! Runcfg synthesis: resolving a service version into the final container
//! configuration.
//!
//! The synthesis pipeline, in order: plugins rewrite a working copy of the
//! definition, template variables are collected, volumes get their host
//! paths, ports are assigned and turned into env/template variables, the
//! environment is assembled in layers (deployment `Env` globals, controller
//! builtins, port variables, the service's own env, plugin contributions)
//! and finally every string is run through `{NAME}` substitution.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use stevedore_core::{
    Definition, Error, HostBinding, PortSpec, Result, RunConfig, ServiceVersion,
};

use crate::interface::ControllerInterface;
use crate::vars::substitute;

/// Where a named port ended up: the host binding it is published on and the
/// port inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub host: HostBinding,
    pub container: u16,
}

/// Port name to assignment, in definition order.
pub type PortAssignments = IndexMap<String, PortAssignment>;

impl ControllerInterface {
    /// Generates the final, controller-independent runcfg for a service
    /// version, as consumed by the backends.
    ///
    /// Returns the runcfg, the (plugin-rewritten) working definition and
    /// the port assignments. The container name and the `before_start`
    /// chain are applied by the caller; exec jobs run unnamed.
    pub async fn generate_runcfg(
        &mut self,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<(RunConfig, Definition, PortAssignments)> {
        // Plugins first get a chance to rewrite the definition. They work
        // on a copy so the stored version stays pristine.
        let mut definition = version.definition.clone();
        self.run_rewrite_service(deploy_id, service_name, version, &mut definition)
            .await?;

        let host_ip = self.settings().host_ip.clone();
        let mut local_repl: BTreeMap<String, String> = BTreeMap::new();
        local_repl.insert("HOST".to_string(), host_ip.clone());
        local_repl.insert("DEPLOY_ID".to_string(), deploy_id.to_string());
        self.run_provide_vars(deploy_id, service_name, version, &definition, &mut local_repl)
            .await?;

        let mut runcfg = RunConfig {
            image: definition.image.clone(),
            cmd: definition.cmd.clone(),
            entrypoint: definition.entrypoint.clone(),
            privileged: definition.privileged,
            ..RunConfig::default()
        };

        for (volume_name, container_path) in &definition.volumes {
            let host_path = self
                .settings()
                .volume_base
                .join(deploy_id)
                .join(service_name)
                .join(volume_name);
            runcfg
                .volumes
                .insert(host_path.to_string_lossy().into_owned(), container_path.clone());
        }

        // Map every named port to the host and derive the variables a
        // definition may reference from it.
        let mut extra_env: BTreeMap<String, String> = BTreeMap::new();
        let mut port_assignments = PortAssignments::new();
        for (port_name, spec) in definition.ports.clone() {
            let host_port = self.allocate_port()?;
            // When asked to pick the container port, use the same number
            // as on the host; discovery registration stays simple that way.
            let container_port = match spec {
                PortSpec::Assign => host_port,
                PortSpec::Number(n) => n,
            };
            let host = HostBinding::new(host_ip.clone(), host_port);
            port_assignments.insert(
                port_name.clone(),
                PortAssignment {
                    host: host.clone(),
                    container: container_port,
                },
            );
            runcfg.ports.entry(container_port).or_default().push(host);

            let suffix = if port_name.is_empty() {
                String::new()
            } else {
                format!("_{}", port_name.to_uppercase())
            };
            let port_var = format!("PORT{suffix}");
            local_repl.insert(port_var.clone(), container_port.to_string());
            extra_env.insert(port_var, container_port.to_string());

            let sd_var = format!("SD{suffix}");
            extra_env.insert(sd_var.clone(), format!("{host_ip}:{host_port}"));
            extra_env.insert(format!("{sd_var}_PORT"), host_port.to_string());
            extra_env.insert(format!("{sd_var}_HOST"), host_ip.clone());
            let mut sd_name = format!("{deploy_id}:{service_name}");
            if !port_name.is_empty() {
                sd_name.push(':');
                sd_name.push_str(&port_name);
            }
            extra_env.insert(format!("{sd_var}_NAME"), sd_name);
        }

        // Extra host bindings for already-assigned ports.
        for (binding, port_name) in &definition.wan_map {
            let assignment = port_assignments.get(port_name).ok_or_else(|| {
                Error::deploy(format!(
                    "wan_map references unknown port name {port_name:?}"
                ))
            })?;
            runcfg
                .ports
                .entry(assignment.container)
                .or_default()
                .push(binding.clone());
        }

        // Environment layers, later layers override earlier ones.
        let mut env = version.globals_env(service_name);
        env.insert("DEPLOY_ID".to_string(), deploy_id.to_string());
        env.insert("DISCOVERD".to_string(), format!("{host_ip}:1111"));
        env.insert("ETCD".to_string(), format!("http://{host_ip}:4001"));
        env.extend(extra_env);
        env.extend(definition.env.clone());
        self.run_provide_environment(deploy_id, &definition, &mut env)
            .await?;

        runcfg.env = env
            .into_iter()
            .map(|(key, value)| {
                (
                    substitute(&key, &local_repl),
                    substitute(&value, &local_repl),
                )
            })
            .collect();
        runcfg.cmd = runcfg
            .cmd
            .iter()
            .map(|part| substitute(part, &local_repl))
            .collect();
        runcfg.entrypoint = runcfg
            .entrypoint
            .iter()
            .map(|part| substitute(part, &local_repl))
            .collect();

        Ok((runcfg, definition, port_assignments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestController;
    use serde_json::json;

    async fn runcfg_for(
        def: serde_json::Value,
    ) -> (tempfile::TempDir, TestController, RunConfig) {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf.set_service("foo", "web", &def, false).await.unwrap();
        let runcfg = tc.backend.last_runcfg().unwrap();
        (dir, tc, runcfg)
    }

    #[tokio::test]
    async fn default_port_derives_env_and_vars() {
        let (_dir, _tc, runcfg) =
            runcfg_for(json!({"image": "web", "cmd": ["serve", "-p", "{PORT}"]})).await;

        let port = runcfg.env.get("PORT").unwrap().clone();
        assert_eq!(
            runcfg.cmd,
            vec!["serve".to_string(), "-p".to_string(), port.clone()]
        );
        assert_eq!(
            runcfg.env.get("SD").unwrap(),
            &format!("127.0.0.1:{port}")
        );
        assert_eq!(runcfg.env.get("SD_HOST").unwrap(), "127.0.0.1");
        assert_eq!(runcfg.env.get("SD_NAME").unwrap(), "foo:web");
        assert_eq!(runcfg.env.get("DEPLOY_ID").unwrap(), "foo");
        assert_eq!(runcfg.env.get("DISCOVERD").unwrap(), "127.0.0.1:1111");
        assert_eq!(runcfg.env.get("ETCD").unwrap(), "http://127.0.0.1:4001");
    }

    #[tokio::test]
    async fn named_ports_use_uppercase_suffixes() {
        let (_dir, _tc, runcfg) = runcfg_for(json!({"image": "web", "ports": ["http"]})).await;
        assert!(runcfg.env.contains_key("PORT_HTTP"));
        assert!(runcfg.env.contains_key("SD_HTTP_PORT"));
        assert_eq!(runcfg.env.get("SD_HTTP_NAME").unwrap(), "foo:web:http");
    }

    #[tokio::test]
    async fn fixed_port_maps_to_random_host_port() {
        let (_dir, _tc, runcfg) = runcfg_for(json!({"image": "web", "port": 6379})).await;
        assert_eq!(runcfg.env.get("PORT").unwrap(), "6379");
        let bindings = runcfg.ports.get(&6379).unwrap();
        assert_eq!(bindings.len(), 1);
        let host_port = bindings[0].port.unwrap();
        assert!((10000..65000).contains(&host_port));
    }

    #[tokio::test]
    async fn wan_map_appends_bindings() {
        let (_dir, _tc, runcfg) = runcfg_for(json!({
            "image": "web",
            "ports": {"http": 80},
            "wan_map": {"0.0.0.0:80": "http"},
        }))
        .await;
        let bindings = runcfg.ports.get(&80).unwrap();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.contains(&HostBinding::new("0.0.0.0", 80)));
    }

    #[tokio::test]
    async fn volumes_live_under_the_deployment_tree() {
        let (_dir, tc, runcfg) =
            runcfg_for(json!({"image": "web", "volumes": {"data": "/var/data"}})).await;
        let expected = tc
            .settings
            .volume_base
            .join("foo")
            .join("web")
            .join("data");
        assert_eq!(
            runcfg.volumes.get(&expected.to_string_lossy().into_owned()),
            Some(&"/var/data".to_string())
        );
    }

    #[tokio::test]
    async fn globals_env_is_overridden_by_service_env() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_globals("foo", json!({"Env": {"web": {"A": "global", "B": "kept"}}}))
            .await
            .unwrap();

        cintf
            .set_service("foo", "web", &json!({"image": "web", "env": {"A": "own"}}), false)
            .await
            .unwrap();

        let runcfg = tc.backend.last_runcfg().unwrap();
        assert_eq!(runcfg.env.get("A").unwrap(), "own");
        assert_eq!(runcfg.env.get("B").unwrap(), "kept");
    }

    #[tokio::test]
    async fn container_name_encodes_version_and_instance() {
        let (_dir, _tc, runcfg) = runcfg_for(json!({"image": "web"})).await;
        assert_eq!(runcfg.name, "foo-web-1-1");
    }
}
