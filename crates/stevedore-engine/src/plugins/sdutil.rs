//! Wraps containers with `sdutil` for service discovery registration and
//! consumption.
//!
//! Requires the sdutil binary to exist in the container. The entrypoint of
//! the image is not read, so services need to re-declare their entrypoint
//! in the definition for the wrapping to compose correctly.

use async_trait::async_trait;
use serde_json::Value;

use stevedore_core::{Definition, Result, RunConfig};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};
use crate::runcfg::PortAssignments;

pub struct SdutilPlugin;

#[async_trait]
impl Plugin for SdutilPlugin {
    fn name(&self) -> &'static str {
        "sdutil"
    }

    async fn before_start(
        &self,
        _cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        definition: &Definition,
        runcfg: &mut RunConfig,
        ports: &PortAssignments,
    ) -> Result<Outcome> {
        let Some(cfg) = definition.kwarg("sdutil").and_then(Value::as_object) else {
            return Ok(Outcome::Pass);
        };
        let binary = cfg
            .get("binary")
            .and_then(Value::as_str)
            .unwrap_or("/sdutil")
            .to_string();

        let mut current: Vec<String> = runcfg.entrypoint.clone();
        current.extend(runcfg.cmd.iter().cloned());
        let mut new_cmd = current.clone();

        // Consumption first, so the service is not registered while still
        // waiting for its dependencies.
        if let Some(expose) = cfg.get("expose").and_then(Value::as_object) {
            let mut deps = Vec::new();
            for (service, var_name) in expose {
                deps.push("-d".to_string());
                deps.push(format!(
                    "{}:{deploy_id}:{service}",
                    var_name.as_str().unwrap_or_default()
                ));
            }
            let mut wrapped = vec![binary.clone(), "expose".to_string()];
            wrapped.extend(deps);
            wrapped.extend(new_cmd);
            new_cmd = wrapped;
        }

        // Register all host-bound ports.
        if cfg.get("register").and_then(Value::as_bool).unwrap_or(false) {
            let mut regs = Vec::new();
            for (port_name, assignment) in ports {
                let Some(host_port) = assignment.host.port else {
                    continue;
                };
                // deploy:service:port, or deploy:service for the default
                // port (the empty name).
                let mut register_as = format!("{deploy_id}:{service_name}");
                if !port_name.is_empty() {
                    register_as.push(':');
                    register_as.push_str(port_name);
                }
                regs.push("-s".to_string());
                regs.push(format!("{register_as}:{host_port}"));
            }
            let mut wrapped = vec![binary.clone(), "exec".to_string()];
            wrapped.extend(regs);
            wrapped.extend(new_cmd);
            new_cmd = wrapped;
        }

        // Replace both cmd and any existing entrypoint.
        if new_cmd != current {
            runcfg.entrypoint = vec![new_cmd[0].clone()];
            runcfg.cmd = new_cmd[1..].to_vec();
        }
        Ok(Outcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestController;
    use serde_json::json;
    use std::sync::Arc;

    async fn deploy(def: serde_json::Value) -> (tempfile::TempDir, TestController) {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![Arc::new(SdutilPlugin)], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf.set_service("foo", "web", &def, false).await.unwrap();
        (dir, tc)
    }

    #[tokio::test]
    async fn register_wraps_the_command() {
        let (_dir, tc) = deploy(json!({
            "image": "web",
            "entrypoint": ["/bin/web"],
            "cmd": ["serve"],
            "sdutil": {"register": true},
        }))
        .await;

        let runcfg = tc.backend.last_runcfg().unwrap();
        assert_eq!(runcfg.entrypoint, vec!["/sdutil".to_string()]);
        assert_eq!(runcfg.cmd[0], "exec");
        assert_eq!(runcfg.cmd[1], "-s");
        let host_port = runcfg.cmd[2].rsplit(':').next().unwrap();
        assert_eq!(runcfg.cmd[2], format!("foo:web:{host_port}"));
        // The original entrypoint+cmd follow the wrapper.
        assert_eq!(
            &runcfg.cmd[3..],
            &["/bin/web".to_string(), "serve".to_string()]
        );
    }

    #[tokio::test]
    async fn expose_declares_dependencies() {
        let (_dir, tc) = deploy(json!({
            "image": "web",
            "cmd": ["serve"],
            "sdutil": {"expose": {"db": "DATABASE_ADDR"}},
        }))
        .await;

        let runcfg = tc.backend.last_runcfg().unwrap();
        assert_eq!(runcfg.entrypoint, vec!["/sdutil".to_string()]);
        assert_eq!(
            &runcfg.cmd[..3],
            &[
                "expose".to_string(),
                "-d".to_string(),
                "DATABASE_ADDR:foo:db".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn custom_binary_path() {
        let (_dir, tc) = deploy(json!({
            "image": "web",
            "cmd": ["serve"],
            "sdutil": {"register": true, "binary": "sdutil"},
        }))
        .await;
        let runcfg = tc.backend.last_runcfg().unwrap();
        assert_eq!(runcfg.entrypoint, vec!["sdutil".to_string()]);
    }

    #[tokio::test]
    async fn untouched_without_config() {
        let (_dir, tc) = deploy(json!({"image": "web", "cmd": ["serve"]})).await;
        let runcfg = tc.backend.last_runcfg().unwrap();
        assert!(runcfg.entrypoint.is_empty());
        assert_eq!(runcfg.cmd, vec!["serve".to_string()]);
    }
}
