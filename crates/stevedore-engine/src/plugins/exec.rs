//! Run-once resources via an `Exec` globals section:
//!
//! ```yaml
//! Exec:
//!     InitAssets:
//!         service: forum
//!         cmd: push-assets
//!
//! forum:
//!     require: InitAssets
//! ```
//!
//! The controller runs a one-shot container of the `forum` service with the
//! given command; the resource is declared available when the job exits 0.
//! Combined with `require`, the actual service is held back until then.

use async_trait::async_trait;
use serde_json::{Value, json};

use stevedore_core::{Error, Result, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};

pub struct ExecPlugin;

impl ExecPlugin {
    /// Executes any outstanding `Exec` entries that are ready.
    async fn execute_runs(&self, cintf: &mut ControllerInterface, deploy_id: &str) -> Result<()> {
        let entries: Vec<(String, Value)> = {
            let deployment = cintf.state().deployment(deploy_id)?;
            match deployment.globals.get("Exec").and_then(Value::as_object) {
                None => return Ok(()),
                Some(section) => section
                    .iter()
                    .map(|(name, options)| (name.clone(), options.clone()))
                    .collect(),
            }
        };

        for (name, options) in entries {
            {
                let deployment = cintf.state().deployment(deploy_id)?;
                if deployment.resource(&name).is_some() {
                    // Already provided.
                    continue;
                }
                // The run resource has dependencies of its own; wait for
                // its service to at least be known (held is fine).
                if let Some(service) = options.get("service").and_then(Value::as_str)
                    && !deployment.has_service(service, true)
                {
                    continue;
                }
            }
            if cintf
                .run_setup_resource(deploy_id, &name, &options)
                .await?
                .claimed()
            {
                continue;
            }

            let service_name = options
                .get("service")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::invalid_input(format!("Exec entry {name} is missing a service"))
                })?
                .to_string();
            let cmd = options
                .get("cmd")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::invalid_input(format!("Exec entry {name} is missing a cmd"))
                })?
                .to_string();

            cintf
                .ctx()
                .clone()
                .job(format!("Executing \"{cmd}\" of service {service_name}"))
                .await;
            self.run_once(cintf, deploy_id, &service_name, &cmd).await?;
            cintf.set_resource(deploy_id, &name, json!(true)).await?;
        }
        Ok(())
    }

    async fn run_once(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        cmd: &str,
    ) -> Result<()> {
        let version: ServiceVersion = {
            let service = cintf.state().deployment(deploy_id)?.service(service_name)?;
            service
                .held_version()
                .or_else(|| service.latest())
                .cloned()
                .ok_or_else(|| {
                    Error::deploy(format!("service {service_name} has no version to run"))
                })?
        };

        let (mut runcfg, definition, assignments) = cintf
            .generate_runcfg(deploy_id, service_name, &version)
            .await?;
        runcfg.cmd = vec![cmd.to_string()];

        cintf
            .run_before_once(deploy_id, service_name, &definition, &mut runcfg)
            .await?;
        let exit = cintf.backend().once(&runcfg).await?;
        // One-shot jobs give their port reservations right back.
        cintf.release_ports(&assignments);
        if exit != 0 {
            return Err(Error::deploy(format!(
                "run job returned exit code {exit}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for ExecPlugin {
    fn name(&self) -> &'static str {
        "exec"
    }

    async fn on_globals_changed(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
    ) -> Result<Outcome> {
        self.execute_runs(cintf, deploy_id).await?;
        Ok(Outcome::Pass)
    }

    async fn post_setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        _service_name: &str,
        _version: &ServiceVersion,
    ) -> Result<Outcome> {
        self.execute_runs(cintf, deploy_id).await?;
        Ok(Outcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::requires::RequiresPlugin;
    use crate::testing::TestController;
    use serde_json::json;
    use std::sync::Arc;

    fn controller(dir: &std::path::Path) -> TestController {
        TestController::new(
            vec![Arc::new(ExecPlugin), Arc::new(RequiresPlugin)],
            dir,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exec_runs_once_and_sets_the_resource() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_globals(
                "foo",
                json!({"Exec": {"InitAssets": {"service": "forum", "cmd": "push-assets"}}}),
            )
            .await
            .unwrap();

        // The forum service is held on the exec resource; deploying it
        // triggers the run, which in turn releases the hold.
        cintf
            .set_service(
                "foo",
                "forum",
                &json!({"image": "forum", "require": "InitAssets"}),
                false,
            )
            .await
            .unwrap();

        let once = tc.backend.once_runs();
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].cmd, vec!["push-assets".to_string()]);

        let deployment = cintf.state().deployment("foo").unwrap();
        assert_eq!(deployment.resource("InitAssets"), Some(&json!(true)));
        assert!(!deployment.service("forum").unwrap().is_held());
        assert_eq!(tc.backend.starts(), 1);
    }

    #[tokio::test]
    async fn exec_does_not_run_twice() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_globals(
                "foo",
                json!({"Exec": {"Init": {"service": "web", "cmd": "init"}}}),
            )
            .await
            .unwrap();
        cintf
            .set_service("foo", "web", &json!({"image": "web"}), false)
            .await
            .unwrap();
        assert_eq!(tc.backend.once_runs().len(), 1);

        // Another deploy round does not re-run the job.
        cintf
            .set_service("foo", "web", &json!({"image": "web", "env": {"A": "1"}}), false)
            .await
            .unwrap();
        assert_eq!(tc.backend.once_runs().len(), 1);
    }

    #[tokio::test]
    async fn failing_job_aborts_the_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        tc.backend.set_once_exit(3);
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_globals(
                "foo",
                json!({"Exec": {"Init": {"service": "web", "cmd": "init"}}}),
            )
            .await
            .unwrap();

        let err = cintf
            .set_service("foo", "web", &json!({"image": "web"}), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }
}
