//! Runs 12-factor style applications from source.
//!
//! A service with a `git` key is deployed from pushed/uploaded code rather
//! than a prebuilt image. Until code for a version exists the service is
//! held; an upload releases the hold: the tarball is fed to the slugbuilder
//! image, the resulting slug is stored on the `shelf` file service, and the
//! service is rewritten to run the slug via the slugrunner image.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use stevedore_core::{Definition, Error, Result, RunConfig, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin, UploadedFiles};

const RUNNER_IMAGE: &str = "flynn/slugrunner";

pub struct AppPlugin;

impl AppPlugin {
    async fn slug_url(
        &self,
        cintf: &ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<String> {
        let shelf = cintf.discovery().discover("shelf").await?;
        let build_id = version
            .data
            .get("app_version_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::deploy("no application build attached to this version"))?
            .to_string();
        Ok(format!(
            "http://{shelf}/slugs/{deploy_id}/{service_name}:{build_id}"
        ))
    }

    /// Environment the runner and builder images expect.
    async fn build_env(
        &self,
        cintf: &ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert("APP_ID".to_string(), deploy_id.to_string());
        env.insert(
            "SLUG_URL".to_string(),
            self.slug_url(cintf, deploy_id, service_name, version).await?,
        );
        env.extend(version.definition.env.clone());
        Ok(env)
    }

    /// Builds the uploaded tarball into a slug with the builder image.
    async fn build(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
        tarball: &Path,
    ) -> Result<()> {
        let ctx = cintf.ctx().clone();
        ctx.job(format!("{service_name} - building application")).await;

        let slug_url = self.slug_url(cintf, deploy_id, service_name, version).await?;
        // A per-service cache speeds up repeat builds considerably.
        let cache = cintf.cache_dir(&["slugbuilder", deploy_id, service_name])?;

        let runcfg = RunConfig {
            image: cintf.settings().slugbuilder_image.clone(),
            cmd: vec![slug_url],
            env: self.build_env(cintf, deploy_id, service_name, version).await?,
            volumes: BTreeMap::from([(
                cache.to_string_lossy().into_owned(),
                "/tmp/cache".to_string(),
            )]),
            stdin: Some(tarball.to_path_buf()),
            ..RunConfig::default()
        };
        let exit = cintf.backend().once(&runcfg).await?;
        if exit != 0 {
            return Err(Error::deploy(format!(
                "slug build returned exit code {exit}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for AppPlugin {
    fn name(&self) -> &'static str {
        "app"
    }

    async fn setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &mut ServiceVersion,
    ) -> Result<Outcome> {
        if version.definition.kwarg("git").is_none() {
            return Ok(Outcome::Pass);
        }
        if version.data.contains_key("app_version_id") {
            // Code exists; deploy like any other container (after
            // rewrite_service swaps in the runner image).
            return Ok(Outcome::Pass);
        }

        // No code has been provided yet: hold the service. Unless another
        // plugin arranges for the code (e.g. a git push endpoint), ask the
        // client to upload it.
        cintf.hold_service(
            deploy_id,
            service_name,
            "app code not available",
            version.clone(),
        )?;
        if !cintf
            .run_needs_app_code(deploy_id, service_name, version)
            .await?
            .claimed()
        {
            let mut fields = Map::new();
            fields.insert("data-request".to_string(), json!(service_name));
            fields.insert("tag".to_string(), json!("git"));
            cintf.ctx().clone().custom(fields).await;
        }
        Ok(Outcome::Claimed)
    }

    async fn on_data_provided(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        files: &UploadedFiles,
        info: &Value,
    ) -> Result<Outcome> {
        let Some(tarball) = files.get("app") else {
            return Ok(Outcome::Pass);
        };
        let build_id = info
            .get("app")
            .and_then(|app| app.get("version"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_input("upload info is missing app.version"))?
            .to_string();

        // Use the held version, or derive a fresh one from the latest.
        let mut version = {
            let deployment = cintf.state().deployment(deploy_id)?;
            let globals = deployment.globals.clone();
            let service = deployment.service(service_name)?;
            match service.held_version() {
                Some(version) => version.clone(),
                None => service.derive_current(globals).ok_or_else(|| {
                    Error::deploy(format!("service {service_name} has no version to rebuild"))
                })?,
            }
        };
        version
            .data
            .insert("app_version_id".to_string(), json!(build_id));

        self.build(cintf, deploy_id, service_name, &version, tarball)
            .await?;

        // Run this new version.
        cintf.setup_version(deploy_id, service_name, version).await?;
        Ok(Outcome::Claimed)
    }

    async fn rewrite_service(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
        definition: &mut Definition,
    ) -> Result<Outcome> {
        if version.definition.kwarg("git").is_none() {
            return Ok(Outcome::Pass);
        }

        // Convert the service to run as a slugrunner.
        let env = self
            .build_env(cintf, deploy_id, service_name, version)
            .await?;
        definition.env.extend(env);
        definition.image = RUNNER_IMAGE.to_string();
        definition.entrypoint = vec!["/runner/init".to_string()];
        let mut cmd = vec!["start".to_string()];
        cmd.append(&mut definition.cmd);
        definition.cmd = cmd;

        // Tell the sdutil wrapper where to find the binary in this image.
        let sdutil = definition
            .kwargs
            .entry("sdutil".to_string())
            .or_insert_with(|| json!({}));
        if let Some(cfg) = sdutil.as_object_mut() {
            cfg.insert("binary".to_string(), json!("sdutil"));
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

    fn controller(dir: &std::path::Path) -> TestController {
        TestController::new(vec![Arc::new(AppPlugin)], dir).unwrap()
    }

    fn upload(dir: &std::path::Path) -> UploadedFiles {
        let tarball = dir.join("app.tar");
        std::fs::write(&tarball, b"tar bytes").unwrap();
        UploadedFiles::from([("app".to_string(), tarball)])
    }

    #[tokio::test]
    async fn git_service_is_held_until_code_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "git": "."}), false)
            .await
            .unwrap();

        let service = cintf.state().deployment("foo").unwrap().service("bar").unwrap();
        assert!(service.is_held());
        assert_eq!(service.hold_reason(), Some("app code not available"));
        assert_eq!(tc.backend.starts(), 0);
    }

    #[tokio::test]
    async fn upload_builds_and_releases_the_hold() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "git": "."}), false)
            .await
            .unwrap();

        cintf
            .provide_data(
                "foo",
                "bar",
                &upload(dir.path()),
                &json!({"app": {"version": "v1"}}),
            )
            .await
            .unwrap();

        // The builder ran once, against the slugbuilder image.
        let builds = tc.backend.once_runs();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].image, "flynn/slugbuilder");
        assert!(builds[0].stdin.is_some());

        let service = cintf.state().deployment("foo").unwrap().service("bar").unwrap();
        assert!(!service.is_held());
        assert_eq!(service.versions().len(), 1);
        assert_eq!(
            service.versions()[0].data.get("app_version_id"),
            Some(&json!("v1"))
        );
        assert_eq!(service.instances.len(), 1);

        // The container itself runs as a slug.
        let runcfg = tc.backend.last_runcfg().unwrap();
        assert_eq!(runcfg.image, "flynn/slugrunner");
        assert_eq!(runcfg.entrypoint, vec!["/runner/init".to_string()]);
        assert_eq!(runcfg.cmd[0], "start");
        assert!(runcfg.env.get("SLUG_URL").unwrap().contains("foo/bar:v1"));
    }

    #[tokio::test]
    async fn failed_build_aborts_the_release() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        tc.backend.set_once_exit(1);
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "git": "."}), false)
            .await
            .unwrap();

        let err = cintf
            .provide_data(
                "foo",
                "bar",
                &upload(dir.path()),
                &json!({"app": {"version": "v1"}}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 1"));
        assert!(cintf.state().deployment("foo").unwrap().service("bar").unwrap().is_held());
    }
}
