//! Deploying new application versions via git push.
//!
//! Instead of requiring the client to upload a tarball, a `gitreceive` SSH
//! daemon runs as part of the `system` deployment; pushes land there, the
//! daemon calls back into the controller with the archived tree and the
//! commit id, and the regular app build pipeline takes over.
//!
//! The daemon needs routing to be reachable from the outside: either a TCP
//! proxy registered through the `Domains` section, or a direct host binding
//! via the `wan_port` config value.
//!
//! Plugin API functions: `push-data` (the daemon delivers a tarball),
//! `check-key` / `check-repo` (authorization callbacks), `add-key`,
//! `set-config` and `setup`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use stevedore_core::{Error, Result, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin, PluginApiRequest, UploadedFiles};

const GITRECEIVE_IMAGE: &str = "elsdoerfer/gitreceive";

/// Persistent daemon configuration, stored process-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitReceiveConfig {
    /// Authorized public keys, as `<type> <key> [<comment>]` lines.
    #[serde(default)]
    pub auth_keys: Vec<String>,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Optional `ip:port` host binding for the SSH port.
    #[serde(default)]
    pub wan_port: Option<String>,
    /// Private host key handed to the daemon. Set via `set-config`; the
    /// daemon generates its own when left empty.
    #[serde(default)]
    pub host_key: String,
}

fn default_hostname() -> String {
    "deployhost".to_string()
}

impl Default for GitReceiveConfig {
    fn default() -> Self {
        GitReceiveConfig {
            auth_keys: Vec::new(),
            hostname: default_hostname(),
            wan_port: None,
            host_key: String::new(),
        }
    }
}

impl GitReceiveConfig {
    pub fn load(cintf: &ControllerInterface) -> Self {
        cintf
            .state()
            .plugin_data
            .get("gitreceive")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, cintf: &mut ControllerInterface) -> Result<()> {
        let value = serde_json::to_value(self)?;
        cintf
            .state_mut()
            .plugin_data
            .insert("gitreceive".to_string(), value);
        Ok(())
    }
}

/// Splits a public key line into `(type, key, comment)`.
fn parse_public_key(keydata: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = keydata.split_whitespace().collect();
    match parts.as_slice() {
        [kind, key] => Ok((kind.to_string(), key.to_string(), String::new())),
        [kind, key, comment] => Ok((kind.to_string(), key.to_string(), comment.to_string())),
        _ => Err(Error::invalid_input("not a valid SSH public key")),
    }
}

pub struct GitReceivePlugin;

impl GitReceivePlugin {
    /// Installs (or refreshes) the gitreceive service in the `system`
    /// deployment.
    async fn setup_gitreceive(&self, cintf: &mut ControllerInterface) -> Result<()> {
        let config = GitReceiveConfig::load(cintf);
        if config.host_key.is_empty() {
            warn!("gitreceive has no host key configured; set one via set-config");
        }
        let auth_key = cintf.auth_key().unwrap_or_default().to_string();

        let mut definition = json!({
            "image": GITRECEIVE_IMAGE,
            "volumes": {"cache": "/srv/repos"},
            "env": {
                "SSH_PRIVATE_KEYS": config.host_key,
                "CONTROLLER_AUTH_KEY": auth_key,
            },
            "sdutil": {"register": true},
        });
        if let Some(wan_port) = &config.wan_port {
            definition["wan_map"] = json!({ (wan_port.clone()): "" });
        }
        cintf
            .set_service("system", "gitreceive", &definition, true)
            .await
    }

    fn repo_url(&self, config: &GitReceiveConfig, deploy_id: &str, service_name: &str) -> String {
        format!("git@{}:{deploy_id}/{service_name}", config.hostname)
    }
}

#[async_trait]
impl Plugin for GitReceivePlugin {
    fn name(&self) -> &'static str {
        "gitreceive"
    }

    /// Takes over from the app plugin's upload request: make sure the
    /// daemon runs and tell the client where to push instead.
    async fn needs_app_code(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &ServiceVersion,
    ) -> Result<Outcome> {
        if version.definition.kwarg("git").is_none() {
            return Ok(Outcome::Pass);
        }

        if !cintf
            .state()
            .deployment("system")
            .map(|system| system.has_service("gitreceive", true))
            .unwrap_or(false)
        {
            self.setup_gitreceive(cintf).await?;
        }

        let config = GitReceiveConfig::load(cintf);
        let mut fields = Map::new();
        fields.insert("gitreceive".to_string(), json!(service_name));
        fields.insert(
            "url".to_string(),
            json!(self.repo_url(&config, deploy_id, service_name)),
        );
        cintf.ctx().clone().custom(fields).await;
        Ok(Outcome::Claimed)
    }

    async fn api_request(
        &self,
        cintf: &mut ControllerInterface,
        func: &str,
        request: &PluginApiRequest,
    ) -> Result<Option<Value>> {
        match func {
            // The daemon delivers a pushed tree as a tarball.
            "push-data" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_input("missing repository name"))?;
                let (deploy_id, service_name) = name
                    .split_once('/')
                    .ok_or_else(|| Error::invalid_input("repository name is not deploy/service"))?;
                let version = request
                    .params
                    .get("version")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_input("missing version"))?;
                let tarball = request
                    .files
                    .get("tarball")
                    .ok_or_else(|| Error::invalid_input("missing tarball"))?;

                let files = UploadedFiles::from([("app".to_string(), tarball.clone())]);
                cintf
                    .provide_data(
                        deploy_id,
                        service_name,
                        &files,
                        &json!({"app": {"version": version}}),
                    )
                    .await?;
                Ok(Some(Value::Null))
            }

            // Authorization callbacks from the daemon.
            "check-key" => {
                let key = request
                    .params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_input("missing key"))?;
                let (kind, key, _) = parse_public_key(key)?;
                let config = GitReceiveConfig::load(cintf);
                let authorized = config.auth_keys.iter().any(|stored| {
                    parse_public_key(stored)
                        .map(|(skind, skey, _)| skind == kind && skey == key)
                        .unwrap_or(false)
                });
                Ok(Some(
                    json!({"result": if authorized { "ok" } else { "unauthorized" }}),
                ))
            }
            "check-repo" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let known = name.split_once('/').is_some_and(|(deploy_id, service)| {
                    cintf
                        .state()
                        .deployment(deploy_id)
                        .map(|d| d.services.contains_key(service))
                        .unwrap_or(false)
                });
                Ok(Some(
                    json!({"result": if known { "ok" } else { "unauthorized" }}),
                ))
            }

            "add-key" => {
                let keydata = request
                    .params
                    .get("keydata")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_input("missing keydata"))?;
                parse_public_key(keydata)?;
                let mut config = GitReceiveConfig::load(cintf);
                config.auth_keys.push(keydata.trim().to_string());
                config.save(cintf)?;
                Ok(Some(json!({"job": "Authorized key for gitreceive use"})))
            }
            "set-config" => {
                let mut config = GitReceiveConfig::load(cintf);
                if let Some(hostname) = request.params.get("hostname").and_then(Value::as_str) {
                    config.hostname = hostname.to_string();
                }
                if let Some(wan_port) = request.params.get("wan_port").and_then(Value::as_str) {
                    config.wan_port = Some(wan_port.to_string());
                }
                if let Some(host_key) = request.params.get("host_key").and_then(Value::as_str) {
                    config.host_key = host_key.to_string();
                }
                config.save(cintf)?;
                Ok(Some(
                    json!({"job": "Updated configuration, manual restart required"}),
                ))
            }
            "setup" => {
                self.setup_gitreceive(cintf).await?;
                Ok(Some(Value::Null))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::app::AppPlugin;
    use crate::testing::TestController;
    use stevedore_core::Event;
    use std::sync::Arc;

    fn controller(dir: &std::path::Path) -> TestController {
        TestController::new(
            vec![Arc::new(AppPlugin), Arc::new(GitReceivePlugin)],
            dir,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn git_service_announces_a_push_url() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let (ctx, mut rx) = stevedore_core::Context::channel(64);
        let mut cintf = tc.interface_with(ctx).unwrap();
        cintf.create_deployment("system", false).await.unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "git": "."}), false)
            .await
            .unwrap();

        // The gitreceive service was installed into the system deployment.
        assert!(
            cintf
                .state()
                .deployment("system")
                .unwrap()
                .services
                .contains_key("gitreceive")
        );

        // And the stream carries the push url instead of a data request.
        drop(cintf);
        let mut saw_url = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::Custom(fields) = &event {
                assert!(fields.get("data-request").is_none());
                if let Some(url) = fields.get("url").and_then(Value::as_str) {
                    assert_eq!(url, "git@deployhost:foo/bar");
                    saw_url = true;
                }
            }
        }
        assert!(saw_url);
    }

    #[tokio::test]
    async fn key_management_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let mut cintf = tc.interface().unwrap();

        let request = PluginApiRequest {
            params: json!({"keydata": "ssh-ed25519 AAAAC3Nz laptop"}),
            files: UploadedFiles::new(),
        };
        cintf
            .run_api("gitreceive", "add-key", &request)
            .await
            .unwrap();

        let check = PluginApiRequest {
            params: json!({"key": "ssh-ed25519 AAAAC3Nz elsewhere"}),
            files: UploadedFiles::new(),
        };
        let response = cintf
            .run_api("gitreceive", "check-key", &check)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["result"], "ok");

        let unknown = PluginApiRequest {
            params: json!({"key": "ssh-ed25519 OTHER nope"}),
            files: UploadedFiles::new(),
        };
        let response = cintf
            .run_api("gitreceive", "check-key", &unknown)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["result"], "unauthorized");
    }

    #[tokio::test]
    async fn push_data_feeds_the_app_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let tc = controller(dir.path());
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("system", false).await.unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_service("foo", "bar", &json!({"image": "bar", "git": "."}), false)
            .await
            .unwrap();

        let tarball = dir.path().join("push.tar");
        std::fs::write(&tarball, b"tree").unwrap();
        let request = PluginApiRequest {
            params: json!({"name": "foo/bar", "version": "abc123"}),
            files: UploadedFiles::from([("tarball".to_string(), tarball)]),
        };
        cintf
            .run_api("gitreceive", "push-data", &request)
            .await
            .unwrap();

        let service = cintf.state().deployment("foo").unwrap().service("bar").unwrap();
        assert!(!service.is_held());
        assert_eq!(
            service.versions()[0].data.get("app_version_id"),
            Some(&json!("abc123"))
        );
    }
}
