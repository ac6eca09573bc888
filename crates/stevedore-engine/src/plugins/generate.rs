//! Generated secrets via a `Generate` globals section:
//!
//! ```yaml
//! Generate:
//!     DatabasePassword:
//!         hex: 15
//! ```
//!
//! Generated values become template variables, usable anywhere `{NAME}`
//! substitution applies:
//!
//! ```yaml
//! Env:
//!     web:
//!         POSTGRES_PASSWORD: "{DatabasePassword}"
//! ```
//!
//! Each value is generated once and stored with the deployment, so repeat
//! deploys see the same secret.

use async_trait::async_trait;
use serde_json::{Value, json};

use stevedore_core::{Definition, Result, ServiceVersion, token};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};

const DEFAULT_BYTES: u64 = 32;

pub struct GeneratePlugin;

#[async_trait]
impl Plugin for GeneratePlugin {
    fn name(&self) -> &'static str {
        "generate"
    }

    async fn on_globals_changed(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
    ) -> Result<Outcome> {
        let requested: Vec<(String, u64)> = {
            let deployment = cintf.state().deployment(deploy_id)?;
            match deployment.globals.get("Generate").and_then(Value::as_object) {
                None => return Ok(Outcome::Pass),
                Some(section) => section
                    .iter()
                    .map(|(key, options)| {
                        let bytes = options
                            .get("hex")
                            .and_then(Value::as_u64)
                            .unwrap_or(DEFAULT_BYTES);
                        (key.clone(), bytes)
                    })
                    .collect(),
            }
        };

        let deployment = cintf.state_mut().deployment_mut(deploy_id)?;
        let store = deployment
            .data
            .entry("generate".to_string())
            .or_insert_with(|| json!({}));
        if let Some(values) = store.as_object_mut() {
            for (key, bytes) in requested {
                if values.contains_key(&key) {
                    // Has already been generated.
                    continue;
                }
                values.insert(key, json!(token::random_hex(bytes as usize)));
            }
        }
        Ok(Outcome::Pass)
    }

    async fn provide_vars(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        _service_name: &str,
        _version: &ServiceVersion,
        _definition: &Definition,
        vars: &mut std::collections::BTreeMap<String, String>,
    ) -> Result<Outcome> {
        let deployment = cintf.state().deployment(deploy_id)?;
        if let Some(values) = deployment.data.get("generate").and_then(Value::as_object) {
            for (key, value) in values {
                if let Some(s) = value.as_str() {
                    vars.insert(key.clone(), s.to_string());
                }
            }
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

    #[tokio::test]
    async fn generated_value_is_stable_across_deploys() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![Arc::new(GeneratePlugin)], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_globals("foo", json!({"Generate": {"Foo": {"hex": 32}}}))
            .await
            .unwrap();

        let def = json!({"image": "bar", "env": {"a": "{Foo}"}});
        cintf.set_service("foo", "bar", &def, false).await.unwrap();

        let first = tc.backend.last_runcfg().unwrap().env["a"].clone();
        assert_eq!(first.len(), 64);

        // Deploy again (forced, definition unchanged): same secret.
        cintf.set_service("foo", "bar", &def, true).await.unwrap();
        let second = tc.backend.last_runcfg().unwrap().env["a"].clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn hex_length_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TestController::new(vec![Arc::new(GeneratePlugin)], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();
        cintf
            .set_globals("foo", json!({"Generate": {"Short": {"hex": 15}}}))
            .await
            .unwrap();

        let values = cintf
            .state()
            .deployment("foo")
            .unwrap()
            .data
            .get("generate")
            .unwrap()
            .clone();
        assert_eq!(values["Short"].as_str().unwrap().len(), 30);
    }
}
