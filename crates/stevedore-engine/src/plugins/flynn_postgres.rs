//! Database provisioning with the flynn-postgres appliance.
//!
//! Containers interact only through service discovery, so start order does
//! not matter. Initializing a database resource is the exception that needs
//! an ordered step: the postgres API service must be up before a database
//! with credentials can be created for the other containers.
//!
//! Configured through a `Flynn-Postgres` globals section:
//!
//! ```yaml
//! Flynn-Postgres:
//!     in: pg-api
//!     expose_as: POSTGRES_
//! ```
//!
//! `in` names the flynn-postgres API service of the deployment; once that
//! service has been set up, a database is created through its HTTP API and
//! the credentials are exposed to every container of the deployment as
//! `<PREFIX>USER`, `<PREFIX>PASSWORD` and `<PREFIX>DATABASE`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};

use stevedore_core::{Definition, Error, Result, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};

const PROVISION_BUDGET: Duration = Duration::from_secs(40);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PREFIX: &str = "PG_";

pub struct FlynnPostgresPlugin {
    client: reqwest::Client,
}

impl FlynnPostgresPlugin {
    pub fn new() -> Self {
        FlynnPostgresPlugin {
            client: reqwest::Client::new(),
        }
    }

    /// Polls the API service until a database was created, within the
    /// provisioning budget.
    async fn create_database(
        &self,
        cintf: &mut ControllerInterface,
        api_service: &str,
    ) -> Result<Value> {
        let start = Instant::now();
        loop {
            let address = match cintf.discovery().discover(api_service).await {
                Ok(address) => address,
                Err(_) if start.elapsed() < PROVISION_BUDGET => {
                    sleep(POLL_INTERVAL).await;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let response = self
                .client
                .post(format!("http://{address}/databases"))
                .send()
                .await;
            match response {
                Ok(response) => {
                    let created: Value = response.json().await.map_err(|err| {
                        Error::deploy(format!("flynn-postgres returned bad data: {err}"))
                    })?;
                    return Ok(created);
                }
                Err(_) if start.elapsed() < PROVISION_BUDGET => {
                    sleep(POLL_INTERVAL).await;
                }
                Err(err) => {
                    return Err(Error::deploy(format!(
                        "cannot reach flynn-postgres API {api_service}: {err}"
                    )));
                }
            }
        }
    }
}

impl Default for FlynnPostgresPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for FlynnPostgresPlugin {
    fn name(&self) -> &'static str {
        "flynn-postgres"
    }

    async fn provide_environment(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        _definition: &Definition,
        env: &mut BTreeMap<String, String>,
    ) -> Result<Outcome> {
        let deployment = cintf.state().deployment(deploy_id)?;
        let Some(data) = deployment.data.get("flynn-postgres") else {
            return Ok(Outcome::Pass);
        };
        let Some(db) = data.get("db").and_then(Value::as_object) else {
            return Ok(Outcome::Pass);
        };
        let prefix = data
            .get("expose_as")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PREFIX);
        for (suffix, field) in [("USER", "user"), ("PASSWORD", "password"), ("DATABASE", "dbname")]
        {
            if let Some(value) = db.get(field).and_then(Value::as_str) {
                env.insert(format!("{prefix}{suffix}"), value.to_string());
            }
        }
        Ok(Outcome::Pass)
    }

    async fn post_setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        _version: &ServiceVersion,
    ) -> Result<Outcome> {
        let (api_service, prefix) = {
            let deployment = cintf.state().deployment(deploy_id)?;
            let Some(cfg) = deployment
                .globals
                .get("Flynn-Postgres")
                .and_then(Value::as_object)
            else {
                return Ok(Outcome::Pass);
            };
            let Some(api_service) = cfg.get("in").and_then(Value::as_str) else {
                return Ok(Outcome::Pass);
            };
            // Only the API service itself triggers provisioning, and only
            // once per deployment.
            if service_name != api_service {
                return Ok(Outcome::Pass);
            }
            if deployment
                .data
                .get("flynn-postgres")
                .and_then(|d| d.get("db"))
                .is_some()
            {
                return Ok(Outcome::Pass);
            }
            let prefix = cfg
                .get("expose_as")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PREFIX)
                .to_string();
            (api_service.to_string(), prefix)
        };

        cintf.ctx().clone().job("Provisioning database").await;
        let created = self.create_database(cintf, &api_service).await?;
        let env = &created["env"];
        let record = json!({
            "expose_as": prefix,
            "db": {
                "dbname": env.get("PGDATABASE").cloned().unwrap_or(Value::Null),
                "user": env.get("PGUSER").cloned().unwrap_or(Value::Null),
                "password": env.get("PGPASSWORD").cloned().unwrap_or(Value::Null),
            },
        });
        cintf
            .state_mut()
            .deployment_mut(deploy_id)?
            .data
            .insert("flynn-postgres".to_string(), record);
        Ok(Outcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestController;
    use std::sync::Arc;

    #[tokio::test]
    async fn credentials_are_exposed_to_all_services() {
        let dir = tempfile::tempdir().unwrap();
        let tc =
            TestController::new(vec![Arc::new(FlynnPostgresPlugin::new())], dir.path()).unwrap();
        let mut cintf = tc.interface().unwrap();
        cintf.create_deployment("foo", true).await.unwrap();

        // Pretend provisioning already happened.
        cintf
            .state_mut()
            .deployment_mut("foo")
            .unwrap()
            .data
            .insert(
                "flynn-postgres".to_string(),
                json!({
                    "expose_as": "POSTGRES_",
                    "db": {"dbname": "db1", "user": "u1", "password": "s3cret"},
                }),
            );

        cintf
            .set_service("foo", "web", &json!({"image": "web"}), false)
            .await
            .unwrap();

        let runcfg = tc.backend.last_runcfg().unwrap();
        assert_eq!(runcfg.env.get("POSTGRES_USER").unwrap(), "u1");
        assert_eq!(runcfg.env.get("POSTGRES_PASSWORD").unwrap(), "s3cret");
        assert_eq!(runcfg.env.get("POSTGRES_DATABASE").unwrap(), "db1");
    }
}
