//! HTTP route registration from a `Domains` globals section:
//!
//! ```yaml
//! Domains:
//!     example.org:
//!         http: web
//!         cert: certs/example.org.pem
//!         key: example.org.key
//! ```
//!
//! Domain-to-service mappings are pushed to the strowger router, discovered
//! as `strowger-api`. Certificate and key contents are resolved client-side
//! before the template reaches the controller.

use async_trait::async_trait;
use serde_json::{Value, json};

use stevedore_core::{Error, Result};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};

pub struct RouterPlugin {
    client: reqwest::Client,
}

impl RouterPlugin {
    pub fn new() -> Self {
        RouterPlugin {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RouterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn api_url(address: &str) -> String {
    let address = if let Some(port) = address.strip_prefix(':') {
        format!("localhost:{port}")
    } else {
        address.to_string()
    };
    if address.starts_with("http://") || address.starts_with("https://") {
        address
    } else {
        format!("http://{address}")
    }
}

#[async_trait]
impl Plugin for RouterPlugin {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn on_globals_changed(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
    ) -> Result<Outcome> {
        let domains: Vec<(String, Value)> = {
            let deployment = cintf.state().deployment(deploy_id)?;
            match deployment.globals.get("Domains").and_then(Value::as_object) {
                None => return Ok(Outcome::Pass),
                Some(section) => section
                    .iter()
                    .map(|(domain, data)| (domain.clone(), data.clone()))
                    .collect(),
            }
        };
        if domains.is_empty() {
            return Ok(Outcome::Pass);
        }

        let api = cintf.discovery().discover("strowger-api").await?;
        let base = api_url(&api);

        for (domain, data) in domains {
            let Some(service) = data.get("http").and_then(Value::as_str) else {
                continue;
            };
            let route = json!({
                "type": "http",
                "config": {
                    "Domain": domain,
                    "Service": service,
                    "TLSCert": data.get("cert").cloned().unwrap_or(Value::Null),
                    "TLSKey": data.get("key").cloned().unwrap_or(Value::Null),
                },
            });
            self.client
                .post(format!("{base}/routes"))
                .json(&route)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|err| {
                    Error::deploy(format!("route registration for {domain} failed: {err}"))
                })?;
            cintf
                .ctx()
                .clone()
                .log(format!("Routed {domain} to {service}"))
                .await;
        }
        Ok(Outcome::Pass)
    }
}
