//! Dependency holds via a `require` service key.
//!
//! A service naming requirements is held until each of them exists as an
//! unheld service or as a resource. This is not a replacement for service
//! discovery: it only orders the *initial* setup of a service and its
//! prerequisites (say, a "create database" step). Once services are part of
//! a deployment they start in arbitrary order.
//!
//! Registered last, so other plugins' `post_setup` hooks have processed a
//! service before holds depending on it are released.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use stevedore_core::{Definition, Result, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};

pub struct RequiresPlugin;

fn requirements(definition: &Definition) -> Vec<String> {
    match definition.kwarg("require") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

impl RequiresPlugin {
    /// Re-enters setup for every held service that was waiting for `ready`.
    async fn release_waiting(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        ready: &str,
    ) -> Result<()> {
        let waiting: Vec<(String, ServiceVersion)> = cintf
            .state()
            .deployment(deploy_id)?
            .services
            .values()
            .filter(|service| service.is_held())
            .filter_map(|service| {
                service
                    .held_version()
                    .map(|version| (service.name.clone(), version.clone()))
            })
            .filter(|(_, version)| {
                requirements(&version.definition).iter().any(|r| r == ready)
            })
            .collect();

        for (name, version) in waiting {
            debug!(service = %name, "dependency for held service now available");
            cintf.setup_version(deploy_id, &name, version).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for RequiresPlugin {
    fn name(&self) -> &'static str {
        "requires"
    }

    async fn setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        version: &mut ServiceVersion,
    ) -> Result<Outcome> {
        let requirements = requirements(&version.definition);
        if requirements.is_empty() {
            return Ok(Outcome::Pass);
        }

        let missing: Vec<String> = {
            let deployment = cintf.state().deployment(deploy_id)?;
            requirements
                .into_iter()
                .filter(|dep| {
                    deployment.resource(dep).is_none() && !deployment.has_service(dep, false)
                })
                .collect()
        };
        if missing.is_empty() {
            return Ok(Outcome::Pass);
        }

        cintf.hold_service(
            deploy_id,
            service_name,
            format!("waiting for requirement(s): {}", missing.join(", ")),
            version.clone(),
        )?;
        Ok(Outcome::Claimed)
    }

    async fn post_setup(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        service_name: &str,
        _version: &ServiceVersion,
    ) -> Result<Outcome> {
        self.release_waiting(cintf, deploy_id, service_name).await?;
        Ok(Outcome::Pass)
    }

    async fn on_resource_changed(
        &self,
        cintf: &mut ControllerInterface,
        deploy_id: &str,
        name: &str,
        _value: &Value,
    ) -> Result<Outcome> {
        self.release_waiting(cintf, deploy_id, name).await?;
        Ok(Outcome::Pass)
    }
}
