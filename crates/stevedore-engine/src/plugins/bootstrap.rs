//! System-deployment bootstrap: etcd, discoverd, shelf and strowger.
//!
//! Service discovery itself runs in containers, so the very first start of
//! the controller installs the infrastructure services into the `system`
//! deployment, gating on the etcd and discoverd ports before dependent
//! services come up.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use stevedore_core::Result;

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};
use crate::plugins::wait::wait_for_port;

pub struct BootstrapPlugin;

fn etcd_definition(host_ip: &str) -> Value {
    json!({
        "image": "coreos/etcd",
        // etcdctl connects via the peer address, so it must be set even on
        // a single host.
        "cmd": "-name {HOST} -data-dir /data.etcd -bind-addr=0.0.0.0:{PORT} --peer-addr={HOST}:7001",
        "volumes": {"data": "/data.etcd"},
        "port": 4001,
        "wan_map": { (format!("{host_ip}:4001")): "" },
    })
}

fn discoverd_definition(host_ip: &str) -> Value {
    json!({
        "image": "flynn/discoverd",
        "cmd": "-etcd http://{HOST}:4001",
        "env": {"EXTERNAL_IP": "{HOST}"},
        "ports": {"rpc": 1111},
        "wan_map": { (format!("{host_ip}:1111")): "rpc" },
    })
}

fn shelf_definition() -> Value {
    json!({
        "image": "elsdoerfer/shelf",
        "cmd": "-s /var/lib/shelf",
        "volumes": {"data": "/var/lib/shelf"},
        "sdutil": {"register": true},
    })
}

fn strowger_definition() -> Value {
    json!({
        "image": "elsdoerfer/strowger",
        "cmd": "-httpaddr=\":{PORT_HTTP}\" --httpsaddr=\":{PORT_HTTPS}\" --apiaddr=\":{PORT_RPC}\"",
        "ports": ["http", "https", "rpc"],
        "wan_map": {"0.0.0.0:80": "http", "0.0.0.0:443": "https"},
    })
}

impl BootstrapPlugin {
    async fn install(
        &self,
        cintf: &mut ControllerInterface,
        name: &str,
        definition: Value,
        wait_port: Option<u16>,
    ) -> Result<()> {
        cintf.set_service("system", name, &definition, true).await?;
        if let Some(port) = wait_port {
            let addr = format!("{}:{port}", cintf.settings().host_ip);
            info!(service = name, %addr, "waiting for bootstrap service");
            if let Err(err) = wait_for_port(&addr).await {
                cintf
                    .ctx()
                    .clone()
                    .log(format!("{name} did not come up: {err}"))
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for BootstrapPlugin {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    async fn on_system_init(&self, cintf: &mut ControllerInterface) -> Result<Outcome> {
        let host_ip = cintf.settings().host_ip.clone();
        self.install(cintf, "etcd", etcd_definition(&host_ip), Some(4001))
            .await?;
        self.install(cintf, "discoverd", discoverd_definition(&host_ip), Some(1111))
            .await?;
        self.install(cintf, "shelf", shelf_definition(), None).await?;
        self.install(cintf, "strowger", strowger_definition(), None)
            .await?;
        Ok(Outcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::{PortSpec, canonicalize};

    #[test]
    fn definitions_canonicalize() {
        for def in [
            etcd_definition("10.0.0.1"),
            discoverd_definition("10.0.0.1"),
            shelf_definition(),
            strowger_definition(),
        ] {
            canonicalize("svc", &def).unwrap();
        }
    }

    #[test]
    fn discoverd_publishes_its_rpc_port() {
        let (_, def) = canonicalize("discoverd", &discoverd_definition("10.0.0.1")).unwrap();
        assert_eq!(def.ports.get("rpc"), Some(&PortSpec::Number(1111)));
        let binding = def.wan_map.keys().next().unwrap();
        assert_eq!(binding.to_string(), "10.0.0.1:1111");
    }
}
