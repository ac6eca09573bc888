//! Waits for an address to accept connections before a service is set up.
//!
//! Only needed for the initial bootstrap, where etcd and discoverd must be
//! reachable before anything else can register; regular services should
//! rely on service discovery instead.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

use stevedore_core::{Error, Result, ServiceVersion};

use crate::interface::ControllerInterface;
use crate::plugin::{Outcome, Plugin};

const WAIT_BUDGET: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct WaitPlugin;

/// Polls `addr` until a TCP connect succeeds or the budget is spent.
pub async fn wait_for_port(addr: &str) -> Result<()> {
    let start = Instant::now();
    loop {
        match timeout(POLL_INTERVAL, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return Ok(()),
            _ => {
                if start.elapsed() >= WAIT_BUDGET {
                    return Err(Error::deploy(format!("cannot connect to {addr}")));
                }
                sleep(POLL_INTERVAL).await;
            }
        }
    }
}

#[async_trait]
impl Plugin for WaitPlugin {
    fn name(&self) -> &'static str {
        "wait"
    }

    async fn setup(
        &self,
        cintf: &mut ControllerInterface,
        _deploy_id: &str,
        _service_name: &str,
        version: &mut ServiceVersion,
    ) -> Result<Outcome> {
        let Some(target) = version.definition.kwarg("wait").and_then(Value::as_str) else {
            return Ok(Outcome::Pass);
        };
        // Accept a bare host:port as well as a URL-ish spelling.
        let addr = target
            .trim_start_matches("tcp://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();

        let ctx = cintf.ctx().clone();
        ctx.log(format!("Waiting for {target}")).await;
        if let Err(err) = wait_for_port(&addr).await {
            ctx.log(err.to_string()).await;
        }
        Ok(Outcome::Pass)
    }
}
