//! Service discovery through the `sdutil` binary.
//!
//! All containers run on the same host, so lookups go through the local
//! discoverd at port 1111. Registration keeps an `sdutil register` child
//! process alive for as long as the controller runs; the registration
//! disappears with the process.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};

use stevedore_core::{Discovery, Error, Result};

pub struct SdutilDiscovery {
    host_ip: String,
    /// Address registrations should announce, when it differs from the
    /// discoverd host (the `CONTROLLER_IP` environment variable).
    controller_ip: Option<String>,
    children: Mutex<Vec<Child>>,
}

impl SdutilDiscovery {
    pub fn new(host_ip: impl Into<String>) -> Self {
        SdutilDiscovery {
            host_ip: host_ip.into(),
            controller_ip: std::env::var("CONTROLLER_IP").ok(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn discoverd(&self) -> String {
        format!("{}:1111", self.host_ip)
    }
}

#[async_trait]
impl Discovery for SdutilDiscovery {
    async fn discover(&self, name: &str) -> Result<String> {
        let output = Command::new("sdutil")
            .args(["services", "-1", name])
            .env("DISCOVERD", self.discoverd())
            .output()
            .await
            .map_err(|err| Error::Discovery(format!("cannot run sdutil: {err}")))?;
        if !output.status.success() {
            return Err(Error::Discovery(format!("no address for {name}")));
        }
        let address = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if address.is_empty() {
            return Err(Error::Discovery(format!("no address for {name}")));
        }
        Ok(address)
    }

    async fn register(&self, name: &str, port: u16) -> Result<()> {
        let mut command = Command::new("sdutil");
        command.arg("register");
        if let Some(controller_ip) = &self.controller_ip {
            command.args(["-h", controller_ip]);
        }
        command
            .arg(format!("{name}:{port}"))
            .env("DISCOVERD", self.discoverd())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|err| Error::Discovery(format!("cannot register {name}: {err}")))?;
        self.children.lock().push(child);
        Ok(())
    }
}
