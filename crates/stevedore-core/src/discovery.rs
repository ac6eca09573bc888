//! Service discovery seam.
//!
//! Containers find each other through service discovery, never through
//! start order. The core only needs two operations: resolve a name to an
//! address, and register its own API endpoint so other containers can
//! address the controller.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Name-to-address resolution and self-registration.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolves a registered service name to a `host:port` address.
    async fn discover(&self, name: &str) -> Result<String>;

    /// Registers a service under `name` at the given port on this host.
    async fn register(&self, name: &str, port: u16) -> Result<()>;
}

/// A fixed name table, for tests and single-host bootstrap paths.
#[derive(Default)]
pub struct StaticDiscovery {
    entries: RwLock<BTreeMap<String, String>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.entries.write().insert(name.into(), address.into());
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, name: &str) -> Result<String> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Discovery(format!("unknown service: {name}")))
    }

    async fn register(&self, name: &str, port: u16) -> Result<()> {
        self.entries
            .write()
            .insert(name.to_string(), format!("127.0.0.1:{port}"));
        Ok(())
    }
}
