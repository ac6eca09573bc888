//! The process-wide controller root.
//!
//! One [`Controller`] exists per process. It owns the store handle, the
//! backend, the plugin list and the discovery adapter, all read-only after
//! startup; every operation opens its own [`ControllerInterface`] through
//! [`Controller::interface`].

use std::sync::Arc;

use tracing::info;

use stevedore_core::{Backend, Context, Discovery, Result, Store, token};
use stevedore_engine::{ControllerInterface, EngineSettings, PluginList};

use crate::config::Config;

pub struct Controller {
    config: Config,
    store: Store,
    backend: Arc<dyn Backend>,
    discovery: Arc<dyn Discovery>,
    plugins: PluginList,
    settings: Arc<EngineSettings>,
}

impl Controller {
    /// Wires up the controller root: creates the volume directory, opens
    /// (and migrates) the store.
    pub fn new(
        config: Config,
        host_ip: String,
        backend: Arc<dyn Backend>,
        discovery: Arc<dyn Discovery>,
        plugins: PluginList,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Store::open(&config.state_dir)?;
        let settings = Arc::new(EngineSettings {
            volume_base: config.data_dir.clone(),
            host_ip,
            slugbuilder_image: config.slugbuilder_image.clone(),
        });
        Ok(Controller {
            config,
            store,
            backend,
            discovery,
            plugins,
            settings,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Opens a fresh per-operation interface bound to `ctx`.
    pub fn interface(&self, ctx: Context) -> Result<ControllerInterface> {
        Ok(ControllerInterface::new(
            self.store.connection()?,
            ctx,
            Arc::clone(&self.backend),
            Arc::clone(&self.discovery),
            Arc::clone(&self.plugins),
            Arc::clone(&self.settings),
        ))
    }

    /// The stored API bearer token, if one was generated yet.
    pub fn auth_key(&self) -> Result<Option<String>> {
        Ok(self.store.connection()?.state.auth_key)
    }

    /// Returns the auth key, generating and persisting one on first boot.
    /// The second value says whether the key is new.
    pub fn ensure_auth_key(&self) -> Result<(String, bool)> {
        let mut conn = self.store.connection()?;
        if let Some(key) = conn.state.auth_key.clone() {
            return Ok((key, false));
        }
        let key = token::random_hex(32);
        conn.state.auth_key = Some(key.clone());
        conn.commit()?;
        Ok((key, true))
    }

    /// First-boot initialization: creates the `system` deployment and runs
    /// the `on_system_init` plugin chain. Returns whether anything was done.
    pub async fn bootstrap_system(&self) -> Result<bool> {
        {
            let conn = self.store.connection()?;
            if conn.state.deployments.contains_key("system") {
                return Ok(false);
            }
        }
        let mut cintf = self.interface(Context::null())?;
        cintf.create_deployment("system", false).await?;
        cintf.run_on_system_init().await?;
        cintf.commit()?;
        info!("initialized system deployment");
        Ok(true)
    }

    /// Registers the controller's own API endpoint with discovery, so other
    /// containers can address it.
    pub async fn register_self(&self) -> Result<()> {
        self.discovery
            .register("stevedore", self.config.api_port())
            .await
    }
}
