//! Built-in plugins.
//!
//! Registration order matters: hooks short-circuit at the first claim, and
//! the `requires` plugin goes last so every other plugin's `post_setup` has
//! run before holds on dependent services are released.

pub mod app;
pub mod bootstrap;
pub mod exec;
pub mod flynn_postgres;
pub mod generate;
pub mod gitreceive;
pub mod requires;
pub mod router;
pub mod sdutil;
pub mod wait;

use std::sync::Arc;

use crate::plugin::PluginList;

pub use app::AppPlugin;
pub use bootstrap::BootstrapPlugin;
pub use exec::ExecPlugin;
pub use flynn_postgres::FlynnPostgresPlugin;
pub use generate::GeneratePlugin;
pub use gitreceive::GitReceivePlugin;
pub use requires::RequiresPlugin;
pub use router::RouterPlugin;
pub use sdutil::SdutilPlugin;
pub use wait::WaitPlugin;

/// The default plugin stack, in registration order.
pub fn default_plugins() -> PluginList {
    Arc::new(vec![
        Arc::new(WaitPlugin),
        Arc::new(AppPlugin),
        Arc::new(GitReceivePlugin),
        Arc::new(FlynnPostgresPlugin::new()),
        Arc::new(GeneratePlugin),
        Arc::new(ExecPlugin),
        Arc::new(RouterPlugin::new()),
        Arc::new(SdutilPlugin),
        Arc::new(BootstrapPlugin),
        Arc::new(RequiresPlugin),
    ])
}
