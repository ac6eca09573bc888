//! # Stevedore Engine
//!
//! The controller engine: the per-operation [`ControllerInterface`] facade,
//! runcfg synthesis, the plugin hook protocol with its ordered short-circuit
//! dispatch, and the built-in plugin stack.
//!
//! The engine is built on `stevedore-core` types; process-wide wiring
//! (configuration, the controller root, the HTTP edge) lives in
//! `stevedore-runtime` and `stevedore-api`.

pub mod interface;
pub mod plugin;
pub mod plugins;
pub mod runcfg;
pub mod settings;
pub mod testing;
pub mod vars;

pub use interface::ControllerInterface;
pub use plugin::{Outcome, Plugin, PluginApiRequest, PluginList, UploadedFiles};
pub use plugins::default_plugins;
pub use runcfg::{PortAssignment, PortAssignments};
pub use settings::EngineSettings;
pub use vars::substitute;
