//! # Stevedore Runtime
//!
//! Process-wide wiring for the stevedore deployment controller: the
//! [`Controller`] root, configuration loading, logging setup, host address
//! resolution and the sdutil-based discovery adapter.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod hostip;
pub mod logging;

pub use config::Config;
pub use controller::Controller;
pub use discovery::SdutilDiscovery;
pub use error::{ConfigError, ConfigResult};
pub use hostip::resolve_host_ip;
