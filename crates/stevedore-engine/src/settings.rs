//! Resolved settings the controller interface works with.

use std::path::PathBuf;

/// Engine-level settings, resolved once at boot by the runtime layer.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root directory for service volumes:
    /// `<volume_base>/<deployment>/<service>/<volume>`. A `_cache` subtree
    /// is reserved for plugins.
    pub volume_base: PathBuf,
    /// The host LAN address containers are published on.
    pub host_ip: String,
    /// Builder image used for application-from-source builds.
    pub slugbuilder_image: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            volume_base: PathBuf::from("/srv/vdata"),
            host_ip: "127.0.0.1".to_string(),
            slugbuilder_image: "flynn/slugbuilder".to_string(),
        }
    }
}
