//! Daemon configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional YAML file,
//! and the environment. The environment names are the ones operators have
//! always used with the controller:
//!
//! | Variable | Field |
//! |---|---|
//! | `DEPLOY_DATA` | `data_dir` (service volumes) |
//! | `DEPLOY_STATE` | `state_dir` (database directory) |
//! | `DOCKER_HOST` | `docker_host` (backend connection URL) |
//! | `HOST_IP` | `host_ip` (override LAN address detection) |
//! | `SLUGBUILDER` | `slugbuilder_image` |
//! | `BIND` | `bind` |

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub bind: String,
    /// Root directory for service volumes.
    pub data_dir: PathBuf,
    /// Directory of the embedded database.
    pub state_dir: PathBuf,
    /// Docker API connection URL; the backend's default when unset.
    pub docker_host: Option<String>,
    /// Host LAN address; detected from the docker bridge when unset.
    pub host_ip: Option<String>,
    /// Builder image for application-from-source builds.
    pub slugbuilder_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "0.0.0.0:5555".to_string(),
            data_dir: PathBuf::from("/srv/vdata"),
            state_dir: PathBuf::from("/srv/vstate"),
            docker_host: None,
            host_ip: None,
            slugbuilder_image: "flynn/slugbuilder".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional file and the
    /// environment.
    pub fn load(file: Option<&Path>) -> ConfigResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            if !file.exists() {
                return Err(ConfigError::FileNotFound(file.to_path_buf()));
            }
            figment = figment.merge(Yaml::file(file));
        }
        let config = figment
            .merge(
                Env::raw()
                    .only(&[
                        "DEPLOY_DATA",
                        "DEPLOY_STATE",
                        "DOCKER_HOST",
                        "HOST_IP",
                        "SLUGBUILDER",
                        "BIND",
                    ])
                    .map(|key| match key.as_str().to_ascii_uppercase().as_str() {
                        "DEPLOY_DATA" => "data_dir".into(),
                        "DEPLOY_STATE" => "state_dir".into(),
                        "DOCKER_HOST" => "docker_host".into(),
                        "HOST_IP" => "host_ip".into(),
                        "SLUGBUILDER" => "slugbuilder_image".into(),
                        "BIND" => "bind".into(),
                        other => other.to_ascii_lowercase().into(),
                    }),
            )
            .extract()?;
        Ok(config)
    }

    /// The port of the `bind` address, for discovery self-registration.
    pub fn api_port(&self) -> u16 {
        self.bind
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .unwrap_or(5555)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_layout() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("/srv/vdata"));
        assert_eq!(config.state_dir, PathBuf::from("/srv/vstate"));
        assert_eq!(config.api_port(), 5555);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/does/not/exist.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn api_port_parses_the_bind_address() {
        let config = Config {
            bind: "127.0.0.1:8080".to_string(),
            ..Config::default()
        };
        assert_eq!(config.api_port(), 8080);
    }
}
