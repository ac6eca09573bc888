//! Host LAN address resolution.
//!
//! Containers are published on the host's LAN address, and every synthesized
//! environment points services at it (`DISCOVERD`, `ETCD`, the `SD_*`
//! variables). The `HOST_IP` override wins; otherwise the address of the
//! `docker0` bridge interface is used.

use crate::config::Config;
use crate::error::{ConfigError, ConfigResult};

const BRIDGE_INTERFACE: &str = "docker0";

/// Resolves the host address for the given configuration.
pub fn resolve_host_ip(config: &Config) -> ConfigResult<String> {
    if let Some(host_ip) = &config.host_ip {
        return Ok(host_ip.clone());
    }
    interface_ipv4(BRIDGE_INTERFACE).ok_or(ConfigError::HostIp)
}

fn interface_ipv4(name: &str) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name == name
            && let Some(address) = ifaddr.address
            && let Some(sin) = address.as_sockaddr_in()
        {
            return Some(sin.ip().to_string());
        }
    }
    None
}
