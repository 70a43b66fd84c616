//! Runtime configuration for the concentrator.

use std::net::IpAddr;
use std::path::PathBuf;

/// Default hypervisor-facing (proxy) listen port.
pub const DEFAULT_PROXY_PORT: u16 = 13370;
/// Default admin protocol listen port.
pub const DEFAULT_ADMIN_PORT: u16 = 13371;
/// Default first per-guest subscriber port.
pub const DEFAULT_VM_PORT_START: u16 = 50000;
/// Default orphan expiry, in seconds (one day).
pub const DEFAULT_EXPIRE_SECS: u64 = 86400;

/// TLS material for the hypervisor listener (PEM files).
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address all listeners bind to.
    pub listen_addr: IpAddr,
    /// Hypervisor-facing telnet listener.
    pub proxy_port: u16,
    /// Admin protocol listener.
    pub admin_port: u16,
    /// First per-guest port; `None` disables per-guest listeners
    /// entirely (subscribers must use the admin path).
    pub vm_port_start: Option<u16>,
    /// Seconds a guest may stay orphaned before eviction.
    pub vm_expire_secs: u64,
    /// When set, the hypervisor listener speaks TLS.
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::from([0, 0, 0, 0]),
            proxy_port: DEFAULT_PROXY_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            vm_port_start: Some(DEFAULT_VM_PORT_START),
            vm_expire_secs: DEFAULT_EXPIRE_SECS,
            tls: None,
        }
    }
}
