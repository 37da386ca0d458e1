//! Forwarding configuration types

use serde::{Deserialize, Serialize};

/// Current configuration file version
pub const CONFIG_VERSION: u32 = 1;

/// Daemon-wide settings for the forwarding core.
///
/// Every field has a default so a partial file (or none at all) loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Accept `tcpip-forward` global requests
    #[serde(default = "default_true")]
    pub remote_tcp_forwarding: bool,

    /// Accept `direct-tcpip` channels
    #[serde(default = "default_true")]
    pub local_tcp_forwarding: bool,

    /// Accept `direct-streamlocal@openssh.com` channels
    #[serde(default = "default_true")]
    pub local_streamlocal_forwarding: bool,

    /// Let remote forwards listen on non-loopback addresses
    #[serde(default)]
    pub listen_fwd_all: bool,

    /// Leave IP_TOS / IPV6_TCLASS untouched
    #[serde(default)]
    pub disable_ip_tos: bool,

    /// Network interface forwarding listeners bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Send queued packets in the SYN of outbound connections
    #[serde(default = "default_true")]
    pub tcp_fast_open: bool,

    /// Accept `<cid>%vsock` host names
    #[serde(default = "default_vsock")]
    pub vsock: bool,

    #[serde(default = "default_backlog")]
    pub listen_backlog: i32,

    /// Enable server-side TCP fast open on forwarding listeners
    #[serde(default)]
    pub listen_fast_open: bool,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

fn default_vsock() -> bool {
    cfg!(any(target_os = "linux", target_os = "android"))
}

fn default_backlog() -> i32 {
    128
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            remote_tcp_forwarding: true,
            local_tcp_forwarding: true,
            local_streamlocal_forwarding: true,
            listen_fwd_all: false,
            disable_ip_tos: false,
            interface: None,
            tcp_fast_open: true,
            vsock: default_vsock(),
            listen_backlog: default_backlog(),
            listen_fast_open: false,
        }
    }
}
